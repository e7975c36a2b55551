//! Accelerator runtime binding (Horizon hbDNN, `libdnn.so`).

use anyhow::{anyhow, Context, Result};
use std::ffi::{CStr, CString};
use std::path::Path;
use std::ptr;

use super::ffi;
use super::library::DynamicLibrary;
use super::tensor::{ElementType, OutputTensor, Quantization, TensorDescriptor, TensorLayout};

/// Runs one compiled model on the accelerator.
pub trait AcceleratorRuntime: Send {
    /// Declared outputs of the loaded model, in output index order.
    fn output_descriptors(&self) -> Vec<TensorDescriptor>;

    /// Model input `(width, height)`.
    fn input_size(&self) -> (u32, u32);

    /// Run inference on one NV12 image of exactly the input size.
    fn forward(&mut self, nv12: &[u8]) -> Result<Vec<OutputTensor>>;
}

struct DnnApi {
    initialize_from_files: ffi::HbDnnInitializeFromFiles,
    get_model_name_list: ffi::HbDnnGetModelNameList,
    get_model_handle: ffi::HbDnnGetModelHandle,
    get_input_count: ffi::HbDnnGetCount,
    get_output_count: ffi::HbDnnGetCount,
    get_input_properties: ffi::HbDnnGetTensorProperties,
    get_output_properties: ffi::HbDnnGetTensorProperties,
    infer: ffi::HbDnnInfer,
    wait_task_done: ffi::HbDnnWaitTaskDone,
    release_task: ffi::HbDnnReleaseTask,
    release: ffi::HbDnnRelease,
    alloc_cached_mem: ffi::HbSysAllocCachedMem,
    flush_mem: ffi::HbSysFlushMem,
    free_mem: ffi::HbSysFreeMem,
}

impl DnnApi {
    fn resolve(library: &DynamicLibrary) -> Result<Self> {
        unsafe {
            Ok(Self {
                initialize_from_files: library.symbol("hbDNNInitializeFromFiles")?,
                get_model_name_list: library.symbol("hbDNNGetModelNameList")?,
                get_model_handle: library.symbol("hbDNNGetModelHandle")?,
                get_input_count: library.symbol("hbDNNGetInputCount")?,
                get_output_count: library.symbol("hbDNNGetOutputCount")?,
                get_input_properties: library.symbol("hbDNNGetInputTensorProperties")?,
                get_output_properties: library.symbol("hbDNNGetOutputTensorProperties")?,
                infer: library.symbol("hbDNNInfer")?,
                wait_task_done: library.symbol("hbDNNWaitTaskDone")?,
                release_task: library.symbol("hbDNNReleaseTask")?,
                release: library.symbol("hbDNNRelease")?,
                alloc_cached_mem: library.symbol("hbSysAllocCachedMem")?,
                flush_mem: library.symbol("hbSysFlushMem")?,
                free_mem: library.symbol("hbSysFreeMem")?,
            })
        }
    }
}

fn check(rc: i32, what: &str) -> Result<()> {
    if rc != 0 {
        return Err(anyhow!("{} failed with code {}", what, rc));
    }
    Ok(())
}

struct OutputSlot {
    properties: ffi::hbDNNTensorProperties,
    mem: ffi::hbSysMem,
    descriptor: TensorDescriptor,
}

pub struct HobotDnnRuntime {
    api: DnnApi,
    packed: ffi::hbPackedDNNHandle_t,
    handle: ffi::hbDNNHandle_t,
    input_properties: ffi::hbDNNTensorProperties,
    input_mem: ffi::hbSysMem,
    input_size: (u32, u32),
    outputs: Vec<OutputSlot>,
    // kept last so symbols stay valid until Drop has run
    _library: DynamicLibrary,
}

// Handles are only touched through &mut self.
unsafe impl Send for HobotDnnRuntime {}

impl HobotDnnRuntime {
    pub fn load(dnn_library: &Path, model_path: &Path) -> Result<Self> {
        if !model_path.exists() {
            return Err(anyhow!("model artifact {} not found", model_path.display()));
        }
        let library = DynamicLibrary::open(dnn_library).context("load accelerator runtime")?;
        let api = DnnApi::resolve(&library)?;

        let c_model = CString::new(model_path.to_string_lossy().as_bytes())
            .map_err(|_| anyhow!("model path contains NUL"))?;
        let model_files = [c_model.as_ptr()];
        let mut packed: ffi::hbPackedDNNHandle_t = ptr::null_mut();
        check(
            unsafe { (api.initialize_from_files)(&mut packed, model_files.as_ptr(), 1) },
            "hbDNNInitializeFromFiles",
        )?;

        let mut runtime = Self {
            api,
            packed,
            handle: ptr::null_mut(),
            input_properties: ffi::hbDNNTensorProperties::default(),
            input_mem: ffi::hbSysMem::default(),
            input_size: (0, 0),
            outputs: Vec::new(),
            _library: library,
        };
        runtime.bind_model()?;
        log::info!(
            "loaded {} on accelerator: input {}x{}, {} outputs",
            model_path.display(),
            runtime.input_size.0,
            runtime.input_size.1,
            runtime.outputs.len()
        );
        Ok(runtime)
    }

    fn bind_model(&mut self) -> Result<()> {
        let mut names: *const *const std::os::raw::c_char = ptr::null();
        let mut name_count = 0i32;
        check(
            unsafe { (self.api.get_model_name_list)(&mut names, &mut name_count, self.packed) },
            "hbDNNGetModelNameList",
        )?;
        if names.is_null() || name_count < 1 {
            return Err(anyhow!("model package contains no models"));
        }
        let first = unsafe { *names };
        let model_name = unsafe { CStr::from_ptr(first) }.to_string_lossy().into_owned();
        check(
            unsafe { (self.api.get_model_handle)(&mut self.handle, self.packed, first) },
            "hbDNNGetModelHandle",
        )?;

        let mut input_count = 0i32;
        check(
            unsafe { (self.api.get_input_count)(&mut input_count, self.handle) },
            "hbDNNGetInputCount",
        )?;
        if input_count != 1 {
            return Err(anyhow!("model {} has {} inputs, expected 1", model_name, input_count));
        }
        check(
            unsafe { (self.api.get_input_properties)(&mut self.input_properties, self.handle, 0) },
            "hbDNNGetInputTensorProperties",
        )?;
        if self.input_properties.tensorType != ffi::HB_DNN_IMG_TYPE_NV12 {
            return Err(anyhow!(
                "model {} input type {} is not NV12",
                model_name,
                self.input_properties.tensorType
            ));
        }
        let input_shape = self.input_properties.validShape.dims();
        let layout = TensorLayout::from_raw(self.input_properties.tensorLayout);
        let (h, w) = TensorDescriptor::float(input_shape.clone(), layout)
            .spatial()
            .ok_or_else(|| anyhow!("model input shape {:?} is not rank 4", input_shape))?;
        self.input_size = (w as u32, h as u32);
        self.input_mem = self.alloc(self.input_properties.alignedByteSize)?;

        let mut output_count = 0i32;
        check(
            unsafe { (self.api.get_output_count)(&mut output_count, self.handle) },
            "hbDNNGetOutputCount",
        )?;
        for index in 0..output_count {
            let mut properties = ffi::hbDNNTensorProperties::default();
            check(
                unsafe { (self.api.get_output_properties)(&mut properties, self.handle, index) },
                "hbDNNGetOutputTensorProperties",
            )?;
            let descriptor = describe_output(&properties)
                .with_context(|| format!("describe output {}", index))?;
            let mem = self.alloc(properties.alignedByteSize)?;
            self.outputs.push(OutputSlot {
                properties,
                mem,
                descriptor,
            });
        }
        Ok(())
    }

    fn alloc(&self, size: i32) -> Result<ffi::hbSysMem> {
        if size <= 0 {
            return Err(anyhow!("tensor reports invalid byte size {}", size));
        }
        let mut mem = ffi::hbSysMem::default();
        check(
            unsafe { (self.api.alloc_cached_mem)(&mut mem, size as u32) },
            "hbSysAllocCachedMem",
        )?;
        Ok(mem)
    }
}

/// Translate vendor output properties into a descriptor of the valid region.
fn describe_output(properties: &ffi::hbDNNTensorProperties) -> Result<TensorDescriptor> {
    let shape = properties.validShape.dims();
    let layout = TensorLayout::from_raw(properties.tensorLayout);
    let element = match properties.tensorType {
        ffi::HB_DNN_TENSOR_TYPE_F32 => ElementType::F32,
        ffi::HB_DNN_TENSOR_TYPE_S32 => ElementType::I32,
        other => return Err(anyhow!("unsupported output tensor type {}", other)),
    };
    let quantization = match properties.quantiType {
        ffi::NONE => Quantization::None,
        ffi::SCALE => {
            let scale = &properties.scale;
            let scales = copy_raw(scale.scaleData, scale.scaleLen);
            let zero_points = copy_raw(scale.zeroPointData, scale.zeroPointLen)
                .into_iter()
                .map(i32::from)
                .collect();
            Quantization::Linear {
                scales,
                zero_points,
            }
        }
        ffi::SHIFT => {
            let shift = &properties.shift;
            let scales = copy_raw(shift.shiftData, shift.shiftLen)
                .into_iter()
                .map(|s| 2f32.powi(-(s as i32)))
                .collect();
            Quantization::Linear {
                scales,
                zero_points: Vec::new(),
            }
        }
        other => return Err(anyhow!("unsupported quantization type {}", other)),
    };
    if element == ElementType::F32 && quantization != Quantization::None {
        return Err(anyhow!("float output declares quantization"));
    }
    let mut descriptor = TensorDescriptor {
        shape,
        layout,
        element,
        quantization,
    };
    descriptor.validate()?;
    Ok(descriptor)
}

fn copy_raw<T: Copy>(data: *mut T, len: i32) -> Vec<T> {
    if data.is_null() || len <= 0 {
        return Vec::new();
    }
    unsafe { std::slice::from_raw_parts(data, len as usize) }.to_vec()
}

/// Copy the valid region out of a padded (aligned) row-major buffer.
pub(crate) fn crop_to_valid<T: Copy>(src: &[T], aligned: &[usize], valid: &[usize]) -> Result<Vec<T>> {
    if aligned.len() != valid.len() || aligned.iter().zip(valid).any(|(a, v)| v > a) {
        return Err(anyhow!(
            "valid shape {:?} does not fit aligned shape {:?}",
            valid,
            aligned
        ));
    }
    let aligned_len: usize = aligned.iter().product();
    if src.len() < aligned_len {
        return Err(anyhow!(
            "buffer holds {} elements, aligned shape needs {}",
            src.len(),
            aligned_len
        ));
    }
    if aligned == valid {
        return Ok(src[..aligned_len].to_vec());
    }

    let rank = valid.len();
    let mut strides = vec![1usize; rank];
    for d in (0..rank.saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * aligned[d + 1];
    }
    let total: usize = valid.iter().product();
    let mut out = Vec::with_capacity(total);
    let mut index = vec![0usize; rank];
    for _ in 0..total {
        let offset: usize = index.iter().zip(&strides).map(|(i, s)| i * s).sum();
        out.push(src[offset]);
        for d in (0..rank).rev() {
            index[d] += 1;
            if index[d] < valid[d] {
                break;
            }
            index[d] = 0;
        }
    }
    Ok(out)
}

impl AcceleratorRuntime for HobotDnnRuntime {
    fn output_descriptors(&self) -> Vec<TensorDescriptor> {
        self.outputs.iter().map(|o| o.descriptor.clone()).collect()
    }

    fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    fn forward(&mut self, nv12: &[u8]) -> Result<Vec<OutputTensor>> {
        let (w, h) = self.input_size;
        let expected = (w as usize) * (h as usize) * 3 / 2;
        if nv12.len() != expected {
            return Err(anyhow!(
                "NV12 input must be {} bytes for {}x{}, got {}",
                expected,
                w,
                h,
                nv12.len()
            ));
        }
        if nv12.len() > self.input_mem.memSize as usize {
            return Err(anyhow!("NV12 input exceeds the allocated input buffer"));
        }
        unsafe {
            ptr::copy_nonoverlapping(nv12.as_ptr(), self.input_mem.virAddr as *mut u8, nv12.len());
        }
        check(
            unsafe { (self.api.flush_mem)(&mut self.input_mem, ffi::HB_SYS_MEM_CACHE_CLEAN) },
            "hbSysFlushMem",
        )?;

        let mut input = ffi::hbDNNTensor::default();
        input.sysMem[0] = self.input_mem;
        input.properties = self.input_properties;

        let mut output_tensors: Vec<ffi::hbDNNTensor> = self
            .outputs
            .iter()
            .map(|slot| {
                let mut tensor = ffi::hbDNNTensor::default();
                tensor.sysMem[0] = slot.mem;
                tensor.properties = slot.properties;
                tensor
            })
            .collect();
        let mut output_ptr = output_tensors.as_mut_ptr();
        let mut task: ffi::hbDNNTaskHandle_t = ptr::null_mut();
        let mut ctrl = ffi::hbDNNInferCtrlParam::default();

        check(
            unsafe { (self.api.infer)(&mut task, &mut output_ptr, &input, self.handle, &mut ctrl) },
            "hbDNNInfer",
        )?;
        let waited = check(unsafe { (self.api.wait_task_done)(task, 0) }, "hbDNNWaitTaskDone");
        let released = check(unsafe { (self.api.release_task)(task) }, "hbDNNReleaseTask");
        waited?;
        released?;

        let mut results = Vec::with_capacity(self.outputs.len());
        for slot in self.outputs.iter_mut() {
            check(
                unsafe { (self.api.flush_mem)(&mut slot.mem, ffi::HB_SYS_MEM_CACHE_INVALIDATE) },
                "hbSysFlushMem",
            )?;
            let aligned = slot.properties.alignedShape.dims();
            let valid = slot.properties.validShape.dims();
            let count: usize = aligned.iter().product();
            let tensor = match slot.descriptor.element {
                ElementType::F32 => {
                    let raw = unsafe { std::slice::from_raw_parts(slot.mem.virAddr as *const f32, count) };
                    OutputTensor::f32(crop_to_valid(raw, &aligned, &valid)?)
                }
                ElementType::I32 => {
                    let raw = unsafe { std::slice::from_raw_parts(slot.mem.virAddr as *const i32, count) };
                    OutputTensor::i32(crop_to_valid(raw, &aligned, &valid)?)
                }
            };
            results.push(tensor);
        }
        Ok(results)
    }
}

impl Drop for HobotDnnRuntime {
    fn drop(&mut self) {
        for slot in self.outputs.iter_mut() {
            if !slot.mem.virAddr.is_null() {
                unsafe { (self.api.free_mem)(&mut slot.mem) };
            }
        }
        if !self.input_mem.virAddr.is_null() {
            unsafe { (self.api.free_mem)(&mut self.input_mem) };
        }
        if !self.packed.is_null() {
            unsafe { (self.api.release)(self.packed) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crop_removes_channel_padding() {
        // aligned [1, 2, 2, 4], valid [1, 2, 2, 3]
        let src: Vec<i32> = (0..16).collect();
        let out = crop_to_valid(&src, &[1, 2, 2, 4], &[1, 2, 2, 3]).unwrap();
        assert_eq!(out, vec![0, 1, 2, 4, 5, 6, 8, 9, 10, 12, 13, 14]);
    }

    #[test]
    fn crop_identity_when_shapes_match() {
        let src = vec![1.0f32, 2.0, 3.0, 4.0];
        assert_eq!(crop_to_valid(&src, &[1, 4], &[1, 4]).unwrap(), src);
    }

    #[test]
    fn crop_rejects_oversized_valid_shape() {
        let src = vec![0u8; 4];
        assert!(crop_to_valid(&src, &[1, 4], &[1, 5]).is_err());
        assert!(crop_to_valid(&src, &[1, 8], &[1, 4]).is_err());
    }

    #[test]
    fn shift_quantization_becomes_scales() {
        let mut shifts = vec![2u8, 3u8];
        let mut props = ffi::hbDNNTensorProperties::default();
        props.validShape = ffi::hbDNNTensorShape::from_dims(&[1, 1, 1, 2]);
        props.tensorType = ffi::HB_DNN_TENSOR_TYPE_S32;
        props.quantiType = ffi::SHIFT;
        props.shift.shiftLen = 2;
        props.shift.shiftData = shifts.as_mut_ptr();
        let desc = describe_output(&props).unwrap();
        assert_eq!(
            desc.quantization,
            Quantization::Linear {
                scales: vec![0.25, 0.125],
                zero_points: vec![0, 0],
            }
        );
    }

    #[test]
    fn missing_model_is_reported_first() {
        let err = HobotDnnRuntime::load(Path::new("/nonexistent/libdnn.so"), Path::new("/nonexistent/model.bin"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("model artifact"));
    }
}
