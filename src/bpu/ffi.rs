//! C layouts of the accelerator runtime and the FCOS post-processing library.
//!
//! Field order, widths and array lengths must match the vendor headers
//! exactly; both libraries read these structs by value and by pointer.

#![allow(non_snake_case, non_camel_case_types)]

use std::os::raw::{c_char, c_float, c_int, c_void};

pub(crate) const HB_DNN_TENSOR_MAX_DIMENSIONS: usize = 8;

pub(crate) const HB_DNN_LAYOUT_NHWC: i32 = 0;
pub(crate) const HB_DNN_LAYOUT_NCHW: i32 = 2;

pub(crate) const NONE: i32 = 0;
pub(crate) const SHIFT: i32 = 1;
pub(crate) const SCALE: i32 = 2;

pub(crate) const HB_DNN_IMG_TYPE_NV12: i32 = 1;
pub(crate) const HB_DNN_TENSOR_TYPE_F32: i32 = 13;
pub(crate) const HB_DNN_TENSOR_TYPE_S32: i32 = 14;

pub(crate) const HB_SYS_MEM_CACHE_INVALIDATE: i32 = 1;
pub(crate) const HB_SYS_MEM_CACHE_CLEAN: i32 = 2;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct hbSysMem {
    pub phyAddr: u64,
    pub virAddr: *mut c_void,
    pub memSize: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct hbDNNQuantiShift {
    pub shiftLen: i32,
    pub shiftData: *mut u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct hbDNNQuantiScale {
    pub scaleLen: i32,
    pub scaleData: *mut c_float,
    pub zeroPointLen: i32,
    pub zeroPointData: *mut i8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct hbDNNTensorShape {
    pub dimensionSize: [i32; HB_DNN_TENSOR_MAX_DIMENSIONS],
    pub numDimensions: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct hbDNNTensorProperties {
    pub validShape: hbDNNTensorShape,
    pub alignedShape: hbDNNTensorShape,
    pub tensorLayout: i32,
    pub tensorType: i32,
    pub shift: hbDNNQuantiShift,
    pub scale: hbDNNQuantiScale,
    pub quantiType: i32,
    pub quantizeAxis: i32,
    pub alignedByteSize: i32,
    pub stride: [i32; HB_DNN_TENSOR_MAX_DIMENSIONS],
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct hbDNNTensor {
    pub sysMem: [hbSysMem; 4],
    pub properties: hbDNNTensorProperties,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct hbDNNInferCtrlParam {
    pub bpuCoreId: i32,
    pub dspCoreId: i32,
    pub priority: i32,
    pub more: i32,
    pub customId: i64,
    pub reserved1: i32,
    pub reserved2: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct FcosPostProcessInfo {
    pub height: c_int,
    pub width: c_int,
    pub ori_height: c_int,
    pub ori_width: c_int,
    pub score_threshold: c_float,
    pub nms_threshold: c_float,
    pub nms_top_k: c_int,
    pub is_pad_resize: c_int,
}

pub(crate) type hbPackedDNNHandle_t = *mut c_void;
pub(crate) type hbDNNHandle_t = *mut c_void;
pub(crate) type hbDNNTaskHandle_t = *mut c_void;

pub(crate) type HbDnnInitializeFromFiles =
    unsafe extern "C" fn(*mut hbPackedDNNHandle_t, *const *const c_char, i32) -> i32;
pub(crate) type HbDnnGetModelNameList =
    unsafe extern "C" fn(*mut *const *const c_char, *mut i32, hbPackedDNNHandle_t) -> i32;
pub(crate) type HbDnnGetModelHandle =
    unsafe extern "C" fn(*mut hbDNNHandle_t, hbPackedDNNHandle_t, *const c_char) -> i32;
pub(crate) type HbDnnGetCount = unsafe extern "C" fn(*mut i32, hbDNNHandle_t) -> i32;
pub(crate) type HbDnnGetTensorProperties =
    unsafe extern "C" fn(*mut hbDNNTensorProperties, hbDNNHandle_t, i32) -> i32;
pub(crate) type HbDnnInfer = unsafe extern "C" fn(
    *mut hbDNNTaskHandle_t,
    *mut *mut hbDNNTensor,
    *const hbDNNTensor,
    hbDNNHandle_t,
    *mut hbDNNInferCtrlParam,
) -> i32;
pub(crate) type HbDnnWaitTaskDone = unsafe extern "C" fn(hbDNNTaskHandle_t, i32) -> i32;
pub(crate) type HbDnnReleaseTask = unsafe extern "C" fn(hbDNNTaskHandle_t) -> i32;
pub(crate) type HbDnnRelease = unsafe extern "C" fn(hbPackedDNNHandle_t) -> i32;
pub(crate) type HbSysAllocCachedMem = unsafe extern "C" fn(*mut hbSysMem, u32) -> i32;
pub(crate) type HbSysFlushMem = unsafe extern "C" fn(*mut hbSysMem, i32) -> i32;
pub(crate) type HbSysFreeMem = unsafe extern "C" fn(*mut hbSysMem) -> i32;

pub(crate) type FcosDoProcess = unsafe extern "C" fn(
    hbDNNTensor,
    hbDNNTensor,
    hbDNNTensor,
    *mut FcosPostProcessInfo,
    c_int,
);
pub(crate) type FcosPostProcess = unsafe extern "C" fn(*mut FcosPostProcessInfo) -> *const c_char;

impl hbDNNTensorShape {
    pub(crate) fn from_dims(dims: &[usize]) -> Self {
        let mut dimensionSize = [0i32; HB_DNN_TENSOR_MAX_DIMENSIONS];
        for (slot, dim) in dimensionSize.iter_mut().zip(dims) {
            *slot = *dim as i32;
        }
        Self {
            dimensionSize,
            numDimensions: dims.len().min(HB_DNN_TENSOR_MAX_DIMENSIONS) as i32,
        }
    }

    pub(crate) fn dims(&self) -> Vec<usize> {
        let n = (self.numDimensions.max(0) as usize).min(HB_DNN_TENSOR_MAX_DIMENSIONS);
        self.dimensionSize[..n]
            .iter()
            .map(|d| (*d).max(0) as usize)
            .collect()
    }
}

impl Default for hbSysMem {
    fn default() -> Self {
        Self {
            phyAddr: 0,
            virAddr: std::ptr::null_mut(),
            memSize: 0,
        }
    }
}

impl Default for hbDNNTensorProperties {
    fn default() -> Self {
        Self {
            validShape: hbDNNTensorShape::from_dims(&[]),
            alignedShape: hbDNNTensorShape::from_dims(&[]),
            tensorLayout: HB_DNN_LAYOUT_NHWC,
            tensorType: HB_DNN_TENSOR_TYPE_F32,
            shift: hbDNNQuantiShift {
                shiftLen: 0,
                shiftData: std::ptr::null_mut(),
            },
            scale: hbDNNQuantiScale {
                scaleLen: 0,
                scaleData: std::ptr::null_mut(),
                zeroPointLen: 0,
                zeroPointData: std::ptr::null_mut(),
            },
            quantiType: NONE,
            quantizeAxis: 0,
            alignedByteSize: 0,
            stride: [0; HB_DNN_TENSOR_MAX_DIMENSIONS],
        }
    }
}

impl Default for hbDNNTensor {
    fn default() -> Self {
        Self {
            sysMem: [hbSysMem::default(); 4],
            properties: hbDNNTensorProperties::default(),
        }
    }
}

impl Default for hbDNNInferCtrlParam {
    fn default() -> Self {
        Self {
            bpuCoreId: 0,
            dspCoreId: 0,
            priority: 0,
            more: 0,
            customId: 0,
            reserved1: 0,
            reserved2: 0,
        }
    }
}
