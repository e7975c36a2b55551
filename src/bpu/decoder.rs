//! Per-stride FCOS decoding.
//!
//! A decoder is fed the three tensors of one stride at a time (class scores,
//! box distances, centerness) and accumulates candidates. `finalize` runs NMS
//! and returns the textual result, `post_process_result:` followed by a JSON
//! array of `{bbox, score, id, name}` records in original-frame pixels.
//!
//! `NativeFcosDecoder` delegates both steps to the vendor `libpostprocess.so`.
//! `BuiltinFcosDecoder` does the same work in Rust and produces the same text.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::ffi::CStr;
use std::path::Path;

use super::ffi;
use super::library::DynamicLibrary;
use super::tensor::{ElementType, OutputTensor, Quantization, TensorData, TensorDescriptor};

pub const FCOS_STRIDES: [usize; 5] = [8, 16, 32, 64, 128];
pub const RESULT_PREFIX: &str = "post_process_result:";

/// Decode parameters shared by every stride of one frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DecodeConfig {
    pub model_height: u32,
    pub model_width: u32,
    pub ori_height: u32,
    pub ori_width: u32,
    pub score_threshold: f32,
    pub nms_threshold: f32,
    pub nms_top_k: u32,
    /// 0 = stretch resize, 1 = letterbox (aspect-preserving, centred padding).
    pub pad_resize: u32,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            model_height: 512,
            model_width: 512,
            ori_height: 1080,
            ori_width: 1920,
            score_threshold: 0.5,
            nms_threshold: 0.6,
            nms_top_k: 5,
            pad_resize: 0,
        }
    }
}

impl DecodeConfig {
    fn to_raw(self) -> ffi::FcosPostProcessInfo {
        ffi::FcosPostProcessInfo {
            height: self.model_height as i32,
            width: self.model_width as i32,
            ori_height: self.ori_height as i32,
            ori_width: self.ori_width as i32,
            score_threshold: self.score_threshold,
            nms_threshold: self.nms_threshold,
            nms_top_k: self.nms_top_k as i32,
            is_pad_resize: self.pad_resize as i32,
        }
    }
}

/// One output buffer paired with its descriptor.
#[derive(Clone, Copy, Debug)]
pub struct BoundTensor<'a> {
    pub descriptor: &'a TensorDescriptor,
    pub tensor: &'a OutputTensor,
}

pub trait StrideDecoder: Send {
    fn name(&self) -> &'static str;

    fn decode_stride(
        &mut self,
        cls: BoundTensor<'_>,
        bbox: BoundTensor<'_>,
        centerness: BoundTensor<'_>,
        config: &DecodeConfig,
        stride_index: usize,
    ) -> Result<()>;

    fn finalize(&mut self, config: &DecodeConfig) -> Result<String>;
}

/// Record emitted by `finalize`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecodedBox {
    pub bbox: [f32; 4],
    pub score: f32,
    #[serde(default)]
    pub id: i32,
    #[serde(default)]
    pub name: String,
}

// ----------------------------------------------------------------------------
// Native decoder (libpostprocess.so)
// ----------------------------------------------------------------------------

pub struct NativeFcosDecoder {
    do_process: ffi::FcosDoProcess,
    post_process: ffi::FcosPostProcess,
    info: ffi::FcosPostProcessInfo,
    library: DynamicLibrary,
}

impl NativeFcosDecoder {
    pub fn load(path: &Path) -> Result<Self> {
        let library = DynamicLibrary::open(path).context("load FCOS post-processing library")?;
        let do_process = unsafe { library.symbol::<ffi::FcosDoProcess>("FcosdoProcess")? };
        let post_process = unsafe { library.symbol::<ffi::FcosPostProcess>("FcosPostProcess")? };
        log::info!("FCOS post-processing bound to {}", library.path().display());
        Ok(Self {
            do_process,
            post_process,
            info: DecodeConfig::default().to_raw(),
            library,
        })
    }
}

/// Raw tensor view borrowing `bound`'s buffers. Valid while `bound` lives.
fn raw_tensor(bound: &BoundTensor<'_>) -> ffi::hbDNNTensor {
    let mut raw = ffi::hbDNNTensor::default();
    let shape = ffi::hbDNNTensorShape::from_dims(&bound.descriptor.shape);
    raw.properties.validShape = shape;
    raw.properties.alignedShape = shape;
    raw.properties.tensorLayout = bound.descriptor.layout.to_raw();

    let (ptr, bytes, tensor_type) = match &bound.tensor.data {
        TensorData::F32(v) => (
            v.as_ptr() as *mut std::os::raw::c_void,
            std::mem::size_of_val(v.as_slice()),
            ffi::HB_DNN_TENSOR_TYPE_F32,
        ),
        TensorData::I32(v) => (
            v.as_ptr() as *mut std::os::raw::c_void,
            std::mem::size_of_val(v.as_slice()),
            ffi::HB_DNN_TENSOR_TYPE_S32,
        ),
    };
    raw.properties.tensorType = tensor_type;
    raw.properties.alignedByteSize = bytes as i32;
    raw.sysMem[0].virAddr = ptr;
    raw.sysMem[0].memSize = bytes as u32;

    if let Quantization::Linear { scales, .. } = &bound.descriptor.quantization {
        raw.properties.quantiType = ffi::SCALE;
        raw.properties.quantizeAxis = bound.descriptor.shape.len() as i32 - 1;
        raw.properties.scale.scaleLen = scales.len() as i32;
        raw.properties.scale.scaleData = scales.as_ptr() as *mut f32;
    } else {
        raw.properties.quantiType = ffi::NONE;
    }
    raw
}

impl StrideDecoder for NativeFcosDecoder {
    fn name(&self) -> &'static str {
        "native"
    }

    fn decode_stride(
        &mut self,
        cls: BoundTensor<'_>,
        bbox: BoundTensor<'_>,
        centerness: BoundTensor<'_>,
        config: &DecodeConfig,
        stride_index: usize,
    ) -> Result<()> {
        self.info = config.to_raw();
        let (cls_raw, bbox_raw, ce_raw) = (raw_tensor(&cls), raw_tensor(&bbox), raw_tensor(&centerness));
        unsafe {
            (self.do_process)(
                cls_raw,
                bbox_raw,
                ce_raw,
                &mut self.info as *mut ffi::FcosPostProcessInfo,
                stride_index as i32,
            )
        };
        Ok(())
    }

    fn finalize(&mut self, config: &DecodeConfig) -> Result<String> {
        self.info = config.to_raw();
        let result = unsafe { (self.post_process)(&mut self.info as *mut ffi::FcosPostProcessInfo) };
        if result.is_null() {
            return Ok(String::new());
        }
        Ok(unsafe { CStr::from_ptr(result) }
            .to_string_lossy()
            .into_owned())
    }
}

impl std::fmt::Debug for NativeFcosDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFcosDecoder")
            .field("library", &self.library.path())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Builtin decoder
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
struct Candidate {
    bbox: [f32; 4],
    score: f32,
    class: usize,
}

#[derive(Debug, Default)]
pub struct BuiltinFcosDecoder {
    candidates: Vec<Candidate>,
}

impl BuiltinFcosDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Flat offset of `(channel, y, x)` in a rank-4 tensor with batch 1.
fn offset(descriptor: &TensorDescriptor, channel: usize, y: usize, x: usize) -> usize {
    let (h, w) = descriptor.spatial().unwrap_or((1, 1));
    let c = descriptor.channels().unwrap_or(1);
    match descriptor.layout {
        super::tensor::TensorLayout::Nhwc => (y * w + x) * c + channel,
        super::tensor::TensorLayout::Nchw => channel * h * w + y * w + x,
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Map a model-input coordinate pair back to the original frame.
fn to_original(x: f32, y: f32, config: &DecodeConfig) -> (f32, f32) {
    let (mw, mh) = (config.model_width as f32, config.model_height as f32);
    let (ow, oh) = (config.ori_width as f32, config.ori_height as f32);
    if config.pad_resize == 0 {
        return (x * ow / mw, y * oh / mh);
    }
    let scale = (mw / ow).min(mh / oh);
    let pad_x = (mw - ow * scale) / 2.0;
    let pad_y = (mh - oh * scale) / 2.0;
    ((x - pad_x) / scale, (y - pad_y) / scale)
}

pub(crate) fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix1 = a[0].max(b[0]);
    let iy1 = a[1].max(b[1]);
    let ix2 = a[2].min(b[2]);
    let iy2 = a[3].min(b[3]);
    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        return 0.0;
    }
    inter / union
}

impl StrideDecoder for BuiltinFcosDecoder {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn decode_stride(
        &mut self,
        cls: BoundTensor<'_>,
        bbox: BoundTensor<'_>,
        centerness: BoundTensor<'_>,
        config: &DecodeConfig,
        stride_index: usize,
    ) -> Result<()> {
        let stride = *FCOS_STRIDES
            .get(stride_index)
            .ok_or_else(|| anyhow!("stride index {} out of range", stride_index))?
            as f32;
        let (h, w) = cls
            .descriptor
            .spatial()
            .ok_or_else(|| anyhow!("classification tensor must be rank 4"))?;
        let classes = cls.descriptor.channels().unwrap_or(0);

        for y in 0..h {
            for x in 0..w {
                let mut best = (0usize, f32::MIN);
                for c in 0..classes {
                    let v = cls.tensor.value(cls.descriptor, offset(cls.descriptor, c, y, x));
                    if v > best.1 {
                        best = (c, v);
                    }
                }
                if classes == 0 {
                    continue;
                }
                let ce = sigmoid(
                    centerness
                        .tensor
                        .value(centerness.descriptor, offset(centerness.descriptor, 0, y, x)),
                );
                let score = (sigmoid(best.1) * ce).sqrt();
                if score <= config.score_threshold {
                    continue;
                }

                // distances are in stride units
                let dist: Vec<f32> = (0..4)
                    .map(|k| bbox.tensor.value(bbox.descriptor, offset(bbox.descriptor, k, y, x)) * stride)
                    .collect();
                let cx = (x as f32 + 0.5) * stride;
                let cy = (y as f32 + 0.5) * stride;
                let (x1, y1) = to_original(cx - dist[0], cy - dist[1], config);
                let (x2, y2) = to_original(cx + dist[2], cy + dist[3], config);
                self.candidates.push(Candidate {
                    bbox: [x1, y1, x2, y2],
                    score,
                    class: best.0,
                });
            }
        }
        Ok(())
    }

    fn finalize(&mut self, config: &DecodeConfig) -> Result<String> {
        let mut candidates = std::mem::take(&mut self.candidates);
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut kept: Vec<Candidate> = Vec::new();
        for cand in candidates {
            if kept.len() >= config.nms_top_k as usize {
                break;
            }
            let suppressed = kept
                .iter()
                .any(|k| k.class == cand.class && iou(&k.bbox, &cand.bbox) > config.nms_threshold);
            if !suppressed {
                kept.push(cand);
            }
        }

        let records: Vec<DecodedBox> = kept
            .into_iter()
            .map(|c| DecodedBox {
                bbox: c.bbox,
                score: c.score,
                id: c.class as i32,
                name: COCO_CLASSES.get(c.class).copied().unwrap_or("unknown").to_string(),
            })
            .collect();
        let body = serde_json::to_string(&records).context("serialize decoded boxes")?;
        Ok(format!("{}{}", RESULT_PREFIX, body))
    }
}

pub(crate) fn element_for(descriptor: &TensorDescriptor) -> ElementType {
    if descriptor.is_quantized() {
        ElementType::I32
    } else {
        ElementType::F32
    }
}

pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpu::tensor::TensorLayout;

    fn tensor_set(
        classes: usize,
        hits: &[(usize, usize, usize, f32)],
    ) -> (TensorDescriptor, OutputTensor, TensorDescriptor, OutputTensor, TensorDescriptor, OutputTensor) {
        // stride 8 on a 32x32 model: 4x4 grid
        let (h, w) = (4, 4);
        let cls_desc = TensorDescriptor::float(vec![1, h, w, classes], TensorLayout::Nhwc);
        let mut cls = vec![-10.0f32; h * w * classes];
        let box_desc = TensorDescriptor::float(vec![1, h, w, 4], TensorLayout::Nhwc);
        let mut boxes = vec![0.0f32; h * w * 4];
        let ce_desc = TensorDescriptor::float(vec![1, h, w, 1], TensorLayout::Nhwc);
        let ce = vec![10.0f32; h * w];
        for &(y, x, c, size) in hits {
            cls[(y * w + x) * classes + c] = 10.0;
            for k in 0..4 {
                boxes[(y * w + x) * 4 + k] = size;
            }
        }
        (
            cls_desc,
            OutputTensor::f32(cls),
            box_desc,
            OutputTensor::f32(boxes),
            ce_desc,
            OutputTensor::f32(ce),
        )
    }

    fn config() -> DecodeConfig {
        DecodeConfig {
            model_height: 32,
            model_width: 32,
            ori_height: 64,
            ori_width: 64,
            ..DecodeConfig::default()
        }
    }

    fn parse(text: &str) -> Vec<DecodedBox> {
        let body = text.strip_prefix(RESULT_PREFIX).unwrap();
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn decodes_anchor_point_distances_and_rescales() {
        let (cd, ct, bd, bt, ed, et) = tensor_set(2, &[(1, 1, 0, 0.5)]);
        let mut decoder = BuiltinFcosDecoder::new();
        let cfg = config();
        decoder
            .decode_stride(
                BoundTensor { descriptor: &cd, tensor: &ct },
                BoundTensor { descriptor: &bd, tensor: &bt },
                BoundTensor { descriptor: &ed, tensor: &et },
                &cfg,
                0,
            )
            .unwrap();
        let boxes = parse(&decoder.finalize(&cfg).unwrap());
        assert_eq!(boxes.len(), 1);
        // centre (1.5*8, 1.5*8) = (12, 12), half-size 4, doubled by the 2x rescale
        assert_eq!(boxes[0].bbox, [16.0, 16.0, 32.0, 32.0]);
        assert_eq!(boxes[0].name, "person");
        assert!(boxes[0].score > 0.99);
    }

    #[test]
    fn nms_keeps_no_overlapping_pair_of_same_class() {
        // neighbouring cells with large boxes overlap heavily
        let hits = [(1, 1, 0, 2.0), (1, 2, 0, 2.0), (2, 1, 0, 2.0), (3, 3, 1, 0.5)];
        let (cd, ct, bd, bt, ed, et) = tensor_set(2, &hits);
        let mut decoder = BuiltinFcosDecoder::new();
        let cfg = DecodeConfig {
            nms_threshold: 0.3,
            ..config()
        };
        decoder
            .decode_stride(
                BoundTensor { descriptor: &cd, tensor: &ct },
                BoundTensor { descriptor: &bd, tensor: &bt },
                BoundTensor { descriptor: &ed, tensor: &et },
                &cfg,
                0,
            )
            .unwrap();
        let boxes = parse(&decoder.finalize(&cfg).unwrap());
        assert!(boxes.iter().any(|b| b.name == "bicycle"));
        for (i, a) in boxes.iter().enumerate() {
            for b in boxes.iter().skip(i + 1) {
                if a.id == b.id {
                    assert!(iou(&a.bbox, &b.bbox) <= cfg.nms_threshold);
                }
            }
        }
    }

    #[test]
    fn finalize_resets_candidates() {
        let (cd, ct, bd, bt, ed, et) = tensor_set(1, &[(0, 0, 0, 1.0)]);
        let mut decoder = BuiltinFcosDecoder::new();
        let cfg = config();
        decoder
            .decode_stride(
                BoundTensor { descriptor: &cd, tensor: &ct },
                BoundTensor { descriptor: &bd, tensor: &bt },
                BoundTensor { descriptor: &ed, tensor: &et },
                &cfg,
                0,
            )
            .unwrap();
        assert_eq!(parse(&decoder.finalize(&cfg).unwrap()).len(), 1);
        assert!(parse(&decoder.finalize(&cfg).unwrap()).is_empty());
    }

    #[test]
    fn letterbox_mapping_removes_padding() {
        let cfg = DecodeConfig {
            model_width: 512,
            model_height: 512,
            ori_width: 1024,
            ori_height: 512,
            pad_resize: 1,
            ..DecodeConfig::default()
        };
        // scale 0.5, vertical padding 128
        assert_eq!(to_original(256.0, 128.0, &cfg), (512.0, 0.0));
        assert_eq!(to_original(512.0, 384.0, &cfg), (1024.0, 512.0));
    }
}
