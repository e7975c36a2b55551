//! Turns the 15 raw FCOS output tensors into person detections.

use anyhow::{anyhow, Context, Result};

use super::decoder::{element_for, BoundTensor, DecodeConfig, DecodedBox, StrideDecoder, FCOS_STRIDES, RESULT_PREFIX};
use super::tensor::{OutputTensor, TensorDescriptor};
use crate::detect::Detection;
use crate::frame::BoundingBox;

pub const FCOS_OUTPUT_COUNT: usize = FCOS_STRIDES.len() * 3;
pub const DEFAULT_NUM_CLASSES: usize = 80;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PostProcessSettings {
    pub input_width: u32,
    pub input_height: u32,
    pub num_classes: usize,
    pub score_threshold: f32,
    pub nms_threshold: f32,
    pub nms_top_k: u32,
    pub pad_resize: bool,
}

impl Default for PostProcessSettings {
    fn default() -> Self {
        Self {
            input_width: 512,
            input_height: 512,
            num_classes: DEFAULT_NUM_CLASSES,
            score_threshold: 0.5,
            nms_threshold: 0.6,
            nms_top_k: 5,
            pad_resize: false,
        }
    }
}

pub struct TensorPostProcessor {
    descriptors: Vec<TensorDescriptor>,
    decoder: Box<dyn StrideDecoder>,
    config: DecodeConfig,
}

impl TensorPostProcessor {
    /// Validate the model's declared outputs once and keep them for every frame.
    ///
    /// Output `i` (stride index 0-4) holds class scores, `i + 5` box distances
    /// and `i + 10` centerness.
    pub fn new(
        mut descriptors: Vec<TensorDescriptor>,
        decoder: Box<dyn StrideDecoder>,
        settings: PostProcessSettings,
    ) -> Result<Self> {
        if descriptors.len() != FCOS_OUTPUT_COUNT {
            return Err(anyhow!(
                "FCOS model must declare {} outputs, got {}",
                FCOS_OUTPUT_COUNT,
                descriptors.len()
            ));
        }
        if settings.input_width == 0 || settings.input_height == 0 {
            return Err(anyhow!("model input dimensions must be non-zero"));
        }

        for (i, stride) in FCOS_STRIDES.iter().enumerate() {
            let expected_h = (settings.input_height as usize).div_ceil(*stride);
            let expected_w = (settings.input_width as usize).div_ceil(*stride);
            let roles = [
                (i, "classification", settings.num_classes),
                (i + 5, "box", 4),
                (i + 10, "centerness", 1),
            ];
            for (index, role, channels) in roles {
                let desc = &mut descriptors[index];
                desc.validate()
                    .with_context(|| format!("output {} ({} stride {})", index, role, stride))?;
                if desc.shape.len() != 4 {
                    return Err(anyhow!(
                        "output {} ({} stride {}) must be rank 4, got shape {:?}",
                        index,
                        role,
                        stride,
                        desc.shape
                    ));
                }
                let spatial = desc.spatial().unwrap_or((0, 0));
                if spatial != (expected_h, expected_w) {
                    return Err(anyhow!(
                        "output {} ({} stride {}) spatial size {:?} does not match expected {:?}",
                        index,
                        role,
                        stride,
                        spatial,
                        (expected_h, expected_w)
                    ));
                }
                if desc.channels() != Some(channels) {
                    return Err(anyhow!(
                        "output {} ({} stride {}) has {:?} channels, expected {}",
                        index,
                        role,
                        stride,
                        desc.channels(),
                        channels
                    ));
                }
            }
        }

        let config = DecodeConfig {
            model_height: settings.input_height,
            model_width: settings.input_width,
            ori_height: settings.input_height,
            ori_width: settings.input_width,
            score_threshold: settings.score_threshold,
            nms_threshold: settings.nms_threshold,
            nms_top_k: settings.nms_top_k,
            pad_resize: settings.pad_resize as u32,
        };
        log::info!(
            "FCOS post-processor ready: {} outputs, {}x{} input, {} decoder",
            FCOS_OUTPUT_COUNT,
            settings.input_width,
            settings.input_height,
            decoder.name()
        );
        Ok(Self {
            descriptors,
            decoder,
            config,
        })
    }

    pub fn descriptors(&self) -> &[TensorDescriptor] {
        &self.descriptors
    }

    /// Whether boxes are decoded as coming from a letterboxed input.
    pub fn letterbox(&self) -> bool {
        self.config.pad_resize != 0
    }

    /// Decode one inference result for a frame of `frame_width`x`frame_height`.
    pub fn process(
        &mut self,
        outputs: &[OutputTensor],
        frame_width: u32,
        frame_height: u32,
    ) -> Result<Vec<Detection>> {
        if outputs.len() != self.descriptors.len() {
            return Err(anyhow!(
                "expected {} output buffers, got {}",
                self.descriptors.len(),
                outputs.len()
            ));
        }
        for (i, (desc, out)) in self.descriptors.iter().zip(outputs).enumerate() {
            let expected = element_for(desc);
            if out.data.element() != expected {
                return Err(anyhow!(
                    "output {} holds {:?} elements, descriptor expects {:?}",
                    i,
                    out.data.element(),
                    expected
                ));
            }
            if out.data.len() != desc.element_count() {
                return Err(anyhow!(
                    "output {} holds {} elements, descriptor expects {}",
                    i,
                    out.data.len(),
                    desc.element_count()
                ));
            }
        }

        // boxes come back in the coordinate space of the current frame
        self.config.ori_width = frame_width;
        self.config.ori_height = frame_height;

        for i in 0..FCOS_STRIDES.len() {
            let bind = |index: usize| BoundTensor {
                descriptor: &self.descriptors[index],
                tensor: &outputs[index],
            };
            let (cls, bbox, ce) = (bind(i), bind(i + 5), bind(i + 10));
            self.decoder
                .decode_stride(cls, bbox, ce, &self.config, i)
                .with_context(|| format!("decode stride {}", FCOS_STRIDES[i]))?;
        }
        let text = self.decoder.finalize(&self.config).context("finalize FCOS decode")?;

        let Some(records) = parse_result(&text) else {
            return Ok(Vec::new());
        };
        Ok(records
            .into_iter()
            .filter(|r| r.name == "person")
            .filter_map(|r| {
                let bbox = BoundingBox::from_f32(r.bbox).clamped(frame_width, frame_height);
                bbox.is_valid()
                    .then(|| Detection::new(bbox, r.score.clamp(0.0, 1.0), "person"))
            })
            .collect())
    }
}

/// Strip the non-data prefix and parse the JSON records.
///
/// Returns `None` (after logging) when the payload is empty or malformed.
fn parse_result(text: &str) -> Option<Vec<DecodedBox>> {
    let body = match text.find(RESULT_PREFIX) {
        Some(pos) => &text[pos + RESULT_PREFIX.len()..],
        None => match text.find(['[', '{']) {
            Some(pos) => &text[pos..],
            None => text,
        },
    }
    .trim();

    if body.is_empty() {
        log::warn!("FCOS post-processing returned an empty result");
        return None;
    }
    match serde_json::from_str::<Vec<DecodedBox>>(body) {
        Ok(records) => Some(records),
        Err(err) => {
            log::warn!("failed to parse FCOS result: {}", err);
            None
        }
    }
}
