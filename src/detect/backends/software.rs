use std::path::Path;

use anyhow::Result;

use crate::detect::result::{above_threshold, Detection};
use crate::frame::BoundingBox;

/// VOC class index of `person` in MobileNet-SSD.
pub const SSD_PERSON_CLASS: usize = 15;
pub const SSD_INPUT_SIZE: u32 = 300;
const SSD_MEAN: f32 = 127.5;
const SSD_SCALE: f32 = 0.007843;

#[derive(Clone, Debug)]
pub struct SoftwareSettings {
    pub input_size: u32,
    /// Rows must score strictly above this to be kept.
    pub confidence_threshold: f32,
}

impl Default for SoftwareSettings {
    fn default() -> Self {
        Self {
            input_size: SSD_INPUT_SIZE,
            confidence_threshold: 0.6,
        }
    }
}

/// Parse SSD output rows `[image_id, class_id, confidence, x1, y1, x2, y2]`
/// with coordinates normalised to `[0, 1]`.
pub fn parse_ssd_output(values: &[f32], width: u32, height: u32, threshold: f32) -> Vec<Detection> {
    let (w, h) = (width as f32, height as f32);
    values
        .chunks_exact(7)
        .filter(|row| row[1] as usize == SSD_PERSON_CLASS && above_threshold(row[2], threshold))
        .filter_map(|row| {
            let bbox = BoundingBox::from_f32([row[3] * w, row[4] * h, row[5] * w, row[6] * h])
                .clamped(width, height);
            bbox.is_valid()
                .then(|| Detection::person(bbox, row[2].clamp(0.0, 1.0)))
        })
        .collect()
}

#[cfg(feature = "backend-tract")]
mod imp {
    use super::*;
    use anyhow::{anyhow, Context};
    use tract_onnx::prelude::*;

    use crate::detect::backend::DetectorBackend;
    use crate::frame::Frame;
    use crate::ingest::normalize::resize_rgb;

    /// MobileNet-SSD person detector running on the CPU through tract.
    pub struct SoftwareBackend {
        model: TypedSimplePlan<TypedModel>,
        settings: SoftwareSettings,
    }

    impl SoftwareBackend {
        /// Load an ONNX model from disk and prepare it for inference.
        pub fn new(model_path: &Path, settings: SoftwareSettings) -> Result<Self> {
            if !model_path.exists() {
                return Err(anyhow!("SSD model {} not found", model_path.display()));
            }
            let size = settings.input_size as usize;
            let model = tract_onnx::onnx()
                .model_for_path(model_path)
                .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
                .with_input_fact(0, f32::fact([1, 3, size, size]).into())
                .context("failed to set input fact")?
                .into_optimized()
                .context("failed to optimize ONNX model")?
                .into_runnable()
                .context("failed to build runnable ONNX model")?;

            log::info!("software detector loaded {}", model_path.display());
            Ok(Self { model, settings })
        }

        fn build_input(&self, frame: &Frame) -> Result<Tensor> {
            let size = self.settings.input_size;
            let rgb = resize_rgb(frame, size, size)?;
            let s = size as usize;
            // network expects BGR planes
            let input = tract_ndarray::Array4::from_shape_fn((1, 3, s, s), |(_, channel, y, x)| {
                let idx = (y * s + x) * 3 + (2 - channel);
                (rgb[idx] as f32 - SSD_MEAN) * SSD_SCALE
            });
            Ok(input.into_tensor())
        }
    }

    impl DetectorBackend for SoftwareBackend {
        fn name(&self) -> &'static str {
            "software"
        }

        fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
            let input = self.build_input(frame)?;
            let outputs = self
                .model
                .run(tvec!(input.into()))
                .context("ONNX inference failed")?;
            let output = outputs
                .first()
                .ok_or_else(|| anyhow!("model produced no outputs"))?;
            let view = output
                .to_array_view::<f32>()
                .context("model output tensor was not f32")?;
            let values: Vec<f32> = view.iter().copied().collect();
            Ok(parse_ssd_output(
                &values,
                frame.width,
                frame.height,
                self.settings.confidence_threshold,
            ))
        }

        fn warm_up(&mut self) -> Result<()> {
            let size = self.settings.input_size;
            let blank = Frame::solid(size, size, [0, 0, 0], chrono::Local::now())?;
            self.detect(&blank).map(|_| ())
        }
    }
}

#[cfg(feature = "backend-tract")]
pub use imp::SoftwareBackend;

/// Placeholder when built without `backend-tract`; construction always fails.
#[cfg(not(feature = "backend-tract"))]
pub struct SoftwareBackend;

#[cfg(not(feature = "backend-tract"))]
impl SoftwareBackend {
    pub fn new(model_path: &Path, _settings: SoftwareSettings) -> Result<Self> {
        anyhow::bail!(
            "cannot load {}: software detection requires the backend-tract feature",
            model_path.display()
        )
    }
}

#[cfg(not(feature = "backend-tract"))]
impl crate::detect::backend::DetectorBackend for SoftwareBackend {
    fn name(&self) -> &'static str {
        "software"
    }

    fn detect(&mut self, _frame: &crate::frame::Frame) -> Result<Vec<Detection>> {
        anyhow::bail!("software detection requires the backend-tract feature")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssd_rows_filtered_by_class_and_threshold() {
        let rows = [
            0.0, 15.0, 0.9, 0.1, 0.2, 0.5, 0.8, // person, kept
            0.0, 7.0, 0.95, 0.0, 0.0, 1.0, 1.0, // car
            0.0, 15.0, 0.6, 0.0, 0.0, 1.0, 1.0, // exactly at threshold, dropped
            0.0, 15.0, 0.7, 0.9, 0.9, 1.4, 1.2, // clamped
            0.0, 15.0, 0.8, 1.2, 0.0, 1.5, 1.0, // degenerate after clamp
        ];
        let detections = parse_ssd_output(&rows, 200, 100, 0.6);
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].bbox, BoundingBox::new(20, 20, 100, 80));
        assert!(detections[0].is_person());
        assert_eq!(detections[1].bbox, BoundingBox::new(180, 90, 200, 100));
    }

    #[cfg(not(feature = "backend-tract"))]
    #[test]
    fn construction_fails_without_feature() {
        assert!(SoftwareBackend::new(Path::new("model.onnx"), SoftwareSettings::default()).is_err());
    }

    #[cfg(feature = "backend-tract")]
    #[test]
    fn missing_model_fails_construction() {
        let err = SoftwareBackend::new(Path::new("/nonexistent/ssd.onnx"), SoftwareSettings::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("not found"));
    }
}
