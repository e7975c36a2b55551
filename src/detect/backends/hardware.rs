use anyhow::{anyhow, Context, Result};

use crate::bpu::{AcceleratorRuntime, PostProcessSettings, StrideDecoder, TensorPostProcessor};
use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;
use crate::ingest::normalize::{letterbox_rgb, resize_rgb, rgb_to_nv12};

/// Person detector running an FCOS model on the accelerator.
pub struct HardwareBackend {
    runtime: Box<dyn AcceleratorRuntime>,
    postprocessor: TensorPostProcessor,
}

impl HardwareBackend {
    pub fn new(runtime: Box<dyn AcceleratorRuntime>, postprocessor: TensorPostProcessor) -> Self {
        Self {
            runtime,
            postprocessor,
        }
    }

    /// Build against a loaded runtime, rejecting a model whose input size
    /// differs from the configured one.
    pub fn build(
        runtime: Box<dyn AcceleratorRuntime>,
        decoder: Box<dyn StrideDecoder>,
        settings: PostProcessSettings,
    ) -> Result<Self> {
        let live = runtime.input_size();
        if live != (settings.input_width, settings.input_height) {
            return Err(anyhow!(
                "model input is {}x{}, configured {}x{}",
                live.0,
                live.1,
                settings.input_width,
                settings.input_height
            ));
        }
        let post = TensorPostProcessor::new(runtime.output_descriptors(), decoder, settings)?;
        Ok(Self::new(runtime, post))
    }
}

impl DetectorBackend for HardwareBackend {
    fn name(&self) -> &'static str {
        "hardware"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let (w, h) = self.runtime.input_size();
        let rgb = if self.postprocessor.letterbox() {
            letterbox_rgb(frame, w, h)?
        } else {
            resize_rgb(frame, w, h)?
        };
        let nv12 = rgb_to_nv12(&rgb, w, h)?;
        let outputs = self.runtime.forward(&nv12).context("accelerator inference failed")?;
        self.postprocessor
            .process(&outputs, frame.width, frame.height)
    }
}
