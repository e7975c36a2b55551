use anyhow::{anyhow, Result};

use crate::bpu::{
    BuiltinFcosDecoder, HobotDnnRuntime, NativeFcosDecoder, PostProcessSettings, StrideDecoder,
};
use crate::config::{DecoderKind, TeatimeConfig};

use super::backend::DetectorBackend;
use super::backends::{HardwareBackend, SoftwareBackend, SoftwareSettings, StubBackend};

type BackendFactory = Box<dyn FnOnce() -> Result<Box<dyn DetectorBackend>>>;

/// Ordered list of detector candidates.
///
/// `select` builds each in turn and keeps the first one that comes up; later
/// candidates are never constructed.
pub struct BackendChain {
    candidates: Vec<(String, BackendFactory)>,
}

impl BackendChain {
    pub fn new() -> Self {
        Self {
            candidates: Vec::new(),
        }
    }

    pub fn push<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: FnOnce() -> Result<Box<dyn DetectorBackend>> + 'static,
    {
        self.candidates.push((name.into(), Box::new(factory)));
    }

    pub fn names(&self) -> Vec<&str> {
        self.candidates.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Hardware first when enabled, then the CPU detector. `stub://` sources
    /// also get the scripted stub as a last resort.
    pub fn from_config(config: &TeatimeConfig) -> Self {
        let mut chain = Self::new();

        if config.detection.use_hardware {
            let hw = config.hardware.clone();
            chain.push("hardware", move || {
                let runtime = HobotDnnRuntime::load(&hw.dnn_library, &hw.model_path)?;
                let decoder: Box<dyn StrideDecoder> = match hw.decoder {
                    DecoderKind::Native => Box::new(NativeFcosDecoder::load(&hw.postprocess_library)?),
                    DecoderKind::Builtin => Box::new(BuiltinFcosDecoder::new()),
                };
                let settings = PostProcessSettings {
                    input_width: hw.input_width,
                    input_height: hw.input_height,
                    num_classes: hw.num_classes,
                    score_threshold: hw.score_threshold,
                    nms_threshold: hw.nms_threshold,
                    nms_top_k: hw.nms_top_k,
                    pad_resize: hw.pad_resize,
                };
                let backend = HardwareBackend::build(Box::new(runtime), decoder, settings)?;
                Ok(Box::new(backend) as Box<dyn DetectorBackend>)
            });
        }

        let sw = config.software.clone();
        let confidence_threshold = config.detection.confidence_threshold;
        chain.push("software", move || {
            let settings = SoftwareSettings {
                input_size: sw.input_size,
                confidence_threshold,
            };
            let mut backend = SoftwareBackend::new(&sw.model_path, settings)?;
            backend.warm_up()?;
            Ok(Box::new(backend) as Box<dyn DetectorBackend>)
        });

        if config.source.url.starts_with("stub://") {
            let (width, height) = (config.source.width, config.source.height);
            chain.push("stub", move || {
                Ok(Box::new(StubBackend::synthetic(width, height)) as Box<dyn DetectorBackend>)
            });
        }

        chain
    }

    /// Construct candidates in order and return the first that succeeds.
    pub fn select(self) -> Result<Box<dyn DetectorBackend>> {
        let mut failures = Vec::new();
        for (name, factory) in self.candidates {
            match factory() {
                Ok(backend) => {
                    log::info!("detector backend '{}' selected", name);
                    return Ok(backend);
                }
                Err(err) => {
                    log::warn!("detector backend '{}' unavailable: {:#}", name, err);
                    failures.push(format!("{}: {:#}", name, err));
                }
            }
        }
        if failures.is_empty() {
            return Err(anyhow!("no detector backends configured"));
        }
        Err(anyhow!(
            "no detector backend could be initialised ({})",
            failures.join("; ")
        ))
    }
}

impl Default for BackendChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn first_working_candidate_wins() {
        let built = Rc::new(Cell::new(0));
        let mut chain = BackendChain::new();
        chain.push("broken", || Err(anyhow!("no accelerator")));
        chain.push("stub", || Ok(Box::new(StubBackend::new()) as Box<dyn DetectorBackend>));
        let counter = built.clone();
        chain.push("never", move || {
            counter.set(counter.get() + 1);
            Ok(Box::new(StubBackend::new()) as Box<dyn DetectorBackend>)
        });

        let backend = chain.select().unwrap();
        assert_eq!(backend.name(), "stub");
        assert_eq!(built.get(), 0);
    }

    #[test]
    fn exhausted_chain_reports_every_cause() {
        let mut chain = BackendChain::new();
        chain.push("hardware", || Err(anyhow!("model artifact missing")));
        chain.push("software", || Err(anyhow!("onnx missing")));
        let err = chain.select().err().unwrap().to_string();
        assert!(err.contains("hardware: model artifact missing"));
        assert!(err.contains("software: onnx missing"));
    }

    #[test]
    fn empty_chain_is_an_error() {
        assert!(BackendChain::new().select().is_err());
    }
}
