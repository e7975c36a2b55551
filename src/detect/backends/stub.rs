use anyhow::Result;
use std::collections::VecDeque;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::{BoundingBox, Frame};
use crate::ingest::rtsp::synthetic_figure_box;

/// Stub backend for bench runs and tests.
///
/// Scripted results are returned one per call; once the script runs out the
/// fallback list is returned for every frame.
pub struct StubBackend {
    script: VecDeque<Result<Vec<Detection>, String>>,
    fallback: Vec<Detection>,
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            fallback: Vec::new(),
            calls: 0,
        }
    }

    /// Report the synthetic figure of `stub://` sources on every frame.
    pub fn synthetic(width: u32, height: u32) -> Self {
        Self::new().with_fallback(vec![Detection::person(
            synthetic_figure_box(width, height),
            0.9,
        )])
    }

    pub fn with_fallback(mut self, detections: Vec<Detection>) -> Self {
        self.fallback = detections;
        self
    }

    /// Queue the result of one future `detect` call.
    pub fn push(&mut self, detections: Vec<Detection>) {
        self.script.push_back(Ok(detections));
    }

    /// Queue a failure for one future `detect` call.
    pub fn push_error(&mut self, message: impl Into<String>) {
        self.script.push_back(Err(message.into()));
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        self.calls += 1;
        let detections = match self.script.pop_front() {
            Some(Ok(detections)) => detections,
            Some(Err(message)) => return Err(anyhow::anyhow!(message)),
            None => self.fallback.clone(),
        };
        Ok(detections
            .into_iter()
            .filter_map(|mut d| {
                d.bbox = d.bbox.clamped(frame.width, frame.height);
                d.bbox.is_valid().then_some(d)
            })
            .collect())
    }
}
