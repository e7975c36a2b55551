use crate::frame::BoundingBox;

pub const PERSON_LABEL: &str = "person";

/// Detector scores must be strictly above the configured threshold.
pub fn above_threshold(confidence: f32, threshold: f32) -> bool {
    confidence > threshold
}

/// One detected object in frame pixel coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f32,
    pub label: String,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32, label: impl Into<String>) -> Self {
        Self {
            bbox,
            confidence,
            label: label.into(),
        }
    }

    pub fn person(bbox: BoundingBox, confidence: f32) -> Self {
        Self::new(bbox, confidence, PERSON_LABEL)
    }

    pub fn is_person(&self) -> bool {
        self.label == PERSON_LABEL
    }

    pub fn passes(&self, threshold: f32) -> bool {
        above_threshold(self.confidence, threshold)
    }
}
