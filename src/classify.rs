//! Uniform colour classifier.
//!
//! Decides whether the torso region of a detected person is mostly covered by
//! the configured uniform colour. Colours are compared in 8-bit HSV
//! (H in `[0,179]`, S and V in `[0,255]`), the convention camera tooling uses.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::frame::{BoundingBox, Frame};

/// Default uniform colour bounds (purple).
pub const DEFAULT_LOWER: [u8; 3] = [125, 50, 50];
pub const DEFAULT_UPPER: [u8; 3] = [155, 255, 255];
pub const DEFAULT_MATCH_THRESHOLD: f64 = 25.0;

/// Inclusive HSV bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsvRange {
    pub lower: [u8; 3],
    pub upper: [u8; 3],
}

impl Default for HsvRange {
    fn default() -> Self {
        Self {
            lower: DEFAULT_LOWER,
            upper: DEFAULT_UPPER,
        }
    }
}

impl HsvRange {
    pub fn validate(&self) -> Result<()> {
        for channel in 0..3 {
            if self.lower[channel] > self.upper[channel] {
                return Err(anyhow!(
                    "uniform HSV lower bound {:?} exceeds upper bound {:?}",
                    self.lower,
                    self.upper
                ));
            }
        }
        if self.upper[0] > 179 {
            return Err(anyhow!("uniform hue bound must be <= 179, got {}", self.upper[0]));
        }
        Ok(())
    }

    pub fn contains(&self, hsv: [u8; 3]) -> bool {
        (0..3).all(|c| hsv[c] >= self.lower[c] && hsv[c] <= self.upper[c])
    }
}

/// Per-pixel match mask over the torso region, row-major, 0 or 255.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchMask {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UniformResult {
    pub matched: bool,
    /// Share of torso pixels inside the colour range, 0-100.
    pub percentage: f64,
    pub mask: Option<MatchMask>,
}

impl UniformResult {
    fn empty() -> Self {
        Self {
            matched: false,
            percentage: 0.0,
            mask: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct UniformClassifier {
    range: HsvRange,
    threshold: f64,
    emit_mask: bool,
}

impl Default for UniformClassifier {
    fn default() -> Self {
        Self {
            range: HsvRange::default(),
            threshold: DEFAULT_MATCH_THRESHOLD,
            emit_mask: false,
        }
    }
}

impl UniformClassifier {
    pub fn new(range: HsvRange, threshold: f64) -> Result<Self> {
        range.validate()?;
        if !(0.0..=100.0).contains(&threshold) {
            return Err(anyhow!(
                "uniform match threshold must be within 0-100, got {}",
                threshold
            ));
        }
        Ok(Self {
            range,
            threshold,
            emit_mask: false,
        })
    }

    /// Also return the per-pixel mask. Diagnostic only.
    pub fn with_mask(mut self, emit_mask: bool) -> Self {
        self.emit_mask = emit_mask;
        self
    }

    pub fn range(&self) -> HsvRange {
        self.range
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Classify the torso band of `bbox`: rows from 10% to 60% of the box height.
    pub fn classify(&self, frame: &Frame, bbox: &BoundingBox) -> UniformResult {
        let Some(roi) = torso_region(bbox, frame.width, frame.height) else {
            return UniformResult::empty();
        };

        let roi_w = roi.width() as u32;
        let roi_h = roi.height() as u32;
        let total = roi_w as u64 * roi_h as u64;
        let mut matched_pixels = 0u64;
        let mut mask = self
            .emit_mask
            .then(|| Vec::with_capacity(total as usize));

        for y in roi.y1..roi.y2 {
            for x in roi.x1..roi.x2 {
                let hsv = rgb_to_hsv(frame.rgb_at(x as u32, y as u32));
                let hit = self.range.contains(hsv);
                if hit {
                    matched_pixels += 1;
                }
                if let Some(mask) = mask.as_mut() {
                    mask.push(if hit { 255 } else { 0 });
                }
            }
        }

        let percentage = matched_pixels as f64 * 100.0 / total as f64;
        UniformResult {
            matched: percentage >= self.threshold,
            percentage,
            mask: mask.map(|data| MatchMask {
                width: roi_w,
                height: roi_h,
                data,
            }),
        }
    }
}

/// Torso band of a person box, clamped into the frame. `None` when empty.
pub fn torso_region(bbox: &BoundingBox, width: u32, height: u32) -> Option<BoundingBox> {
    let h = bbox.height();
    let roi = BoundingBox::new(bbox.x1, bbox.y1 + h / 10, bbox.x2, bbox.y1 + h * 6 / 10)
        .clamped(width, height);
    roi.is_valid().then_some(roi)
}

/// RGB to 8-bit HSV with hue halved into `[0,179]`.
pub fn rgb_to_hsv(rgb: [u8; 3]) -> [u8; 3] {
    let (r, g, b) = (rgb[0] as f32, rgb[1] as f32, rgb[2] as f32);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let s = if max == 0.0 { 0.0 } else { 255.0 * delta / max };

    let mut h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (g - b) / delta
    } else if max == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    if h < 0.0 {
        h += 360.0;
    }

    let mut hue = (h / 2.0).round() as u32;
    if hue >= 180 {
        hue -= 180;
    }
    [hue as u8, s.round() as u8, max as u8]
}
