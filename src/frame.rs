//! Frame types shared by every stage of the pipeline.
//!
//! - `Frame`: one captured image. Pixel bytes are private and validated against the layout.
//! - `BoundingBox`: integer pixel rectangle with clamping and overlap helpers.
//! - `LatestFrame`: single-slot handoff cell used when frames and detections arrive
//!   on independent streams.
//!
//! Frames are ephemeral: created per cycle, dropped once the cycle is done.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use std::sync::{Arc, Mutex};

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Pixel layout of a frame buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    /// Packed 3-channel, blue first (camera/OpenCV order).
    Bgr24,
    /// Packed 3-channel, red first.
    Rgb24,
    /// Planar luma followed by interleaved half-resolution chroma (YUV 4:2:0).
    Nv12,
}

impl PixelLayout {
    /// Expected buffer length for the given dimensions.
    pub fn buffer_len(self, width: u32, height: u32) -> Result<usize> {
        let area = (width as usize)
            .checked_mul(height as usize)
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        match self {
            PixelLayout::Bgr24 | PixelLayout::Rgb24 => area
                .checked_mul(3)
                .ok_or_else(|| anyhow!("frame dimensions overflow")),
            PixelLayout::Nv12 => {
                if width % 2 != 0 || height % 2 != 0 {
                    return Err(anyhow!(
                        "NV12 frames require even dimensions, got {}x{}",
                        width,
                        height
                    ));
                }
                Ok(area + area / 2)
            }
        }
    }
}

/// One captured frame.
///
/// The pixel buffer is private; backends read it through `pixels()` and the
/// classifier reads individual pixels through `rgb_at()`.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub captured_at: DateTime<Local>,
}

impl Frame {
    /// Wrap a pixel buffer. Fails when the buffer length does not match the layout.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        layout: PixelLayout,
        captured_at: DateTime<Local>,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        let expected = layout.buffer_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "{:?} frame length mismatch: expected {}, got {}",
                layout,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            layout,
            captured_at,
        })
    }

    /// Frame filled with one RGB colour, stored as BGR.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3], captured_at: DateTime<Local>) -> Result<Self> {
        let len = PixelLayout::Bgr24.buffer_len(width, height)?;
        let mut data = Vec::with_capacity(len);
        for _ in 0..len / 3 {
            data.extend_from_slice(&[rgb[2], rgb[1], rgb[0]]);
        }
        Self::new(data, width, height, PixelLayout::Bgr24, captured_at)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Read one pixel as RGB. Coordinates must be inside the frame.
    pub fn rgb_at(&self, x: u32, y: u32) -> [u8; 3] {
        let w = self.width as usize;
        let (x, y) = (x as usize, y as usize);
        match self.layout {
            PixelLayout::Bgr24 => {
                let i = (y * w + x) * 3;
                [self.data[i + 2], self.data[i + 1], self.data[i]]
            }
            PixelLayout::Rgb24 => {
                let i = (y * w + x) * 3;
                [self.data[i], self.data[i + 1], self.data[i + 2]]
            }
            PixelLayout::Nv12 => {
                let y_plane = w * self.height as usize;
                let luma = self.data[y * w + x];
                let uv = y_plane + (y / 2) * w + (x / 2) * 2;
                crate::ingest::normalize::yuv_to_rgb(luma, self.data[uv], self.data[uv + 1])
            }
        }
    }

    /// Copy the frame into a packed RGB buffer.
    pub fn to_rgb(&self) -> Result<Vec<u8>> {
        crate::ingest::normalize::normalize_to_rgb(&self.data, self.width, self.height, self.layout)
    }
}

// ----------------------------------------------------------------------------
// BoundingBox
// ----------------------------------------------------------------------------

/// Axis-aligned box in integer pixel coordinates, `(x1, y1)` top-left, `(x2, y2)` bottom-right.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Truncate float coordinates toward zero.
    pub fn from_f32(coords: [f32; 4]) -> Self {
        Self::new(
            coords[0] as i32,
            coords[1] as i32,
            coords[2] as i32,
            coords[3] as i32,
        )
    }

    /// Clamp every coordinate into `[0, width] x [0, height]`.
    pub fn clamped(&self, width: u32, height: u32) -> Self {
        let w = width.min(i32::MAX as u32) as i32;
        let h = height.min(i32::MAX as u32) as i32;
        Self {
            x1: self.x1.clamp(0, w),
            y1: self.y1.clamp(0, h),
            x2: self.x2.clamp(0, w),
            y2: self.y2.clamp(0, h),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> i64 {
        if !self.is_valid() {
            return 0;
        }
        self.width() as i64 * self.height() as i64
    }

    /// Intersection over union. Degenerate boxes overlap nothing.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = BoundingBox::new(ix1, iy1, ix2, iy2).area();
        let union = self.area() + other.area() - inter;
        if union <= 0 {
            return 0.0;
        }
        inter as f32 / union as f32
    }
}

// ----------------------------------------------------------------------------
// LatestFrame: single-slot handoff for push-driven mode
// ----------------------------------------------------------------------------

/// Holds only the most recently received frame.
///
/// Every `store` overwrites the slot; there is no queue and no backpressure.
/// Readers get a shared handle, so a store never invalidates a frame that a
/// consumer is still classifying.
#[derive(Debug, Default)]
pub struct LatestFrame {
    slot: Mutex<Option<Arc<Frame>>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached frame.
    pub fn store(&self, frame: Frame) -> Result<()> {
        let mut guard = self
            .slot
            .lock()
            .map_err(|_| anyhow!("latest frame lock poisoned"))?;
        *guard = Some(Arc::new(frame));
        Ok(())
    }

    /// Current frame, if any has arrived yet.
    pub fn latest(&self) -> Result<Option<Arc<Frame>>> {
        let guard = self
            .slot
            .lock()
            .map_err(|_| anyhow!("latest frame lock poisoned"))?;
        Ok(guard.clone())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_length_mismatch() {
        let err = Frame::new(vec![0u8; 10], 2, 2, PixelLayout::Bgr24, Local::now());
        assert!(err.is_err());
    }

    #[test]
    fn nv12_frame_requires_even_dimensions() {
        assert!(PixelLayout::Nv12.buffer_len(3, 2).is_err());
        assert_eq!(PixelLayout::Nv12.buffer_len(4, 2).unwrap(), 12);
    }

    #[test]
    fn rgb_at_reads_bgr_in_rgb_order() {
        let frame = Frame::solid(2, 2, [10, 20, 30], Local::now()).unwrap();
        assert_eq!(frame.pixels()[..3], [30, 20, 10]);
        assert_eq!(frame.rgb_at(1, 1), [10, 20, 30]);
    }

    #[test]
    fn bounding_box_clamps_into_frame() {
        let bbox = BoundingBox::new(-5, -1, 700, 500).clamped(640, 480);
        assert_eq!(bbox, BoundingBox::new(0, 0, 640, 480));
        assert!(bbox.is_valid());
    }

    #[test]
    fn bounding_box_degenerate_after_clamp() {
        let bbox = BoundingBox::new(650, 10, 700, 20).clamped(640, 480);
        assert!(!bbox.is_valid());
        assert_eq!(bbox.area(), 0);
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BoundingBox::new(0, 0, 10, 10);
        let b = BoundingBox::new(20, 20, 30, 30);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&b), 0.0);
        let c = BoundingBox::new(5, 0, 15, 10);
        assert!((a.iou(&c) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn latest_frame_keeps_last_write() {
        let cell = LatestFrame::new();
        assert!(cell.latest().unwrap().is_none());
        cell.store(Frame::solid(2, 2, [1, 1, 1], Local::now()).unwrap())
            .unwrap();
        cell.store(Frame::solid(4, 2, [2, 2, 2], Local::now()).unwrap())
            .unwrap();
        let latest = cell.latest().unwrap().unwrap();
        assert_eq!(latest.width, 4);
    }
}
