//! Frame ingestion sources.
//!
//! - RTSP streams (IP cameras), GStreamer-backed behind `rtsp-gstreamer`
//! - Synthetic `stub://` streams for bench runs and tests
//!
//! Sources hand out owned `Frame`s. The pipeline keeps at most one frame alive
//! per cycle and never writes frames anywhere.

pub mod normalize;
pub mod rtsp;

use anyhow::Result;

use crate::frame::Frame;

pub use rtsp::{RtspConfig, RtspSource, RtspStats};

/// Anything the polling loop can pull frames from.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame>;
}

impl FrameSource for RtspSource {
    fn next_frame(&mut self) -> Result<Frame> {
        RtspSource::next_frame(self)
    }
}
