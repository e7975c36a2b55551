//! RTSP frame source.
//!
//! `RtspSource` pulls decoded BGR frames from an IP camera. URLs starting with
//! `stub://` produce synthetic frames instead: a grey scene in which a figure
//! wearing the default uniform colour appears every `figure_every` frames.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::{anyhow, Context};
use anyhow::Result;
use chrono::Local;
#[cfg(feature = "rtsp-gstreamer")]
use std::time::{Duration, Instant};

use crate::frame::{BoundingBox, Frame, PixelLayout};
#[cfg(feature = "rtsp-gstreamer")]
use crate::ingest::normalize::pack_rows;

/// RGB colour of the synthetic figure's clothing. Falls inside the default uniform range.
pub const SYNTHETIC_UNIFORM_RGB: [u8; 3] = [128, 0, 200];
const SYNTHETIC_BACKGROUND: u8 = 96;

/// Configuration for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// `rtsp://` camera URL or `stub://` for synthetic frames.
    pub url: String,
    /// Expected frame rate, used for stall timeouts.
    pub target_fps: u32,
    /// Frame width (synthetic frames only).
    pub width: u32,
    /// Frame height (synthetic frames only).
    pub height: u32,
    /// Synthetic frames show the figure on every Nth frame. 0 disables it.
    pub figure_every: u64,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://localhost:554/stream".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
            figure_every: 10,
        }
    }
}

/// Box occupied by the synthetic figure in a `width`x`height` frame.
pub fn synthetic_figure_box(width: u32, height: u32) -> BoundingBox {
    let (w, h) = (width as i32, height as i32);
    BoundingBox::new(w * 3 / 8, h / 8, w * 5 / 8, h * 15 / 16)
}

/// Camera frame source: GStreamer for `rtsp://`, synthetic scenes for `stub://`.
pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticRtspSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstCamera),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self> {
        if config.url.starts_with("stub://") {
            Ok(Self {
                backend: RtspBackend::Synthetic(SyntheticRtspSource::new(config)),
            })
        } else {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Self {
                    backend: RtspBackend::Gstreamer(GstCamera::new(config)?),
                })
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                anyhow::bail!(
                    "cannot open {}: RTSP requires the rtsp-gstreamer feature",
                    config.url
                )
            }
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.connect(),
        }
    }

    /// Capture the next frame, timestamped at capture.
    pub fn next_frame(&mut self) -> Result<Frame> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.next_frame(),
        }
    }

    /// False once the stream reported an error or stopped delivering frames.
    pub fn is_healthy(&self) -> bool {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.is_healthy(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.is_healthy(),
        }
    }

    pub fn stats(&self) -> RtspStats {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.stats(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RtspStats {
    pub frames_captured: u64,
    pub url: String,
}

struct SyntheticRtspSource {
    config: RtspConfig,
    frame_count: u64,
}

impl SyntheticRtspSource {
    fn new(config: RtspConfig) -> Self {
        Self {
            config,
            frame_count: 0,
        }
    }

    fn connect(&mut self) -> Result<()> {
        log::info!("synthetic camera {} ready", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.frame_count += 1;
        let pixels = self.generate_synthetic_pixels();
        Frame::new(
            pixels,
            self.config.width,
            self.config.height,
            PixelLayout::Bgr24,
            Local::now(),
        )
    }

    fn generate_synthetic_pixels(&self) -> Vec<u8> {
        let (w, h) = (self.config.width as usize, self.config.height as usize);
        let mut pixels = vec![SYNTHETIC_BACKGROUND; w * h * 3];

        let show_figure = self.config.figure_every != 0
            && self.frame_count % self.config.figure_every == 0;
        if !show_figure {
            return pixels;
        }

        let figure = synthetic_figure_box(self.config.width, self.config.height)
            .clamped(self.config.width, self.config.height);
        let [r, g, b] = SYNTHETIC_UNIFORM_RGB;
        for y in figure.y1 as usize..figure.y2 as usize {
            for x in figure.x1 as usize..figure.x2 as usize {
                let o = (y * w + x) * 3;
                pixels[o..o + 3].copy_from_slice(&[b, g, r]);
            }
        }
        pixels
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> RtspStats {
        RtspStats {
            frames_captured: self.frame_count,
            url: self.config.url.clone(),
        }
    }
}

/// Live camera: `rtspsrc ! decodebin ! videoconvert` into a one-slot BGR appsink
/// that drops stale buffers, so every pull returns the newest decoded frame.
#[cfg(feature = "rtsp-gstreamer")]
struct GstCamera {
    config: RtspConfig,
    pipeline: gstreamer::Pipeline,
    sink: gstreamer_app::AppSink,
    frames: u64,
    started: Option<Instant>,
    last_frame: Option<Instant>,
    failure: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstCamera {
    fn new(config: RtspConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let launch = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=BGR ! \
             appsink name=camera sync=false max-buffers=1 drop=true",
            config.url
        );
        let pipeline = gstreamer::parse::launch(&launch)
            .with_context(|| format!("build camera pipeline for {}", config.url))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("camera launch line did not produce a pipeline"))?;
        let sink = pipeline
            .by_name("camera")
            .context("camera appsink missing")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("camera sink is not an appsink"))?;

        Ok(Self {
            config,
            pipeline,
            sink,
            frames: 0,
            started: None,
            last_frame: None,
            failure: None,
        })
    }

    fn connect(&mut self) -> Result<()> {
        use gstreamer::prelude::*;
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .with_context(|| format!("start camera stream {}", self.config.url))?;
        self.started = Some(Instant::now());
        log::info!("camera stream {} playing", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if let Some(reason) = drain_bus(&self.pipeline) {
            self.failure = Some(reason);
        }
        if let Some(reason) = &self.failure {
            return Err(anyhow!("camera stream {} failed: {}", self.config.url, reason));
        }

        let wait = frame_budget(self.config.target_fps, 4, 500);
        let sample = self
            .sink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(wait.as_millis() as u64))
            .ok_or_else(|| anyhow!("no frame from {} within {:?}", self.config.url, wait))?;
        let captured_at = Local::now();

        let buffer = sample.buffer().context("camera sample without buffer")?;
        let caps = sample.caps().context("camera sample without caps")?;
        let info = gstreamer_video::VideoInfo::from_caps(caps).context("camera caps")?;
        let map = buffer.map_readable().context("map camera buffer")?;
        let pixels = pack_rows(
            map.as_slice(),
            info.stride()[0] as usize,
            info.width() as usize * 3,
            info.height() as usize,
        )?;

        self.frames += 1;
        self.last_frame = Some(Instant::now());
        Frame::new(pixels, info.width(), info.height(), PixelLayout::Bgr24, captured_at)
    }

    fn is_healthy(&self) -> bool {
        match (&self.failure, self.started, self.last_frame) {
            (Some(_), _, _) | (None, None, _) => false,
            (None, Some(started), None) => started.elapsed() <= Duration::from_secs(5),
            (None, Some(_), Some(last)) => {
                last.elapsed() <= frame_budget(self.config.target_fps, 6, 2_000)
            }
        }
    }

    fn stats(&self) -> RtspStats {
        RtspStats {
            frames_captured: self.frames,
            url: self.config.url.clone(),
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstCamera {
    fn drop(&mut self) {
        use gstreamer::prelude::*;
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

/// `multiple` frame intervals at `fps`, never below `floor_ms`.
#[cfg(feature = "rtsp-gstreamer")]
fn frame_budget(fps: u32, multiple: u32, floor_ms: u32) -> Duration {
    let interval = if fps == 0 { 0 } else { 1000 / fps };
    Duration::from_millis(u64::from(interval.saturating_mul(multiple).max(floor_ms)))
}

/// Pending error or end-of-stream on the pipeline bus, if any.
#[cfg(feature = "rtsp-gstreamer")]
fn drain_bus(pipeline: &gstreamer::Pipeline) -> Option<String> {
    use gstreamer::prelude::*;
    use gstreamer::MessageView;

    let bus = pipeline.bus()?;
    let mut failure = None;
    while let Some(message) = bus.pop() {
        match message.view() {
            MessageView::Error(err) => failure = Some(err.error().to_string()),
            MessageView::Eos(..) => failure = Some("end of stream".to_string()),
            _ => {}
        }
    }
    failure
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config() -> RtspConfig {
        RtspConfig {
            url: "stub://test".to_string(),
            target_fps: 10,
            width: 64,
            height: 48,
            figure_every: 3,
        }
    }

    #[test]
    fn rtsp_source_produces_frames() -> Result<()> {
        let mut source = RtspSource::new(stub_config())?;
        source.connect()?;

        let frame = source.next_frame()?;
        assert_eq!(frame.width, 64);
        assert_eq!(frame.height, 48);
        assert_eq!(frame.layout, PixelLayout::Bgr24);
        assert!(source.is_healthy());

        Ok(())
    }

    #[test]
    fn synthetic_figure_appears_on_schedule() -> Result<()> {
        let mut source = RtspSource::new(stub_config())?;
        let figure = synthetic_figure_box(64, 48);
        let cx = ((figure.x1 + figure.x2) / 2) as u32;
        let cy = ((figure.y1 + figure.y2) / 2) as u32;

        let first = source.next_frame()?;
        assert_eq!(first.rgb_at(cx, cy), [96, 96, 96]);
        source.next_frame()?;
        let third = source.next_frame()?;
        assert_eq!(third.rgb_at(cx, cy), SYNTHETIC_UNIFORM_RGB);
        assert_eq!(source.stats().frames_captured, 3);

        Ok(())
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn real_rtsp_requires_feature() {
        let config = RtspConfig {
            url: "rtsp://camera/stream".to_string(),
            ..stub_config()
        };
        assert!(RtspSource::new(config).is_err());
    }
}
