//! TeaTime edge node.
//!
//! Watches a camera feed for people wearing the tea-service uniform and
//! notifies a display node, but only during configured service windows and
//! at most once per cooldown.
//!
//! # Module Structure
//!
//! - `frame`: frames, boxes and the single-slot `LatestFrame` cell
//! - `ingest`: frame sources (RTSP, synthetic `stub://`) and pixel conversions
//! - `detect`: person detectors and backend selection
//! - `bpu`: accelerator binding and FCOS output decoding
//! - `classify`: HSV uniform classifier
//! - `gate`: time-window and cooldown state machine
//! - `alert`: HTTP alert dispatch
//! - `pipeline`: polling and push orchestration
//! - `transport`: MQTT push mode
//! - `receiver`: display-node alert receiver
//! - `config`: file and environment configuration

pub mod alert;
pub mod bpu;
pub mod classify;
pub mod config;
pub mod detect;
pub mod frame;
pub mod gate;
pub mod ingest;
pub mod pipeline;
pub mod receiver;
pub mod transport;

pub use alert::{AlertDispatcher, AlertPayload, DispatchOutcome, HttpAlertSink};
pub use classify::{HsvRange, UniformClassifier, UniformResult};
pub use config::{RunMode, TeatimeConfig};
pub use detect::{BackendChain, Detection, DetectorBackend};
pub use frame::{BoundingBox, Frame, LatestFrame, PixelLayout};
pub use gate::{AlertGate, Clock, GateState, ManualClock, SystemClock, TimeWindow};
pub use ingest::{FrameSource, RtspConfig, RtspSource};
pub use pipeline::{CycleOutcome, DetectionBatch, Pipeline, PipelineSettings, PipelineStats};
pub use receiver::{AlertReceiver, ReceiverConfig, ReceiverHandle};
