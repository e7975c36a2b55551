//! Detection-to-alert orchestration.
//!
//! Polling mode pulls frames from a `FrameSource` and runs the detector
//! locally. Push mode receives detection batches from elsewhere and pairs
//! them with the most recent frame from a `LatestFrame` cell.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::alert::{AlertDispatcher, AlertPayload, DispatchOutcome};
use crate::classify::UniformClassifier;
use crate::config::TeatimeConfig;
use crate::detect::{Detection, DetectorBackend};
use crate::frame::{Frame, LatestFrame};
use crate::gate::{AlertGate, Clock, FireDecision, GateState};
use crate::ingest::FrameSource;

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSettings {
    pub dormant_sleep: Duration,
    pub cooling_poll: Duration,
    pub cycle_interval: Duration,
    /// Push mode: how much older than a batch its paired frame may be.
    pub staleness_tolerance: Duration,
    /// Push mode: pushed detections below this are ignored.
    pub confidence_threshold: f32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            dormant_sleep: Duration::from_secs(60),
            cooling_poll: Duration::from_secs(1),
            cycle_interval: Duration::from_millis(100),
            staleness_tolerance: Duration::from_millis(500),
            confidence_threshold: 0.6,
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &TeatimeConfig) -> Self {
        Self {
            dormant_sleep: config.polling.dormant_sleep,
            cooling_poll: config.polling.cooling_poll,
            cycle_interval: config.polling.cycle_interval,
            staleness_tolerance: config.push.staleness_tolerance,
            confidence_threshold: config.detection.confidence_threshold,
        }
    }
}

/// Detections computed elsewhere for a frame captured at `captured_at`.
#[derive(Clone, Debug)]
pub struct DetectionBatch {
    pub captured_at: DateTime<Local>,
    pub detections: Vec<Detection>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    /// Outside every active window; nothing acquired.
    Dormant,
    Cooling { remaining: Duration },
    NoMatch { detections: usize },
    Alerted {
        confidence: f32,
        percentage: f64,
        delivery: DispatchOutcome,
    },
    /// Push mode: no frame has arrived yet.
    NoFrame,
    /// Push mode: the latest frame and the batch are further apart than the
    /// tolerance, in either direction.
    StaleFrame { skew: Duration },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub cycles: u64,
    pub frames: u64,
    pub detections: u64,
    pub detection_errors: u64,
    pub alerts: u64,
    pub delivered: u64,
    pub missing_frames: u64,
    pub stale_frames: u64,
}

pub struct Pipeline<C: Clock> {
    backend: Option<Box<dyn DetectorBackend>>,
    classifier: UniformClassifier,
    gate: AlertGate<C>,
    dispatcher: Box<dyn AlertDispatcher>,
    settings: PipelineSettings,
    stats: PipelineStats,
}

impl<C: Clock> Pipeline<C> {
    pub fn new(
        classifier: UniformClassifier,
        gate: AlertGate<C>,
        dispatcher: Box<dyn AlertDispatcher>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            backend: None,
            classifier,
            gate,
            dispatcher,
            settings,
            stats: PipelineStats::default(),
        }
    }

    /// Detector used by polling mode. Push mode does not need one.
    pub fn with_backend(mut self, backend: Box<dyn DetectorBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn gate(&self) -> &AlertGate<C> {
        &self.gate
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Classify boxes in order and alert on the first uniform match, if the
    /// gate allows it. At most one alert per call.
    pub fn evaluate_detections(&mut self, frame: &Frame, detections: &[Detection]) -> CycleOutcome {
        self.stats.detections += detections.len() as u64;
        for detection in detections.iter().filter(|d| d.is_person()) {
            let result = self.classifier.classify(frame, &detection.bbox);
            if !result.matched {
                log::debug!(
                    "person at {:?} below uniform threshold ({:.1}%)",
                    detection.bbox,
                    result.percentage
                );
                continue;
            }
            log::info!(
                "uniform match: confidence {:.2}, colour coverage {:.1}%",
                detection.confidence,
                result.percentage
            );
            return match self.gate.try_fire() {
                FireDecision::Fire { at } => {
                    let payload = AlertPayload::new(detection.confidence, at);
                    let delivery = self.dispatcher.dispatch(&payload);
                    self.stats.alerts += 1;
                    if delivery.is_delivered() {
                        self.stats.delivered += 1;
                    }
                    log::info!(
                        "cooldown started for {}s",
                        self.gate.cooldown_remaining().as_secs()
                    );
                    CycleOutcome::Alerted {
                        confidence: detection.confidence,
                        percentage: result.percentage,
                        delivery,
                    }
                }
                FireDecision::Suppressed(GateState::Dormant) => CycleOutcome::Dormant,
                FireDecision::Suppressed(_) => CycleOutcome::Cooling {
                    remaining: self.gate.cooldown_remaining(),
                },
            };
        }
        CycleOutcome::NoMatch {
            detections: detections.len(),
        }
    }

    /// One polling cycle.
    ///
    /// Frame acquisition errors are returned; detector errors are logged and
    /// the cycle continues with no detections.
    pub fn poll_once(&mut self, source: &mut dyn FrameSource) -> Result<CycleOutcome> {
        self.stats.cycles += 1;
        match self.gate.evaluate() {
            GateState::Dormant => Ok(CycleOutcome::Dormant),
            GateState::Cooling => {
                // keep the stream drained while waiting
                source.next_frame()?;
                self.stats.frames += 1;
                Ok(CycleOutcome::Cooling {
                    remaining: self.gate.cooldown_remaining(),
                })
            }
            GateState::Armed => {
                let frame = source.next_frame()?;
                self.stats.frames += 1;
                let backend = self
                    .backend
                    .as_mut()
                    .ok_or_else(|| anyhow!("polling mode requires a detector backend"))?;
                let detections = match backend.detect(&frame) {
                    Ok(detections) => detections,
                    Err(err) => {
                        self.stats.detection_errors += 1;
                        log::warn!("detection failed on {}: {:#}", backend.name(), err);
                        Vec::new()
                    }
                };
                Ok(self.evaluate_detections(&frame, &detections))
            }
        }
    }

    /// Run polling cycles until `shutdown` is set or a frame cannot be acquired.
    pub fn run_polling(&mut self, source: &mut dyn FrameSource, shutdown: &AtomicBool) -> Result<()> {
        let mut last_state: Option<GateState> = None;
        let mut last_status = Instant::now();
        while !shutdown.load(Ordering::SeqCst) {
            let cycle_start = Instant::now();
            let outcome = self.poll_once(source)?;

            let state = self.gate.state();
            if last_state != Some(state) {
                log::info!("gate {}", state);
                last_state = Some(state);
            }

            let pause = match &outcome {
                CycleOutcome::Dormant => self.settings.dormant_sleep,
                CycleOutcome::Cooling { remaining } => {
                    log::debug!("cooldown active, {}s remaining", remaining.as_secs());
                    self.settings.cooling_poll
                }
                _ => self
                    .settings
                    .cycle_interval
                    .saturating_sub(cycle_start.elapsed()),
            };

            if last_status.elapsed() >= STATUS_LOG_INTERVAL {
                log::info!(
                    "cycles={} frames={} detections={} alerts={} delivered={}",
                    self.stats.cycles,
                    self.stats.frames,
                    self.stats.detections,
                    self.stats.alerts,
                    self.stats.delivered
                );
                last_status = Instant::now();
            }

            sleep_unless_shutdown(pause, shutdown);
        }
        log::info!("polling stopped");
        Ok(())
    }

    /// Pair a pushed detection batch with the latest frame and evaluate it.
    ///
    /// The pair is rejected when the frame is older or newer than the batch
    /// by more than the staleness tolerance.
    pub fn handle_detection_batch(
        &mut self,
        batch: &DetectionBatch,
        latest: &LatestFrame,
    ) -> Result<CycleOutcome> {
        self.stats.cycles += 1;
        match self.gate.evaluate() {
            GateState::Dormant => return Ok(CycleOutcome::Dormant),
            GateState::Cooling => {
                return Ok(CycleOutcome::Cooling {
                    remaining: self.gate.cooldown_remaining(),
                })
            }
            GateState::Armed => {}
        }

        let Some(frame) = latest.latest()? else {
            self.stats.missing_frames += 1;
            log::debug!("detection batch dropped: no frame received yet");
            return Ok(CycleOutcome::NoFrame);
        };

        let offset_ms = batch
            .captured_at
            .signed_duration_since(frame.captured_at)
            .num_milliseconds();
        let skew = Duration::from_millis(offset_ms.unsigned_abs());
        if skew > self.settings.staleness_tolerance {
            self.stats.stale_frames += 1;
            log::warn!(
                "detection batch dropped: latest frame is {}ms {} the batch",
                skew.as_millis(),
                if offset_ms > 0 { "older than" } else { "newer than" }
            );
            return Ok(CycleOutcome::StaleFrame { skew });
        }
        self.stats.frames += 1;

        let threshold = self.settings.confidence_threshold;
        let detections: Vec<Detection> = batch
            .detections
            .iter()
            .filter(|d| d.is_person() && d.passes(threshold))
            .filter_map(|d| {
                let bbox = d.bbox.clamped(frame.width, frame.height);
                bbox.is_valid()
                    .then(|| Detection::new(bbox, d.confidence, d.label.clone()))
            })
            .collect();
        Ok(self.evaluate_detections(&frame, &detections))
    }
}

fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + total;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(SHUTDOWN_POLL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RecordingDispatcher;
    use crate::detect::StubBackend;
    use crate::frame::BoundingBox;
    use crate::gate::{ManualClock, TimeWindow};
    use crate::ingest::rtsp::SYNTHETIC_UNIFORM_RGB;
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    struct SharedRecorder(Arc<Mutex<Vec<AlertPayload>>>);

    impl AlertDispatcher for SharedRecorder {
        fn dispatch(&mut self, payload: &AlertPayload) -> DispatchOutcome {
            self.0.lock().unwrap().push(payload.clone());
            DispatchOutcome::Delivered
        }
    }

    struct SolidSource {
        rgb: [u8; 3],
        clock: Arc<ManualClock>,
        served: usize,
        fail: bool,
    }

    impl FrameSource for SolidSource {
        fn next_frame(&mut self) -> Result<Frame> {
            if self.fail {
                return Err(anyhow!("camera gone"));
            }
            self.served += 1;
            Frame::solid(64, 64, self.rgb, self.clock.now())
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 4, h, m, s).unwrap()
    }

    fn build(clock: Arc<ManualClock>) -> (Pipeline<Arc<ManualClock>>, Arc<Mutex<Vec<AlertPayload>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let gate = AlertGate::new(
            vec![TimeWindow::parse("10:00-12:00").unwrap()],
            Duration::from_secs(900),
            clock,
        );
        let pipeline = Pipeline::new(
            UniformClassifier::default(),
            gate,
            Box::new(SharedRecorder(sent.clone())),
            PipelineSettings::default(),
        );
        (pipeline, sent)
    }

    fn figure() -> Detection {
        Detection::person(BoundingBox::new(0, 0, 64, 64), 0.8)
    }

    #[test]
    fn dormant_cycle_acquires_nothing() {
        let clock = Arc::new(ManualClock::new(at(9, 0, 0)));
        let (mut pipeline, sent) = build(clock.clone());
        let mut source = SolidSource { rgb: SYNTHETIC_UNIFORM_RGB, clock, served: 0, fail: true };
        assert_eq!(pipeline.poll_once(&mut source).unwrap(), CycleOutcome::Dormant);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn armed_match_alerts_once_then_cools() {
        let clock = Arc::new(ManualClock::new(at(10, 30, 0)));
        let (pipeline, sent) = build(clock.clone());
        let mut backend = StubBackend::new().with_fallback(vec![figure()]);
        backend.push(vec![figure(), figure()]);
        let mut pipeline = pipeline.with_backend(Box::new(backend));
        let mut source = SolidSource { rgb: SYNTHETIC_UNIFORM_RGB, clock: clock.clone(), served: 0, fail: false };

        let outcome = pipeline.poll_once(&mut source).unwrap();
        assert!(matches!(outcome, CycleOutcome::Alerted { delivery: DispatchOutcome::Delivered, .. }));
        assert_eq!(sent.lock().unwrap().len(), 1);

        clock.advance(Duration::from_secs(10));
        let outcome = pipeline.poll_once(&mut source).unwrap();
        assert_eq!(outcome, CycleOutcome::Cooling { remaining: Duration::from_secs(890) });
        assert_eq!(source.served, 2);
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn detector_error_counts_as_no_detections() {
        let clock = Arc::new(ManualClock::new(at(11, 0, 0)));
        let (pipeline, sent) = build(clock.clone());
        let mut backend = StubBackend::new();
        backend.push_error("inference timeout");
        let mut pipeline = pipeline.with_backend(Box::new(backend));
        let mut source = SolidSource { rgb: SYNTHETIC_UNIFORM_RGB, clock, served: 0, fail: false };

        assert_eq!(pipeline.poll_once(&mut source).unwrap(), CycleOutcome::NoMatch { detections: 0 });
        assert_eq!(pipeline.stats().detection_errors, 1);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn acquisition_failure_is_returned() {
        let clock = Arc::new(ManualClock::new(at(11, 0, 0)));
        let (pipeline, _) = build(clock.clone());
        let mut pipeline = pipeline.with_backend(Box::new(StubBackend::new()));
        let mut source = SolidSource { rgb: [0, 0, 0], clock, served: 0, fail: true };
        let shutdown = AtomicBool::new(false);
        assert!(pipeline.run_polling(&mut source, &shutdown).is_err());
    }

    #[test]
    fn non_uniform_person_does_not_alert() {
        let clock = Arc::new(ManualClock::new(at(11, 0, 0)));
        let (mut pipeline, sent) = build(clock.clone());
        let frame = Frame::solid(64, 64, [20, 200, 20], clock.now()).unwrap();
        let outcome = pipeline.evaluate_detections(&frame, &[figure()]);
        assert_eq!(outcome, CycleOutcome::NoMatch { detections: 1 });
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn push_batch_requires_fresh_frame() {
        let clock = Arc::new(ManualClock::new(at(10, 5, 0)));
        let (mut pipeline, sent) = build(clock.clone());
        let latest = LatestFrame::new();
        let batch = DetectionBatch { captured_at: at(10, 5, 2), detections: vec![figure()] };

        assert_eq!(pipeline.handle_detection_batch(&batch, &latest).unwrap(), CycleOutcome::NoFrame);

        latest.store(Frame::solid(64, 64, SYNTHETIC_UNIFORM_RGB, at(10, 5, 0)).unwrap()).unwrap();
        assert_eq!(
            pipeline.handle_detection_batch(&batch, &latest).unwrap(),
            CycleOutcome::StaleFrame { skew: Duration::from_secs(2) }
        );

        latest.store(Frame::solid(64, 64, SYNTHETIC_UNIFORM_RGB, at(10, 5, 2)).unwrap()).unwrap();
        let outcome = pipeline.handle_detection_batch(&batch, &latest).unwrap();
        assert!(matches!(outcome, CycleOutcome::Alerted { .. }));
        assert_eq!(sent.lock().unwrap().len(), 1);
        assert_eq!(pipeline.stats().stale_frames, 1);
    }

    #[test]
    fn push_batch_rejects_frame_far_newer_than_batch() {
        let clock = Arc::new(ManualClock::new(at(10, 5, 0)));
        let (mut pipeline, sent) = build(clock.clone());
        let latest = LatestFrame::new();
        let delayed = DetectionBatch { captured_at: at(10, 5, 0), detections: vec![figure()] };

        latest.store(Frame::solid(64, 64, SYNTHETIC_UNIFORM_RGB, at(10, 5, 3)).unwrap()).unwrap();
        assert_eq!(
            pipeline.handle_detection_batch(&delayed, &latest).unwrap(),
            CycleOutcome::StaleFrame { skew: Duration::from_secs(3) }
        );
        assert!(sent.lock().unwrap().is_empty());

        // a frame slightly ahead of its detections is within tolerance
        let recent = DetectionBatch {
            captured_at: at(10, 5, 3) - chrono::Duration::milliseconds(300),
            detections: vec![figure()],
        };
        let outcome = pipeline.handle_detection_batch(&recent, &latest).unwrap();
        assert!(matches!(outcome, CycleOutcome::Alerted { .. }));
    }

    #[test]
    fn push_batch_ignores_low_confidence_and_other_labels() {
        let clock = Arc::new(ManualClock::new(at(10, 5, 0)));
        let (mut pipeline, sent) = build(clock.clone());
        let latest = LatestFrame::new();
        latest.store(Frame::solid(64, 64, SYNTHETIC_UNIFORM_RGB, at(10, 5, 0)).unwrap()).unwrap();
        let batch = DetectionBatch {
            captured_at: at(10, 5, 0),
            detections: vec![
                Detection::person(BoundingBox::new(0, 0, 64, 64), 0.3),
                // exactly at the threshold
                Detection::person(BoundingBox::new(0, 0, 64, 64), 0.6),
                Detection::new(BoundingBox::new(0, 0, 64, 64), 0.95, "chair"),
            ],
        };
        assert_eq!(
            pipeline.handle_detection_batch(&batch, &latest).unwrap(),
            CycleOutcome::NoMatch { detections: 0 }
        );
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_delivery_still_starts_cooldown() {
        let clock = Arc::new(ManualClock::new(at(10, 0, 0)));
        let gate = AlertGate::new(vec![TimeWindow::parse("10:00-12:00").unwrap()], Duration::from_secs(900), clock.clone());
        let mut pipeline = Pipeline::new(
            UniformClassifier::default(),
            gate,
            Box::new(RecordingDispatcher::answering(DispatchOutcome::Failed("timeout".into()))),
            PipelineSettings::default(),
        );
        let frame = Frame::solid(64, 64, SYNTHETIC_UNIFORM_RGB, clock.now()).unwrap();
        let outcome = pipeline.evaluate_detections(&frame, &[figure()]);
        assert!(matches!(outcome, CycleOutcome::Alerted { delivery: DispatchOutcome::Failed(_), .. }));
        // failed delivery still starts the cooldown
        assert_eq!(pipeline.gate().state(), GateState::Cooling);
        assert_eq!(pipeline.stats().delivered, 0);
    }
}
