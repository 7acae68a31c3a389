//! Background detection loop.
//!
//! State machine: `Idle -> Connecting -> Detecting`, and on any cycle failure
//! `Detecting -> Disconnected -> Connecting` after a fixed reconnect delay.
//! Connect attempts are retried forever at the same fixed delay. The loop
//! only exits when its shutdown flag is raised, releasing the camera on the
//! way out.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::Local;
use serde::Serialize;

use crate::detect::FaceDetector;
use crate::error::AttendanceError;
use crate::ingest::{ConnectionState, FrameRead, SourceStats};
use crate::policy::ApprovalPolicy;
use crate::state::SharedDetectionState;

pub const DEFAULT_DETECTION_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

const SLEEP_SLICE: Duration = Duration::from_millis(50);
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug)]
pub struct PipelineConfig {
    pub policy: ApprovalPolicy,
    /// Pause after each successful cycle. Caps detection rate.
    pub detection_interval: Duration,
    /// Pause after a failed connect or a failed cycle.
    pub reconnect_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            policy: ApprovalPolicy::default(),
            detection_interval: DEFAULT_DETECTION_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PipelineState {
    Idle = 0,
    Connecting = 1,
    Detecting = 2,
    Disconnected = 3,
    Stopped = 4,
}

impl PipelineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PipelineState::Connecting,
            2 => PipelineState::Detecting,
            3 => PipelineState::Disconnected,
            4 => PipelineState::Stopped,
            _ => PipelineState::Idle,
        }
    }
}

/// Notifications for observers (tests, diagnostics).
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    State(PipelineState),
    Connection(ConnectionState),
    Published { sequence: u64 },
    CycleFailed { kind: &'static str },
}

/// Counters readable while the pipeline runs.
#[derive(Debug, Default)]
pub struct PipelineStats {
    state: AtomicU8,
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    frames_processed: AtomicU64,
    publishes: AtomicU64,
    cycle_failures: AtomicU64,
}

impl PipelineStats {
    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn connect_failures(&self) -> u64 {
        self.connect_failures.load(Ordering::SeqCst)
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::SeqCst)
    }

    pub fn publishes(&self) -> u64 {
        self.publishes.load(Ordering::SeqCst)
    }

    pub fn cycle_failures(&self) -> u64 {
        self.cycle_failures.load(Ordering::SeqCst)
    }
}

pub struct DetectionPipeline {
    shared: Arc<SharedDetectionState>,
    detector: Box<dyn FaceDetector>,
    config: PipelineConfig,
    shutdown: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    events: Option<Sender<PipelineEvent>>,
    state: PipelineState,
    last_health_log: Instant,
}

impl DetectionPipeline {
    pub fn new(
        shared: Arc<SharedDetectionState>,
        detector: Box<dyn FaceDetector>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            shared,
            detector,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(PipelineStats::default()),
            events: None,
            state: PipelineState::Idle,
            last_health_log: Instant::now(),
        }
    }

    /// Send every state change and publish to `events`.
    pub fn with_events(mut self, events: Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Share an existing shutdown flag (for example with the frame streamer).
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Run the loop on a dedicated thread.
    pub fn spawn(self) -> Result<PipelineHandle> {
        let shutdown = self.shutdown.clone();
        let stats = self.stats.clone();
        let join = std::thread::Builder::new()
            .name("detection-pipeline".to_string())
            .spawn(move || self.run())?;
        Ok(PipelineHandle {
            shutdown,
            stats,
            join: Some(join),
        })
    }

    /// Run the loop on the current thread until shutdown.
    pub fn run(mut self) {
        log::info!("detection pipeline started (detector={})", self.detector.name());
        if let Err(err) = self.detector.warm_up() {
            log::warn!("detector warm-up failed: {:#}", err);
        }

        while !self.stopping() {
            match self.state {
                PipelineState::Idle | PipelineState::Disconnected => {
                    self.set_state(PipelineState::Connecting)
                }
                PipelineState::Connecting => self.try_connect(),
                PipelineState::Detecting => match self.cycle() {
                    Ok(()) => {
                        self.maybe_log_health();
                        self.pause(self.config.detection_interval);
                    }
                    Err(err) => {
                        log::warn!("detection cycle failed ({}): {}", err.kind(), err);
                        self.stats.cycle_failures.fetch_add(1, Ordering::SeqCst);
                        self.emit(PipelineEvent::CycleFailed { kind: err.kind() });
                        self.disconnect();
                        self.pause(self.config.reconnect_delay);
                    }
                },
                PipelineState::Stopped => break,
            }
        }

        self.disconnect();
        self.set_state(PipelineState::Stopped);
        log::info!("detection pipeline stopped");
    }

    fn try_connect(&mut self) {
        self.stats.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.emit(PipelineEvent::Connection(ConnectionState::Connecting));
        match self.shared.with_connection(|source| source.connect()) {
            Ok(ConnectionState::Streaming) => {
                self.emit(PipelineEvent::Connection(ConnectionState::Streaming));
                self.set_state(PipelineState::Detecting);
            }
            Ok(outcome) => {
                self.stats.connect_failures.fetch_add(1, Ordering::SeqCst);
                self.emit(PipelineEvent::Connection(outcome));
                self.pause(self.config.reconnect_delay);
            }
            Err(err) => {
                self.stats.connect_failures.fetch_add(1, Ordering::SeqCst);
                log::error!("camera connect skipped: {}", err);
                self.pause(self.config.reconnect_delay);
            }
        }
    }

    /// One read -> convert -> detect -> decide -> publish pass.
    fn cycle(&mut self) -> Result<(), AttendanceError> {
        let frame = match self.shared.with_connection(|source| source.read_frame())?? {
            FrameRead::Frame(frame) => frame,
            FrameRead::EndOfStream { reason } => {
                return Err(AttendanceError::ConnectionFailure(anyhow!(
                    "camera stream ended: {}",
                    reason
                )))
            }
        };

        // Lock is not held from here until publish.
        let frame = frame.into_format(self.detector.input_format());
        let batch = self
            .detector
            .detect(&frame)
            .map_err(AttendanceError::DetectorFailure)?;
        let status = self.config.policy.decide(&batch, Local::now());
        let faces = batch.len();
        let sequence = self.shared.publish(batch, status)?;

        self.stats.frames_processed.fetch_add(1, Ordering::SeqCst);
        self.stats.publishes.fetch_add(1, Ordering::SeqCst);
        log::debug!("published #{}: {} face(s), {}", sequence, faces, status);
        self.emit(PipelineEvent::Published { sequence });
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Err(err) = self.shared.with_connection(|source| source.release()) {
            log::error!("camera release skipped: {}", err);
        }
        if self.state != PipelineState::Idle {
            self.set_state(PipelineState::Disconnected);
        }
    }

    fn set_state(&mut self, state: PipelineState) {
        if self.state == state {
            return;
        }
        log::debug!("pipeline state {:?} -> {:?}", self.state, state);
        self.state = state;
        self.stats.state.store(state as u8, Ordering::SeqCst);
        self.emit(PipelineEvent::State(state));
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            // A dropped receiver just means nobody is watching.
            let _ = events.send(event);
        }
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on shutdown.
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stopping() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    fn maybe_log_health(&mut self) {
        if self.last_health_log.elapsed() < HEALTH_LOG_INTERVAL {
            return;
        }
        self.last_health_log = Instant::now();
        match self.shared.with_connection(|source| source.stats()) {
            Ok(source) => log::info!("{}", health_line(&self.stats, &source)),
            Err(err) => log::warn!("pipeline health unavailable: {}", err),
        }
    }
}

fn health_line(stats: &PipelineStats, source: &SourceStats) -> String {
    format!(
        "pipeline health: frames={} publishes={} connect_attempts={} connect_failures={} cycle_failures={} camera_frames={} camera_healthy={} url={}",
        stats.frames_processed(),
        stats.publishes(),
        stats.connect_attempts(),
        stats.connect_failures(),
        stats.cycle_failures(),
        source.frames_captured,
        source.healthy,
        source.source
    )
}

/// Running pipeline thread.
#[derive(Debug)]
pub struct PipelineHandle {
    shutdown: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    join: Option<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Raise the shutdown flag and wait for the loop to release the camera.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("detection pipeline thread panicked"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Detection, DetectionBatch, StubFaceDetector};
    use crate::ingest::{ScriptedSource, SessionEnd, VideoSource};
    use crate::policy::AttendanceState;
    use std::sync::mpsc;

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            policy: ApprovalPolicy::default(),
            detection_interval: Duration::from_millis(5),
            reconnect_delay: Duration::from_millis(20),
        }
    }

    fn shared(source: ScriptedSource) -> Arc<SharedDetectionState> {
        Arc::new(SharedDetectionState::new(VideoSource::new(Box::new(
            source,
        ))))
    }

    fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn publishes_decision_for_best_face() -> Result<()> {
        let batch = DetectionBatch::new(vec![
            Detection::new(BoundingBox::new(0, 0, 4, 4), 0.62),
            Detection::new(BoundingBox::new(8, 8, 4, 4), 0.81),
        ]);
        let state = shared(ScriptedSource::new());
        let handle = DetectionPipeline::new(
            state.clone(),
            Box::new(StubFaceDetector::fixed(batch.clone())),
            fast_config(),
        )
        .spawn()?;

        let stats = handle.stats();
        wait_for("first publish", || stats.publishes() >= 1);
        let snap = state.read_snapshot()?;
        assert_eq!(snap.batch, batch);
        assert_eq!(snap.status.state(), AttendanceState::Approved);
        assert_eq!(stats.state(), PipelineState::Detecting);

        handle.stop()?;
        assert_eq!(stats.state(), PipelineState::Stopped);
        assert_eq!(state.connection_state()?, ConnectionState::Disconnected);
        Ok(())
    }

    #[test]
    fn health_line_reports_attempts_and_failures_separately() {
        let stats = PipelineStats::default();
        stats.connect_attempts.store(4, Ordering::SeqCst);
        stats.connect_failures.store(3, Ordering::SeqCst);
        let source = SourceStats {
            frames_captured: 12,
            source: "stub://front".to_string(),
            healthy: true,
        };
        let line = health_line(&stats, &source);
        assert!(line.contains("connect_attempts=4"));
        assert!(line.contains("connect_failures=3"));
        assert!(!line.contains("reconnects"));
    }

    #[test]
    fn retries_connect_until_camera_appears() -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let state = shared(ScriptedSource::new().fail_connects(3));
        let handle = DetectionPipeline::new(
            state.clone(),
            Box::new(StubFaceDetector::default()),
            fast_config(),
        )
        .with_events(tx)
        .spawn()?;

        let stats = handle.stats();
        wait_for("publish after reconnects", || stats.publishes() >= 1);
        handle.stop()?;

        let events: Vec<_> = rx.try_iter().collect();
        let streaming_at = events
            .iter()
            .position(|e| *e == PipelineEvent::Connection(ConnectionState::Streaming))
            .expect("camera eventually streams");
        let connection_events: Vec<_> = events[..streaming_at]
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Connection(c) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(
            connection_events,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Failed,
                ConnectionState::Connecting,
                ConnectionState::Failed,
                ConnectionState::Connecting,
                ConnectionState::Failed,
                ConnectionState::Connecting,
            ]
        );
        assert!(!events[..streaming_at]
            .iter()
            .any(|e| matches!(e, PipelineEvent::Published { .. })));
        assert_eq!(stats.connect_failures(), 3);
        assert_eq!(
            state.read_snapshot()?.status.state(),
            AttendanceState::NoFaceDetected
        );
        Ok(())
    }

    #[test]
    fn read_failure_triggers_release_and_reconnect() -> Result<()> {
        let source = ScriptedSource::new()
            .session(2, SessionEnd::EndOfStream)
            .session(1, SessionEnd::TransportError)
            .session(1, SessionEnd::DecodeError);
        let probe = source.probe();
        let state = shared(source);
        let handle = DetectionPipeline::new(
            state.clone(),
            Box::new(StubFaceDetector::default()),
            fast_config(),
        )
        .spawn()?;

        let stats = handle.stats();
        wait_for("fourth session publishing", || probe.opens() >= 4 && stats.publishes() >= 5);
        assert_eq!(stats.cycle_failures(), 3);
        assert_eq!(probe.closes(), 3);

        handle.stop()?;
        assert_eq!(probe.closes(), 4);
        Ok(())
    }

    #[test]
    fn detector_failure_does_not_stop_the_loop() -> Result<()> {
        let detector = StubFaceDetector::default()
            .then_error("inference failed")
            .then_error("inference failed again");
        let state = shared(ScriptedSource::new());
        let handle =
            DetectionPipeline::new(state.clone(), Box::new(detector), fast_config()).spawn()?;

        let stats = handle.stats();
        wait_for("recovery after detector errors", || stats.publishes() >= 1);
        assert_eq!(stats.cycle_failures(), 2);
        assert!(stats.connect_attempts() >= 3);
        handle.stop()?;
        Ok(())
    }

    #[test]
    fn stop_interrupts_reconnect_delay() -> Result<()> {
        let config = PipelineConfig {
            reconnect_delay: Duration::from_secs(60),
            ..fast_config()
        };
        let state = shared(ScriptedSource::new().fail_connects(u64::MAX));
        let handle =
            DetectionPipeline::new(state, Box::new(StubFaceDetector::default()), config).spawn()?;
        let stats = handle.stats();
        wait_for("first failed connect", || stats.connect_failures() >= 1);

        let started = Instant::now();
        handle.stop()?;
        assert!(started.elapsed() < Duration::from_secs(5));
        Ok(())
    }
}
