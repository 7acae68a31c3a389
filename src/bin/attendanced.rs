//! attendanced - face-detection attendance daemon
//!
//! This daemon:
//! 1. Loads configuration (ATTENDANCE_CONFIG file + environment overrides)
//! 2. Verifies detector model assets and builds the detector
//! 3. Opens the attendance database
//! 4. Runs the detection pipeline against the configured camera
//! 5. Serves the status, live view, save and history endpoints
//! 6. Stops both on Ctrl-C, releasing the camera

use anyhow::Result;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use attendance_kernel::{
    api::{ApiConfig, ApiContext, ApiServer, SharedRecorder},
    build_detector,
    config::AttendancedConfig,
    AttendanceRecorder, DetectionPipeline, SharedDetectionState, SqliteAttendanceStore, VideoSource,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AttendancedConfig::load()?;
    log::info!(
        "attendanced {} starting: camera={} db={} detector={:?} threshold={}",
        env!("CARGO_PKG_VERSION"),
        config.camera.url,
        config.db_path,
        config.detector.backend,
        config.policy.approval_threshold
    );

    // Refuse to start without the model files.
    let detector = build_detector(&config.detector)?;

    let store: Box<dyn AttendanceRecorder> = Box::new(SqliteAttendanceStore::open(&config.db_path)?);
    let recorder: SharedRecorder = Arc::new(Mutex::new(store));
    let source = VideoSource::from_camera(&config.camera)?;
    let shared = Arc::new(SharedDetectionState::new(source));

    let pipeline =
        DetectionPipeline::new(shared.clone(), detector, config.pipeline_config()?).spawn()?;

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        history_limit: config.policy.history_limit,
        stream_idle: config.policy.stream_idle,
    };
    let api_handle = ApiServer::new(
        api_config,
        ApiContext {
            shared,
            recorder,
            policy: config.approval_policy()?,
        },
    )
    .spawn()?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("attendanced waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping api and pipeline...");
    api_handle.stop()?;
    pipeline.stop()?;
    log::info!("attendanced stopped");

    Ok(())
}
