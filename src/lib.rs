//! Attendance Kernel
//!
//! Face-detection attendance for a single IP camera.
//!
//! # Architecture
//!
//! A background `DetectionPipeline` reads frames from one `VideoSource`,
//! runs a `FaceDetector`, applies the attendance decision policy and
//! publishes the result into `SharedDetectionState`. Request-driven readers
//! (status queries, the live `FrameStreamer`, the save action) only ever see
//! consistent snapshots of that state.
//!
//! The pipeline never dies on camera or detector errors: it releases the
//! camera, waits a fixed delay and reconnects, forever, until shut down.
//!
//! # Module Structure
//!
//! - `ingest`: camera transports and the `VideoSource` connection state machine
//! - `frame`: decoded frames, colour conversion, annotation, JPEG encoding
//! - `detect`: detector trait, backends, detection batches
//! - `policy`: attendance decision policy and status
//! - `state`: the single shared lock around camera and published results
//! - `pipeline`: background detection loop
//! - `streamer`: annotated MJPEG parts for live display
//! - `attendance` / `storage`: save action and attendance persistence
//! - `api` / `config`: HTTP surface and daemon configuration

pub mod api;
pub mod attendance;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod policy;
pub mod state;
pub mod storage;
pub mod streamer;

pub use attendance::save_attendance;
pub use detect::{
    build_detector, BoundingBox, Detection, DetectionBatch, FaceDetector, ModelAssets,
    StubFaceDetector,
};
#[cfg(feature = "backend-tract")]
pub use detect::TractFaceDetector;
pub use error::AttendanceError;
pub use frame::{Frame, PixelFormat};
pub use ingest::{ConnectionState, FrameRead, FrameSource, VideoSource};
pub use pipeline::{
    DetectionPipeline, PipelineConfig, PipelineEvent, PipelineHandle, PipelineState,
    PipelineStats,
};
pub use policy::{ApprovalPolicy, ApprovalStatus, AttendanceState, AttendanceStatus};
pub use state::{SharedDetectionState, Snapshot};
pub use storage::{
    AttendanceRecord, AttendanceRecorder, InMemoryAttendanceStore, NewAttendance,
    SqliteAttendanceStore,
};
pub use streamer::FrameStreamer;
