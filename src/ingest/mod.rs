//! Camera ingestion.
//!
//! This module provides the transports frames are read from:
//! - HTTP(S) MJPEG or JPEG snapshot cameras (`http://`, `https://`)
//! - Synthetic source for demos (`stub://`)
//! - Scripted source with programmable faults (testing)
//!
//! `VideoSource` wraps one transport and owns the connection state machine:
//! `Disconnected -> Connecting -> Streaming | Failed`, back to
//! `Disconnected` on `release()`. Whoever holds the source must release it
//! on every exit path; `Drop` releases as a last resort.

pub mod mjpeg;
pub mod scripted;
pub mod synthetic;

use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use url::Url;

use crate::config::CameraSettings;
use crate::error::AttendanceError;
use crate::frame::Frame;

pub use mjpeg::{MjpegConfig, MjpegSource};
pub use scripted::{ScriptedProbe, ScriptedSource, SessionEnd};
pub use synthetic::{SyntheticConfig, SyntheticSource};

/// A camera transport.
///
/// `read` returns `Ok(None)` when the stream ended. Transport errors are
/// reported as `ConnectionFailure`, undecodable frames as `DecodeFailure`.
pub trait FrameSource: Send {
    /// Address used in logs.
    fn describe(&self) -> String;

    fn open(&mut self) -> Result<()>;

    fn read(&mut self) -> Result<Option<Frame>, AttendanceError>;

    /// Drop any open connection. Must be safe to call repeatedly.
    fn close(&mut self);

    fn stats(&self) -> SourceStats;
}

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
    pub healthy: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Outcome of a successful read call.
#[derive(Debug)]
pub enum FrameRead {
    Frame(Frame),
    /// The transport ended or failed. The source must be released and
    /// reconnected before reading again.
    EndOfStream { reason: String },
}

/// One camera connection and its state machine.
pub struct VideoSource {
    transport: Box<dyn FrameSource>,
    state: ConnectionState,
    connect_attempts: u64,
}

impl VideoSource {
    pub fn new(transport: Box<dyn FrameSource>) -> Self {
        Self {
            transport,
            state: ConnectionState::Disconnected,
            connect_attempts: 0,
        }
    }

    /// Build a source from a camera URL (`http(s)://` or `stub://`).
    pub fn from_url(url: &str, read_timeout: Duration) -> Result<Self> {
        Ok(Self::new(open_transport(url, read_timeout, &[])?))
    }

    /// Build a source from camera settings, including fallback stream paths.
    pub fn from_camera(camera: &CameraSettings) -> Result<Self> {
        Ok(Self::new(open_transport(
            &camera.url,
            camera.read_timeout,
            &camera.fallback_paths,
        )?))
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.state == ConnectionState::Streaming
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts
    }

    pub fn stats(&self) -> SourceStats {
        self.transport.stats()
    }

    /// Attempt to open the stream. Any previous connection is released first.
    ///
    /// On failure the state is `Failed`; retrying is the caller's job.
    pub fn connect(&mut self) -> ConnectionState {
        if self.state != ConnectionState::Disconnected {
            self.release();
        }
        self.connect_attempts += 1;
        self.state = ConnectionState::Connecting;
        match self.transport.open() {
            Ok(()) => {
                log::info!(
                    "camera connected: {} (attempt {})",
                    self.transport.describe(),
                    self.connect_attempts
                );
                self.state = ConnectionState::Streaming;
            }
            Err(err) => {
                log::warn!(
                    "camera connect failed: {} (attempt {}): {:#}",
                    self.transport.describe(),
                    self.connect_attempts,
                    err
                );
                self.transport.close();
                self.state = ConnectionState::Failed;
            }
        }
        self.state
    }

    /// Read the next frame while `Streaming`.
    ///
    /// A transport failure is reported as `EndOfStream` and moves the source
    /// to `Failed`, so no further reads are attempted until reconnect.
    pub fn read_frame(&mut self) -> Result<FrameRead, AttendanceError> {
        if self.state != ConnectionState::Streaming {
            return Err(AttendanceError::ConnectionFailure(anyhow!(
                "camera is {}, not streaming",
                self.state
            )));
        }
        match self.transport.read() {
            Ok(Some(frame)) => Ok(FrameRead::Frame(frame)),
            Ok(None) => {
                self.state = ConnectionState::Failed;
                Ok(FrameRead::EndOfStream {
                    reason: "stream ended".to_string(),
                })
            }
            Err(AttendanceError::ConnectionFailure(err)) => {
                self.state = ConnectionState::Failed;
                Ok(FrameRead::EndOfStream {
                    reason: format!("{:#}", err),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Release the underlying connection. Idempotent.
    pub fn release(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.transport.close();
        self.state = ConnectionState::Disconnected;
        log::debug!("camera released: {}", self.transport.describe());
    }
}

impl Drop for VideoSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// Pick a transport for a camera URL.
pub fn open_transport(
    url: &str,
    read_timeout: Duration,
    fallback_paths: &[String],
) -> Result<Box<dyn FrameSource>> {
    let parsed = Url::parse(url).context("parse camera url")?;
    match parsed.scheme() {
        "http" | "https" => Ok(Box::new(MjpegSource::new(MjpegConfig {
            url: url.to_string(),
            read_timeout,
            fallback_paths: fallback_paths.to_vec(),
        }))),
        "stub" => Ok(Box::new(SyntheticSource::new(SyntheticConfig {
            url: url.to_string(),
            ..SyntheticConfig::default()
        }))),
        other => Err(anyhow!(
            "unsupported camera scheme '{}'; expected http(s) or stub",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn next_frame(source: &mut VideoSource) -> Frame {
        match source.read_frame() {
            Ok(FrameRead::Frame(frame)) => frame,
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn connect_failure_then_success() {
        let scripted = ScriptedSource::new().fail_connects(1);
        let probe = scripted.probe();
        let mut source = VideoSource::new(Box::new(scripted));
        assert_eq!(source.state(), ConnectionState::Disconnected);

        assert_eq!(source.connect(), ConnectionState::Failed);
        assert!(source.read_frame().is_err());

        assert_eq!(source.connect(), ConnectionState::Streaming);
        assert_eq!(source.connect_attempts(), 2);
        next_frame(&mut source);
        assert_eq!(probe.opens(), 1);
        assert_eq!(probe.open_failures(), 1);
    }

    #[test]
    fn end_of_stream_marks_source_failed() {
        let scripted = ScriptedSource::new().session(1, SessionEnd::EndOfStream);
        let mut source = VideoSource::new(Box::new(scripted));
        source.connect();
        next_frame(&mut source);

        match source.read_frame() {
            Ok(FrameRead::EndOfStream { reason }) => assert_eq!(reason, "stream ended"),
            other => panic!("expected end of stream, got {:?}", other),
        }
        assert_eq!(source.state(), ConnectionState::Failed);
        assert!(source.read_frame().is_err());
    }

    #[test]
    fn transport_error_is_reported_as_end_of_stream() {
        let scripted = ScriptedSource::new().session(0, SessionEnd::TransportError);
        let mut source = VideoSource::new(Box::new(scripted));
        source.connect();
        assert!(matches!(
            source.read_frame(),
            Ok(FrameRead::EndOfStream { .. })
        ));
    }

    #[test]
    fn decode_error_is_surfaced() {
        let scripted = ScriptedSource::new().session(0, SessionEnd::DecodeError);
        let mut source = VideoSource::new(Box::new(scripted));
        source.connect();
        assert!(matches!(
            source.read_frame(),
            Err(AttendanceError::DecodeFailure(_))
        ));
    }

    #[test]
    fn release_is_idempotent() {
        let scripted = ScriptedSource::new();
        let probe = scripted.probe();
        let mut source = VideoSource::new(Box::new(scripted));
        source.release();
        assert_eq!(probe.closes(), 0);

        source.connect();
        source.release();
        source.release();
        source.release();
        assert_eq!(source.state(), ConnectionState::Disconnected);
        assert_eq!(probe.closes(), 1);

        drop(source);
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn reconnect_releases_previous_connection() {
        let scripted = ScriptedSource::new();
        let probe = scripted.probe();
        let mut source = VideoSource::new(Box::new(scripted));
        source.connect();
        source.connect();
        assert_eq!(probe.opens(), 2);
        assert_eq!(probe.closes(), 1);
        assert!(source.is_streaming());
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        assert!(VideoSource::from_url("rtsp://cam/stream", Duration::from_secs(1)).is_err());
        assert!(VideoSource::from_url("stub://front", Duration::from_secs(1)).is_ok());
    }
}
