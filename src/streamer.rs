//! Live annotated MJPEG view.
//!
//! `FrameStreamer` is an endless iterator of multipart parts. Each part is a
//! fresh camera frame with the boxes of the latest published snapshot drawn
//! on it. The overlay is best effort: the boxes may come from an earlier
//! frame than the one they are drawn on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::AttendanceError;
use crate::frame::PixelFormat;
use crate::ingest::FrameRead;
use crate::state::SharedDetectionState;

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
pub const DEFAULT_STREAM_IDLE: Duration = Duration::from_millis(100);

const JPEG_QUALITY: u8 = 80;

/// Wrap one JPEG in multipart framing.
pub fn multipart_part(jpeg: &[u8]) -> Vec<u8> {
    let header = format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", BOUNDARY);
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

pub struct FrameStreamer {
    shared: Arc<SharedDetectionState>,
    idle: Duration,
    shutdown: Arc<AtomicBool>,
    parts_sent: u64,
}

impl FrameStreamer {
    pub fn new(shared: Arc<SharedDetectionState>, idle: Duration) -> Self {
        Self {
            shared,
            idle,
            shutdown: Arc::new(AtomicBool::new(false)),
            parts_sent: 0,
        }
    }

    /// End the iterator once `shutdown` is raised.
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn parts_sent(&self) -> u64 {
        self.parts_sent
    }

    /// Produce one part, or `None` when the camera is not streaming.
    ///
    /// A failed read is not fatal here: the pipeline owns reconnects, the
    /// streamer just tries again later.
    pub fn next_part(&mut self) -> Result<Option<Vec<u8>>, AttendanceError> {
        let read = self.shared.with_connection(|source| {
            if source.is_streaming() {
                Some(source.read_frame())
            } else {
                None
            }
        })?;
        let frame = match read {
            None => return Ok(None),
            Some(Ok(FrameRead::Frame(frame))) => frame,
            Some(Ok(FrameRead::EndOfStream { reason })) => {
                log::debug!("stream read hit end of stream: {}", reason);
                return Ok(None);
            }
            Some(Err(err)) => return Err(err),
        };

        let snapshot = self.shared.read_snapshot()?;
        let mut frame = frame.into_format(PixelFormat::Rgb24);
        frame
            .annotate(&snapshot.batch)
            .map_err(AttendanceError::DecodeFailure)?;
        let jpeg = frame
            .encode_jpeg(JPEG_QUALITY)
            .map_err(AttendanceError::DecodeFailure)?;
        self.parts_sent += 1;
        Ok(Some(multipart_part(&jpeg)))
    }
}

impl Iterator for FrameStreamer {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return None;
            }
            match self.next_part() {
                Ok(Some(part)) => return Some(part),
                Ok(None) => {}
                Err(err) => log::debug!("stream frame skipped ({}): {}", err.kind(), err),
            }
            std::thread::sleep(self.idle);
        }
    }
}
