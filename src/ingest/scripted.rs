//! Scripted frame source with programmable faults.
//!
//! Used by tests (and anything else that needs a deterministic camera):
//! the first N opens can be made to fail, and each successful session can
//! be made to end after a number of frames with a chosen fault.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};

use super::{FrameSource, SourceStats};
use crate::error::AttendanceError;
use crate::frame::{Frame, PixelFormat};

/// How a scripted session ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    EndOfStream,
    TransportError,
    DecodeError,
}

/// Counters shared with the test that built the source.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    opens: AtomicU64,
    open_failures: AtomicU64,
    closes: AtomicU64,
    frames: AtomicU64,
}

impl ScriptedProbe {
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn open_failures(&self) -> u64 {
        self.open_failures.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }
}

pub struct ScriptedSource {
    width: u32,
    height: u32,
    read_delay: Duration,
    connect_failures_left: u64,
    sessions: VecDeque<(u64, SessionEnd)>,
    current: Option<Session>,
    probe: Arc<ScriptedProbe>,
}

struct Session {
    frames_left: Option<u64>,
    end: SessionEnd,
}

impl ScriptedSource {
    /// An always-available camera producing 32x24 frames.
    pub fn new() -> Self {
        Self {
            width: 32,
            height: 24,
            read_delay: Duration::ZERO,
            connect_failures_left: 0,
            sessions: VecDeque::new(),
            current: None,
            probe: Arc::new(ScriptedProbe::default()),
        }
    }

    /// Fail the next `count` open attempts.
    pub fn fail_connects(mut self, count: u64) -> Self {
        self.connect_failures_left = count;
        self
    }

    /// Queue a session that yields `frames` frames then ends with `end`.
    /// Sessions beyond the queue are unlimited.
    pub fn session(mut self, frames: u64, end: SessionEnd) -> Self {
        self.sessions.push_back((frames, end));
        self
    }

    /// Block each read for `delay`, like a camera waiting for its next frame.
    pub fn read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    pub fn probe(&self) -> Arc<ScriptedProbe> {
        self.probe.clone()
    }
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for ScriptedSource {
    fn describe(&self) -> String {
        "scripted://camera".to_string()
    }

    fn open(&mut self) -> Result<()> {
        if self.connect_failures_left > 0 {
            self.connect_failures_left -= 1;
            self.probe.open_failures.fetch_add(1, Ordering::SeqCst);
            return Err(anyhow!("scripted camera unreachable"));
        }
        self.probe.opens.fetch_add(1, Ordering::SeqCst);
        self.current = Some(match self.sessions.pop_front() {
            Some((frames, end)) => Session {
                frames_left: Some(frames),
                end,
            },
            None => Session {
                frames_left: None,
                end: SessionEnd::EndOfStream,
            },
        });
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>, AttendanceError> {
        let session = self.current.as_mut().ok_or_else(|| {
            AttendanceError::ConnectionFailure(anyhow!("scripted camera not open"))
        })?;
        if !self.read_delay.is_zero() {
            std::thread::sleep(self.read_delay);
        }
        match session.frames_left {
            Some(0) => {
                return match session.end {
                    SessionEnd::EndOfStream => Ok(None),
                    SessionEnd::TransportError => Err(AttendanceError::ConnectionFailure(
                        anyhow!("scripted transport reset"),
                    )),
                    SessionEnd::DecodeError => Err(AttendanceError::DecodeFailure(anyhow!(
                        "scripted corrupt frame"
                    ))),
                }
            }
            Some(ref mut left) => *left -= 1,
            None => {}
        }
        let shade = (self.probe.frames.fetch_add(1, Ordering::SeqCst) % 256) as u8;
        let pixels = vec![shade; (self.width * self.height * 3) as usize];
        Frame::new(pixels, self.width, self.height, PixelFormat::Rgb24)
            .map(Some)
            .map_err(AttendanceError::DecodeFailure)
    }

    fn close(&mut self) {
        if self.current.take().is_some() {
            self.probe.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.probe.frames(),
            source: self.describe(),
            healthy: self.current.is_some(),
        }
    }
}
