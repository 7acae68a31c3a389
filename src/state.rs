//! Shared detection state.
//!
//! One mutex guards the latest `DetectionBatch`, the `AttendanceStatus`
//! derived from it, and the `VideoSource` handle. Camera reads, reconnects
//! and publishes all go through this lock, so a frame read never interleaves
//! with a reconnect and a reader never sees a batch paired with another
//! cycle's status.
//!
//! Raw fields are never exposed: readers get an owned `Snapshot`, the camera
//! is only reachable inside `with_connection`.

use std::sync::{Mutex, MutexGuard};

use crate::detect::DetectionBatch;
use crate::error::AttendanceError;
use crate::ingest::{ConnectionState, VideoSource};
use crate::policy::AttendanceStatus;

/// Independent copy of the published state.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub batch: DetectionBatch,
    pub status: AttendanceStatus,
    /// Number of publishes so far; 0 before the first one.
    pub sequence: u64,
}

struct Inner {
    batch: DetectionBatch,
    status: AttendanceStatus,
    sequence: u64,
    source: VideoSource,
}

pub struct SharedDetectionState {
    inner: Mutex<Inner>,
}

impl SharedDetectionState {
    pub fn new(source: VideoSource) -> Self {
        Self {
            inner: Mutex::new(Inner {
                batch: DetectionBatch::empty(),
                status: AttendanceStatus::waiting(),
                sequence: 0,
                source,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, AttendanceError> {
        self.inner.lock().map_err(|_| AttendanceError::LockPoisoned)
    }

    /// Copy out the current batch and status as one consistent pair.
    pub fn read_snapshot(&self) -> Result<Snapshot, AttendanceError> {
        let inner = self.lock()?;
        Ok(Snapshot {
            batch: inner.batch.clone(),
            status: inner.status,
            sequence: inner.sequence,
        })
    }

    /// Replace batch and status together. Only the detection pipeline writes.
    ///
    /// Returns the new sequence number.
    pub fn publish(
        &self,
        batch: DetectionBatch,
        status: AttendanceStatus,
    ) -> Result<u64, AttendanceError> {
        let mut inner = self.lock()?;
        inner.batch = batch;
        inner.status = status;
        inner.sequence += 1;
        Ok(inner.sequence)
    }

    /// Run `f` with exclusive access to the camera.
    ///
    /// The lock is held for the whole call, including any blocking I/O
    /// inside `f`. Keep inference and encoding out of `f`.
    pub fn with_connection<R>(
        &self,
        f: impl FnOnce(&mut VideoSource) -> R,
    ) -> Result<R, AttendanceError> {
        let mut inner = self.lock()?;
        Ok(f(&mut inner.source))
    }

    pub fn connection_state(&self) -> Result<ConnectionState, AttendanceError> {
        Ok(self.lock()?.source.state())
    }
}
