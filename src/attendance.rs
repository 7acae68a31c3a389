//! Save action: persist the current best face as an attendance record.
//!
//! Triggered externally, never by the pipeline. Each call writes a new
//! record; nothing is deduplicated.

use chrono::Utc;

use crate::error::AttendanceError;
use crate::policy::ApprovalPolicy;
use crate::state::SharedDetectionState;
use crate::storage::{AttendanceRecord, AttendanceRecorder, NewAttendance};

pub fn save_attendance(
    state: &SharedDetectionState,
    recorder: &mut dyn AttendanceRecorder,
    policy: &ApprovalPolicy,
) -> Result<AttendanceRecord, AttendanceError> {
    let snapshot = state.read_snapshot()?;
    let best = snapshot
        .batch
        .best()
        .ok_or(AttendanceError::NoDetectionAvailable)?;

    let entry = NewAttendance::generated(best.confidence, policy.approval(best.confidence), Utc::now());
    let record = recorder.record(&entry).map_err(AttendanceError::Storage)?;
    log::info!(
        "attendance recorded: id={} subject={} confidence={:.3} status={}",
        record.id,
        record.subject_id,
        record.confidence,
        record.status
    );
    Ok(record)
}
