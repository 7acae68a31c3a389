//! Attendance decision policy.
//!
//! The best-confidence face of a batch decides the status:
//! no face -> `NoFaceDetected`, best >= threshold -> `Approved`,
//! otherwise `Pending`.

use std::fmt;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::detect::DetectionBatch;

pub const DEFAULT_APPROVAL_THRESHOLD: f32 = 0.7;

/// Approval recorded with a persisted attendance entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalStatus {
    Approved,
    Pending,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Approved => "Approved",
            ApprovalStatus::Pending => "Pending",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "Approved" => Ok(ApprovalStatus::Approved),
            "Pending" => Ok(ApprovalStatus::Pending),
            other => Err(anyhow!("unknown approval status '{}'", other)),
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceState {
    Waiting,
    NoFaceDetected,
    Pending,
    Approved,
}

impl From<ApprovalStatus> for AttendanceState {
    fn from(approval: ApprovalStatus) -> Self {
        match approval {
            ApprovalStatus::Approved => AttendanceState::Approved,
            ApprovalStatus::Pending => AttendanceState::Pending,
        }
    }
}

/// Derived attendance status plus the wall-clock time it was computed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AttendanceStatus {
    state: AttendanceState,
    updated_at: DateTime<Local>,
}

impl AttendanceStatus {
    /// Initial status before the first published batch.
    pub fn waiting() -> Self {
        Self {
            state: AttendanceState::Waiting,
            updated_at: Local::now(),
        }
    }

    pub fn new(state: AttendanceState, updated_at: DateTime<Local>) -> Self {
        Self { state, updated_at }
    }

    pub fn state(&self) -> AttendanceState {
        self.state
    }

    pub fn updated_at(&self) -> DateTime<Local> {
        self.updated_at
    }

    /// Human-readable status, e.g. `Approved (14:03:22.517)`.
    pub fn message(&self) -> String {
        let at = self.updated_at.format("%H:%M:%S%.3f");
        match self.state {
            AttendanceState::Waiting => "Waiting for detection...".to_string(),
            AttendanceState::NoFaceDetected => format!("No face detected ({})", at),
            AttendanceState::Pending => format!("Pending ({})", at),
            AttendanceState::Approved => format!("Approved ({})", at),
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ApprovalPolicy {
    threshold: f32,
}

impl ApprovalPolicy {
    pub fn new(threshold: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "approval threshold must be within [0, 1], got {}",
                threshold
            ));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn approval(&self, confidence: f32) -> ApprovalStatus {
        if confidence >= self.threshold {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Pending
        }
    }

    /// Status for a freshly detected batch.
    pub fn decide(&self, batch: &DetectionBatch, now: DateTime<Local>) -> AttendanceStatus {
        let state = match batch.best() {
            None => AttendanceState::NoFaceDetected,
            Some(best) => self.approval(best.confidence).into(),
        };
        AttendanceStatus::new(state, now)
    }
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_APPROVAL_THRESHOLD,
        }
    }
}
