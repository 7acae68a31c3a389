use std::path::PathBuf;

use thiserror::Error;

/// Failure kinds that drive pipeline recovery or reach an external caller.
///
/// Pipeline-internal kinds (`ConnectionFailure`, `DecodeFailure`,
/// `DetectorFailure`) are contained by the detection loop and only logged.
/// `NoDetectionAvailable` is returned from the save action, and
/// `ModelAssetMissing` aborts startup.
#[derive(Debug, Error)]
pub enum AttendanceError {
    #[error("camera connection failed: {0:#}")]
    ConnectionFailure(anyhow::Error),
    #[error("frame decode failed: {0:#}")]
    DecodeFailure(anyhow::Error),
    #[error("face detector failed: {0:#}")]
    DetectorFailure(anyhow::Error),
    #[error("no face detected")]
    NoDetectionAvailable,
    #[error("detector model asset missing at {}", .0.display())]
    ModelAssetMissing(PathBuf),
    #[error("attendance store failed: {0:#}")]
    Storage(anyhow::Error),
    #[error("shared detection state lock poisoned")]
    LockPoisoned,
}

impl AttendanceError {
    /// Short label used in log lines and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            AttendanceError::ConnectionFailure(_) => "connection",
            AttendanceError::DecodeFailure(_) => "decode",
            AttendanceError::DetectorFailure(_) => "detector",
            AttendanceError::NoDetectionAvailable => "no_detection",
            AttendanceError::ModelAssetMissing(_) => "model_asset_missing",
            AttendanceError::Storage(_) => "storage",
            AttendanceError::LockPoisoned => "lock_poisoned",
        }
    }

    /// True for failures the detection loop recovers from by reconnecting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AttendanceError::ConnectionFailure(_)
                | AttendanceError::DecodeFailure(_)
                | AttendanceError::DetectorFailure(_)
        )
    }
}
