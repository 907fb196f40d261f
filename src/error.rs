//! Failure taxonomy for sync operations.
//!
//! Every variant renders to the status string shown to the caller, so the
//! category of a failure can be recovered from the message alone.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::models::OperationKind;

/// Which side of an operation a volume was playing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeRole {
    Source,
    Target,
}

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("{} {} not accessible", role_prefix(.role), .path.display())]
    InaccessibleVolume { role: VolumeRole, path: PathBuf },

    #[error("Cannot scan source: {reason}")]
    ScanFailure { path: PathBuf, reason: String },

    #[error("Error copying {}: {reason}", .path.display())]
    PerFileCopyFailure { path: PathBuf, reason: String },

    #[error("Backup failed for {}: {reason}", .target.display())]
    BackupPrerequisiteFailure { target: PathBuf, reason: String },

    #[error("Another operation is already running ({running})")]
    ConcurrentOperationRejected { running: OperationKind },

    #[error("{0}")]
    InvalidSelection(String),

    #[error("Operation interrupted: {0}")]
    Interrupted(String),
}

fn role_prefix(role: &VolumeRole) -> &'static str {
    match role {
        VolumeRole::Source => "Source device",
        VolumeRole::Target => "Target",
    }
}

impl SyncError {
    pub fn source_inaccessible(path: impl Into<PathBuf>) -> Self {
        Self::InaccessibleVolume {
            role: VolumeRole::Source,
            path: path.into(),
        }
    }

    pub fn target_inaccessible(path: impl Into<PathBuf>) -> Self {
        Self::InaccessibleVolume {
            role: VolumeRole::Target,
            path: path.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inaccessible_messages_name_the_role() {
        let err = SyncError::source_inaccessible("/media/SRC");
        assert_eq!(err.to_string(), "Source device /media/SRC not accessible");

        let err = SyncError::target_inaccessible("/media/DST");
        assert_eq!(err.to_string(), "Target /media/DST not accessible");
    }

    #[test]
    fn rejection_names_running_kind() {
        let err = SyncError::ConcurrentOperationRejected {
            running: OperationKind::Sync,
        };
        assert!(err.to_string().contains("already running (sync)"));
    }

    #[test]
    fn scan_failure_keeps_reason() {
        let err = SyncError::ScanFailure {
            path: PathBuf::from("/media/SRC"),
            reason: "permission denied".into(),
        };
        assert_eq!(err.to_string(), "Cannot scan source: permission denied");
    }
}
