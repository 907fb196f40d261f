use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// A mounted storage volume as seen by one probe.
///
/// Field order matters: snapshot equality compares volumes in the order
/// (device, mount point, filesystem, total, used, free, label).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub device: PathBuf,
    pub mount_point: PathBuf,
    pub filesystem: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub label: String,
}

/// A volume selected as a destination, captured by value at request time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetVolume {
    pub label: String,
    pub root: PathBuf,
}

impl TargetVolume {
    pub fn new(label: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            root: root.into(),
        }
    }
}

impl From<&Volume> for TargetVolume {
    fn from(volume: &Volume) -> Self {
        Self::new(volume.label.clone(), volume.mount_point.clone())
    }
}

/// One timestamped snapshot held by the backup ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub source: PathBuf,
    pub backup_dir: PathBuf,
    pub created_at: DateTime<Local>,
    pub files: Vec<PathBuf>,
}

impl BackupRecord {
    /// Number of files captured. Always equal to `files.len()`.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

/// Result of syncing one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub target: String,
    pub backup: BackupRecord,
}

/// Which progress display an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressChannel {
    Transfer,
    Backup,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    /// Percentage complete, in `[0, 100]`.
    pub percent: f64,
    pub message: String,
    /// Estimated seconds remaining, 0 when unknown.
    pub eta_secs: f64,
    pub channel: ProgressChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Transfer,
    Backup,
    Sync,
}

impl OperationKind {
    pub const ALL: [OperationKind; 3] = [Self::Transfer, Self::Backup, Self::Sync];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transfer => "transfer",
            Self::Backup => "backup",
            Self::Sync => "sync",
        }
    }

    /// Sync reports on the transfer display; backup has its own.
    pub fn progress_channel(&self) -> ProgressChannel {
        match self {
            Self::Backup => ProgressChannel::Backup,
            Self::Transfer | Self::Sync => ProgressChannel::Transfer,
        }
    }

    /// Status shown once a finished operation has been reset to idle.
    pub fn idle_message(&self) -> &'static str {
        match self {
            Self::Transfer => "Ready for next transfer",
            Self::Backup => "Backup progress: not started",
            Self::Sync => "Ready for next operation",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    Running,
    Completed,
    Failed(String),
}

impl OperationState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(label: &str, used: u64) -> Volume {
        Volume {
            device: PathBuf::from(format!("/dev/{}", label)),
            mount_point: PathBuf::from(format!("/media/{}", label)),
            filesystem: "vfat".to_string(),
            total_bytes: 1000,
            used_bytes: used,
            free_bytes: 1000 - used,
            label: label.to_string(),
        }
    }

    #[test]
    fn snapshots_compare_structurally() {
        let a = vec![volume("sdb1", 100), volume("sdc1", 200)];
        let b = vec![volume("sdb1", 100), volume("sdc1", 200)];
        assert_eq!(a, b);

        let c = vec![volume("sdb1", 101), volume("sdc1", 200)];
        assert_ne!(a, c);

        let reordered = vec![volume("sdc1", 200), volume("sdb1", 100)];
        assert_ne!(a, reordered);
    }

    #[test]
    fn sync_reports_on_transfer_channel() {
        assert_eq!(
            OperationKind::Sync.progress_channel(),
            ProgressChannel::Transfer
        );
        assert_eq!(
            OperationKind::Backup.progress_channel(),
            ProgressChannel::Backup
        );
    }
}
