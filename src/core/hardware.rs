use std::path::PathBuf;

/// A mount table entry, before capacity has been queried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedVolume {
    pub device: PathBuf,
    pub mount_point: PathBuf,
    pub filesystem: String,
    pub label: String,
}

/// Capacity figures for a mounted filesystem, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

pub trait VolumeSource: Send + Sync {
    /// List every mounted volume the platform reports.
    fn list_mounted_volumes(&self) -> anyhow::Result<Vec<MountedVolume>>;

    /// Query capacity for a single mount.
    /// NOTE: This may block on slow or failing media and should be called
    /// from a blocking context.
    fn usage(&self, volume: &MountedVolume) -> anyhow::Result<Usage>;

    /// Whether the platform flags the backing device as removable.
    /// `None` when the platform cannot tell.
    fn is_removable(&self, _volume: &MountedVolume) -> Option<bool> {
        None
    }
}
