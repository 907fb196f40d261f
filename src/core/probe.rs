use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::hardware::{MountedVolume, VolumeSource};
use crate::core::models::Volume;

/// Decides which mounts count as removable or secondary storage.
#[derive(Debug, Clone)]
pub struct RemovablePolicy {
    /// Mounts under any of these prefixes are accepted when the platform
    /// cannot say whether the device is removable.
    pub include_prefixes: Vec<PathBuf>,
    /// Mounts that are never offered, whatever the platform says.
    pub exclude_mounts: Vec<PathBuf>,
}

impl Default for RemovablePolicy {
    fn default() -> Self {
        Self {
            include_prefixes: ["/media", "/run/media", "/mnt"]
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            exclude_mounts: ["/", "/boot", "/boot/efi", "/home"]
                .into_iter()
                .map(PathBuf::from)
                .collect(),
        }
    }
}

impl RemovablePolicy {
    /// Accept everything except the explicit exclusions.
    pub fn permissive() -> Self {
        Self {
            include_prefixes: vec![PathBuf::from("/")],
            exclude_mounts: Vec::new(),
        }
    }

    pub fn accepts(&self, mount_point: &Path, removable: Option<bool>) -> bool {
        if self.exclude_mounts.iter().any(|m| m == mount_point) {
            return false;
        }

        match removable {
            Some(true) => true,
            _ => self
                .include_prefixes
                .iter()
                .any(|prefix| mount_point.starts_with(prefix)),
        }
    }
}

/// Turns the raw mount table into the list of usable volumes.
///
/// Never fails as a whole: a source error yields an empty list and a volume
/// whose usage cannot be read is left out.
#[derive(Clone)]
pub struct VolumeProbe {
    source: Arc<dyn VolumeSource>,
    policy: RemovablePolicy,
}

impl VolumeProbe {
    pub fn new(source: Arc<dyn VolumeSource>, policy: RemovablePolicy) -> Self {
        Self { source, policy }
    }

    pub fn list_volumes(&self) -> Vec<Volume> {
        let mounts = match self.source.list_mounted_volumes() {
            Ok(mounts) => mounts,
            Err(e) => {
                warn!(error = %e, "Failed to read mount table");
                return Vec::new();
            }
        };

        mounts
            .into_iter()
            .filter(|m| {
                self.policy
                    .accepts(&m.mount_point, self.source.is_removable(m))
            })
            .filter_map(|m| self.measure(m))
            .collect()
    }

    fn measure(&self, mount: MountedVolume) -> Option<Volume> {
        let usage = match self.source.usage(&mount) {
            Ok(usage) => usage,
            Err(e) => {
                debug!(
                    device = %mount.device.display(),
                    error = %e,
                    "Skipping volume with unreadable usage"
                );
                return None;
            }
        };

        if usage.total == 0 {
            return None;
        }

        Some(Volume {
            device: mount.device,
            mount_point: mount.mount_point,
            filesystem: mount.filesystem,
            total_bytes: usage.total,
            used_bytes: usage.used,
            free_bytes: usage.free,
            label: mount.label,
        })
    }
}
