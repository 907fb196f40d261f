use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, bail};

use crate::core::hardware::{MountedVolume, Usage, VolumeSource};

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
struct SimulatedVolume {
    mount: MountedVolume,
    total: u64,
    used: u64,
    usage_error: bool,
}

type SharedVolumes = Arc<Mutex<Vec<SimulatedVolume>>>;

fn lock(volumes: &SharedVolumes) -> MutexGuard<'_, Vec<SimulatedVolume>> {
    // A panicking test thread must not wedge the others.
    volumes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle used to plug, unplug and alter simulated volumes.
#[derive(Clone)]
pub struct Simulator {
    volumes: SharedVolumes,
}

impl Simulator {
    /// Plug in a volume of `size_gb` gibibytes. Replaces any volume already
    /// mounted at the same place.
    pub fn add(&self, device: &str, mount_point: impl AsRef<Path>, size_gb: u64) {
        self.add_bytes(device, mount_point, size_gb * GIB);
    }

    pub fn add_bytes(&self, device: &str, mount_point: impl AsRef<Path>, total: u64) {
        let device = PathBuf::from(device);
        let label = device
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| device.display().to_string());
        let mount_point = mount_point.as_ref().to_path_buf();

        let mut volumes = lock(&self.volumes);
        volumes.retain(|v| v.mount.mount_point != mount_point);
        volumes.push(SimulatedVolume {
            mount: MountedVolume {
                device,
                mount_point,
                filesystem: "vfat".to_string(),
                label,
            },
            total,
            used: 0,
            usage_error: false,
        });
    }

    pub fn remove(&self, mount_point: impl AsRef<Path>) {
        let mount_point = mount_point.as_ref();
        lock(&self.volumes).retain(|v| v.mount.mount_point != mount_point);
    }

    pub fn set_used(&self, mount_point: impl AsRef<Path>, used: u64) {
        let mount_point = mount_point.as_ref();
        for v in lock(&self.volumes).iter_mut() {
            if v.mount.mount_point == mount_point {
                v.used = used.min(v.total);
            }
        }
    }

    /// Make usage queries for a mount fail until cleared.
    pub fn set_usage_error(&self, mount_point: impl AsRef<Path>, failing: bool) {
        let mount_point = mount_point.as_ref();
        for v in lock(&self.volumes).iter_mut() {
            if v.mount.mount_point == mount_point {
                v.usage_error = failing;
            }
        }
    }
}

/// In-memory volume source for `--simulation` and tests.
pub struct SimulatedVolumeSource {
    volumes: SharedVolumes,
}

impl SimulatedVolumeSource {
    pub fn new() -> (Self, Simulator) {
        let volumes: SharedVolumes = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                volumes: volumes.clone(),
            },
            Simulator { volumes },
        )
    }
}

impl VolumeSource for SimulatedVolumeSource {
    fn list_mounted_volumes(&self) -> Result<Vec<MountedVolume>> {
        Ok(lock(&self.volumes).iter().map(|v| v.mount.clone()).collect())
    }

    fn usage(&self, volume: &MountedVolume) -> Result<Usage> {
        let volumes = lock(&self.volumes);
        let Some(v) = volumes
            .iter()
            .find(|v| v.mount.mount_point == volume.mount_point)
        else {
            bail!("{} is no longer mounted", volume.mount_point.display());
        };

        if v.usage_error {
            bail!("I/O error reading {}", volume.mount_point.display());
        }

        Ok(Usage {
            total: v.total,
            used: v.used,
            free: v.total - v.used,
        })
    }

    fn is_removable(&self, _volume: &MountedVolume) -> Option<bool> {
        Some(true)
    }
}
