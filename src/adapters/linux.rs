use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use nix::sys::statvfs::statvfs;
use tracing::debug;

use crate::core::hardware::{MountedVolume, Usage, VolumeSource};

const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// Filesystems that never back a physical volume.
const PSEUDO_FS_TYPES: &[&str] = &[
    "autofs",
    "binfmt_misc",
    "bpf",
    "cgroup",
    "cgroup2",
    "configfs",
    "debugfs",
    "devpts",
    "devtmpfs",
    "efivarfs",
    "fusectl",
    "hugetlbfs",
    "mqueue",
    "nsfs",
    "overlay",
    "proc",
    "pstore",
    "ramfs",
    "rpc_pipefs",
    "securityfs",
    "selinuxfs",
    "squashfs",
    "sysfs",
    "tmpfs",
    "tracefs",
    "cifs",
    "smb3",
    "smbfs",
    "9p",
    "ceph",
    "glusterfs",
    "sshfs",
];

/// Volume source backed by the kernel mount table, statvfs and udev.
#[derive(Default)]
pub struct LinuxVolumeSource;

impl VolumeSource for LinuxVolumeSource {
    fn list_mounted_volumes(&self) -> Result<Vec<MountedVolume>> {
        let content = fs::read_to_string(MOUNTINFO_PATH)
            .with_context(|| format!("Failed to read {}", MOUNTINFO_PATH))?;
        parse_mountinfo(&content)
    }

    fn usage(&self, volume: &MountedVolume) -> Result<Usage> {
        let stats = statvfs(volume.mount_point.as_path()).map_err(|e| {
            anyhow!(
                "statvfs failed for {}: {}",
                volume.mount_point.display(),
                e
            )
        })?;

        let fragment = stats.fragment_size() as u64;
        let total = stats.blocks() as u64 * fragment;
        let free = stats.blocks_available() as u64 * fragment;
        let used = (stats.blocks() as u64).saturating_sub(stats.blocks_free() as u64) * fragment;

        Ok(Usage { total, used, free })
    }

    fn is_removable(&self, volume: &MountedVolume) -> Option<bool> {
        let sysname = volume.device.strip_prefix("/dev").ok()?.to_str()?;
        match udev_removable(sysname) {
            Ok(removable) => Some(removable),
            Err(e) => {
                debug!(device = %volume.device.display(), error = %e, "udev lookup failed");
                None
            }
        }
    }
}

/// Ask udev whether the disk behind a block device is removable or hangs off USB.
fn udev_removable(sysname: &str) -> std::io::Result<bool> {
    let device = udev::Device::from_subsystem_sysname("block".to_string(), sysname.to_string())?;

    if device.parent_with_subsystem("usb")?.is_some() {
        return Ok(true);
    }

    let disk = if device.devtype() == Some(OsStr::new("disk")) {
        Some(device)
    } else {
        device.parent_with_subsystem_devtype("block", "disk")?
    };

    Ok(disk
        .as_ref()
        .and_then(|d| d.attribute_value("removable"))
        .is_some_and(|v| v == OsStr::new("1")))
}

/// Parse `/proc/self/mountinfo`, keeping block-device backed mounts only.
pub fn parse_mountinfo(input: &str) -> Result<Vec<MountedVolume>> {
    let mut volumes = Vec::new();

    for line in input.lines().filter(|line| !line.trim().is_empty()) {
        let (left, right) = line
            .split_once(" - ")
            .ok_or_else(|| anyhow!("invalid mountinfo line: {}", line))?;

        let mount_point = left
            .split_whitespace()
            .nth(4)
            .ok_or_else(|| anyhow!("invalid mountinfo line: {}", line))?;

        let mut right_fields = right.split_whitespace();
        let (Some(fs_type), Some(device)) = (right_fields.next(), right_fields.next()) else {
            return Err(anyhow!("invalid mountinfo line: {}", line));
        };

        if is_pseudo_fs(fs_type) || !device.starts_with("/dev/") {
            continue;
        }

        let device = PathBuf::from(unescape_mount_field(device));
        let mount_point = PathBuf::from(unescape_mount_field(mount_point));

        // Bind mounts repeat the same device; the first entry wins.
        if volumes
            .iter()
            .any(|v: &MountedVolume| v.device == device || v.mount_point == mount_point)
        {
            continue;
        }

        volumes.push(MountedVolume {
            label: device_label(&device),
            device,
            mount_point,
            filesystem: fs_type.to_string(),
        });
    }

    Ok(volumes)
}

fn is_pseudo_fs(fs_type: &str) -> bool {
    PSEUDO_FS_TYPES.contains(&fs_type) || fs_type.starts_with("fuse.") || fs_type.starts_with("nfs")
}

/// Human-readable label: the last component of the device path.
fn device_label(device: &Path) -> String {
    device
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| device.display().to_string())
}

/// Undo the octal escaping the kernel applies to spaces, tabs and backslashes.
fn unescape_mount_field(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'\\' && index + 4 <= bytes.len() {
            let digits = &bytes[index + 1..index + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let byte = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(byte) {
                    output.push(byte);
                    index += 4;
                    continue;
                }
            }
        }

        output.push(bytes[index]);
        index += 1;
    }

    String::from_utf8_lossy(&output).into_owned()
}
