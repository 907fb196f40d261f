use std::sync::Arc;

use tracing::info;

use crate::core::hardware::VolumeSource;

#[cfg(target_os = "linux")]
mod linux;
mod simulated;

#[cfg(target_os = "linux")]
pub use linux::{LinuxVolumeSource, parse_mountinfo};
pub use simulated::{SimulatedVolumeSource, Simulator};

pub fn get_source(simulation: bool) -> Arc<dyn VolumeSource> {
    if simulation {
        let (source, controller) = SimulatedVolumeSource::new();

        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lines().map_while(Result::ok) {
                let parts: Vec<&str> = line.split_whitespace().collect();
                match parts.as_slice() {
                    ["add", device, mount] => controller.add(device, mount, 16),
                    ["add", device, mount, size] => {
                        controller.add(device, mount, size.parse().unwrap_or(16))
                    }
                    ["rm", mount] => controller.remove(mount),
                    _ => println!("(Simulator) Use: 'add <device> <mount> [size_gb]' or 'rm <mount>'"),
                }
            }
        });

        info!("Using simulated volume source");
        return Arc::new(source);
    }

    #[cfg(target_os = "linux")]
    {
        Arc::new(LinuxVolumeSource)
    }

    #[cfg(not(target_os = "linux"))]
    {
        tracing::warn!("No native volume source for this platform, falling back to simulation");
        Arc::new(SimulatedVolumeSource::new().0)
    }
}
