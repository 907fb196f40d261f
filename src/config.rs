use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::probe::RemovablePolicy;
use crate::core::registry::RegistryConfig;

const SYSTEM_CONFIG: &str = "/etc/usbsync/config.toml";
const LOCAL_CONFIG: &str = "usbsync.toml";
const ENV_PREFIX: &str = "USBSYNC_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// How often the volume monitor wakes, in milliseconds.
    pub poll_tick_ms: u64,
    /// Minimum seconds between two volume probes.
    pub poll_interval_secs: u64,
    pub stop_timeout_ms: u64,
    /// Seconds a finished operation's result stays up before going idle.
    pub status_reset_secs: u64,
    /// fsync every copied file before moving on.
    pub sync_files: bool,
    /// SQLite file holding backup history. History is kept in memory only
    /// when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<usize>,
    pub include_mount_prefixes: Vec<PathBuf>,
    pub exclude_mounts: Vec<PathBuf>,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        let policy = RemovablePolicy::default();
        Self {
            poll_tick_ms: 100,
            poll_interval_secs: 10,
            stop_timeout_ms: 1000,
            status_reset_secs: 5,
            sync_files: true,
            ledger_path: None,
            history_limit: None,
            include_mount_prefixes: policy.include_prefixes,
            exclude_mounts: policy.exclude_mounts,
            simulation: false,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Layer defaults, config files, `USBSYNC_*` variables and finally any
    /// command-line overrides.
    pub fn new<T: Serialize>(overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG))
            .merge(Toml::file(LOCAL_CONFIG))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment.extract().context("Failed to load configuration")
    }

    pub fn removable_policy(&self) -> RemovablePolicy {
        RemovablePolicy {
            include_prefixes: self.include_mount_prefixes.clone(),
            exclude_mounts: self.exclude_mounts.clone(),
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            tick: Duration::from_millis(self.poll_tick_ms.max(1)),
            check_interval: Duration::from_secs(self.poll_interval_secs),
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
        }
    }

    pub fn status_reset(&self) -> Duration {
        Duration::from_secs(self.status_reset_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[derive(Serialize)]
    struct Overrides {
        verbose: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        ledger_path: Option<PathBuf>,
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.poll_interval_secs, 10);
        assert_eq!(config.status_reset(), Duration::from_secs(5));
        assert!(config.sync_files);
        assert!(config.exclude_mounts.contains(&PathBuf::from("/")));
    }

    #[test]
    fn layers_file_env_and_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(
                LOCAL_CONFIG,
                r#"
                    poll_interval_secs = 3
                    status_reset_secs = 9
                "#,
            )?;
            jail.set_env("USBSYNC_STATUS_RESET_SECS", "2");

            let config = AppConfig::new(Some(&Overrides {
                verbose: true,
                ledger_path: Some(PathBuf::from("/tmp/ledger.db")),
            }))
            .expect("config loads");

            assert_eq!(config.poll_interval_secs, 3);
            assert_eq!(config.status_reset_secs, 2);
            assert!(config.verbose);
            assert_eq!(config.ledger_path, Some(PathBuf::from("/tmp/ledger.db")));
            assert_eq!(config.poll_tick_ms, 100);
            Ok(())
        });
    }
}
