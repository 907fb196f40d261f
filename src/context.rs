use std::sync::Arc;

use anyhow::Result;

use crate::config::AppConfig;
use crate::core::hardware::VolumeSource;
use crate::core::ledger::BackupLedger;
use crate::core::models::Volume;
use crate::core::probe::VolumeProbe;
use crate::core::{OperationCoordinator, OperationRequest, VolumeRegistry};
use crate::error::SyncError;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub registry: Arc<VolumeRegistry>,
    pub coordinator: OperationCoordinator,
}

impl AppContext {
    pub async fn new(config: AppConfig, source: Arc<dyn VolumeSource>) -> Result<Self> {
        let ledger = BackupLedger::open(config.ledger_path.as_deref())
            .await?
            .with_limit(config.history_limit)
            .await;

        let probe = VolumeProbe::new(source, config.removable_policy());
        let registry = VolumeRegistry::new(probe, config.registry_config());
        let coordinator =
            OperationCoordinator::new(ledger, config.sync_files, config.status_reset());

        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            coordinator,
        })
    }

    /// Probe now, off the async runtime.
    pub async fn volumes(&self) -> Result<Vec<Volume>, SyncError> {
        let probe = self.registry.probe().clone();
        tokio::task::spawn_blocking(move || probe.list_volumes())
            .await
            .map_err(|e| SyncError::Interrupted(e.to_string()))
    }

    /// Resolve a selection against a fresh probe.
    pub async fn request(
        &self,
        source_label: Option<&str>,
        target_labels: &[String],
    ) -> Result<OperationRequest, SyncError> {
        let volumes = self.volumes().await?;
        OperationRequest::from_labels(&volumes, source_label, target_labels)
    }
}
