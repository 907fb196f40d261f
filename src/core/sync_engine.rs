use std::path::Path;
use std::sync::Arc;

use tracing::{Instrument, info, info_span, warn};

use crate::core::backup_engine::BackupEngine;
use crate::core::copy_engine::{self, CopyOptions, FileOutcome};
use crate::core::models::{ProgressChannel, SyncOutcome, TargetVolume};
use crate::core::progress::{ProgressSink, SharedMeter};
use crate::error::SyncError;

/// Incremental mirror that snapshots each target's existing copy first.
#[derive(Clone)]
pub struct SyncEngine {
    backup: BackupEngine,
    options: CopyOptions,
}

impl SyncEngine {
    pub fn new(backup: BackupEngine, sync_files: bool) -> Self {
        Self {
            backup,
            options: CopyOptions::if_stale(sync_files),
        }
    }

    /// Sync `source` into `<target>/<source name>` on every target.
    ///
    /// Progress counts files actually copied against the source file count,
    /// and is capped at 100 when several targets push it past that.
    pub async fn run(
        &self,
        source: &Path,
        targets: &[TargetVolume],
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Vec<SyncOutcome>, SyncError> {
        let span = info_span!("sync", source = %source.display(), targets = targets.len());

        async {
            let scan = match copy_engine::scan_source(source).await {
                Ok(scan) => Arc::new(scan),
                Err(e) => {
                    SharedMeter::new(sink, ProgressChannel::Transfer, 0).status(e.to_string());
                    return Err(e);
                }
            };

            let total_files = scan.file_count();
            let meter = SharedMeter::new(sink, ProgressChannel::Transfer, total_files);

            if total_files == 0 {
                info!("Nothing to synchronize");
                meter.finish("No files to synchronize");
                return Ok(Vec::new());
            }

            let mut outcomes = Vec::new();

            for target in targets {
                if !target.root.is_dir() {
                    let err = SyncError::target_inaccessible(&target.root);
                    warn!(target = %target.label, "{}", err);
                    meter.status(err.to_string());
                    continue;
                }

                let mirror = copy_engine::mirror_dir(&target.root, source);

                meter.status(format!("Backing up {} before sync...", target.label));
                let record = match self.backup.snapshot(&mirror, &target.root).await {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(target = %target.label, error = %e, "Skipping sync without backup");
                        meter.status(e.to_string());
                        continue;
                    }
                };

                info!(
                    target = %target.label,
                    backup_dir = %record.backup_dir.display(),
                    files = record.file_count(),
                    "Pre-sync snapshot taken"
                );

                let per_file = meter.clone();
                let label = target.label.clone();
                let mut copied = 0u64;

                let result = copy_engine::copy_tree(
                    source,
                    &mirror,
                    scan.clone(),
                    self.options,
                    move |_, outcome| match outcome {
                        FileOutcome::Copied { .. } => {
                            copied += 1;
                            per_file.advance(1, format!("Syncing to {}: {} files", label, copied));
                        }
                        FileOutcome::UpToDate => {
                            per_file.status(format!("Syncing to {}: {} files", label, copied))
                        }
                        FileOutcome::Failed(e) => per_file.status(e.to_string()),
                    },
                )
                .await;

                match result {
                    Ok(stats) => {
                        info!(
                            target = %target.label,
                            copied = stats.copied,
                            up_to_date = stats.up_to_date,
                            failed = stats.failed,
                            "Sync to target complete"
                        );
                        outcomes.push(SyncOutcome {
                            target: target.label.clone(),
                            backup: record,
                        });
                    }
                    Err(e) => {
                        warn!(target = %target.label, error = %e, "Sync to target aborted");
                        meter.status(e.to_string());
                    }
                }
            }

            if outcomes.is_empty() {
                meter.status("Sync failed - check device accessibility");
            } else {
                let labels: Vec<&str> = outcomes.iter().map(|o| o.target.as_str()).collect();
                meter.finish(format!(
                    "Sync with backup completed to: {}",
                    labels.join(", ")
                ));
            }

            Ok(outcomes)
        }
        .instrument(span)
        .await
    }
}
