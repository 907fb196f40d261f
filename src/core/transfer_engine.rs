use std::path::Path;
use std::sync::Arc;

use tracing::{Instrument, info, info_span, warn};

use crate::core::copy_engine::{self, CopyOptions, FileOutcome};
use crate::core::models::{ProgressChannel, TargetVolume};
use crate::core::progress::{ProgressSink, SharedMeter};
use crate::error::SyncError;

/// Full copy of a source tree into `<target>/<source name>` on every target.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    options: CopyOptions,
}

impl TransferEngine {
    pub fn new(sync_files: bool) -> Self {
        Self {
            options: CopyOptions::always(sync_files),
        }
    }

    /// Returns the labels of the targets that received the tree.
    ///
    /// Progress is measured over `files * targets`, so each target covers an
    /// equal slice of the bar.
    pub async fn run(
        &self,
        source: &Path,
        targets: &[TargetVolume],
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Vec<String>, SyncError> {
        let span = info_span!("transfer", source = %source.display(), targets = targets.len());

        async {
            let scan = match copy_engine::scan_source(source).await {
                Ok(scan) => Arc::new(scan),
                Err(e) => {
                    SharedMeter::new(sink, ProgressChannel::Transfer, 0).status(e.to_string());
                    return Err(e);
                }
            };

            let total_files = scan.file_count();
            let meter = SharedMeter::new(
                sink,
                ProgressChannel::Transfer,
                total_files * targets.len() as u64,
            );

            if total_files == 0 {
                info!("Nothing to transfer");
                meter.finish("No files to transfer");
                return Ok(Vec::new());
            }

            info!(total_files, total_bytes = scan.total_bytes, "Starting transfer");
            let mut succeeded = Vec::new();

            for target in targets {
                if !target.root.is_dir() {
                    let err = SyncError::target_inaccessible(&target.root);
                    warn!(target = %target.label, "{}", err);
                    meter.status(err.to_string());
                    continue;
                }

                let destination = copy_engine::mirror_dir(&target.root, source);
                let message = format!("Copying to {}...", target.label);
                let per_file = meter.clone();

                let result = copy_engine::copy_tree(
                    source,
                    &destination,
                    scan.clone(),
                    self.options,
                    move |_, outcome| match outcome {
                        FileOutcome::Failed(e) => per_file.advance(1, e.to_string()),
                        _ => per_file.advance(1, message.clone()),
                    },
                )
                .await;

                match result {
                    Ok(stats) => {
                        info!(
                            target = %target.label,
                            destination = %destination.display(),
                            copied = stats.copied,
                            failed = stats.failed,
                            "Transfer to target complete"
                        );
                        succeeded.push(target.label.clone());
                    }
                    Err(e) => {
                        warn!(target = %target.label, error = %e, "Transfer to target aborted");
                        meter.status(e.to_string());
                    }
                }
            }

            if succeeded.is_empty() {
                meter.status("Transfer failed - check device accessibility");
            } else {
                meter.finish(format!("Transfer completed to: {}", succeeded.join(", ")));
            }

            Ok(succeeded)
        }
        .instrument(span)
        .await
    }
}
