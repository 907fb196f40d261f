use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::core::copy_engine::{self, CopyOptions, CopyStats, FileInfo, FileOutcome, ScanResult};
use crate::core::ledger::BackupLedger;
use crate::core::models::{BackupRecord, ProgressChannel, TargetVolume};
use crate::core::progress::{ProgressSink, SharedMeter};
use crate::error::SyncError;

const BACKUP_DIR_PREFIX: &str = "backup_";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Upper bound on same-second suffixes tried before giving up.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Timestamped snapshot copies, recorded in the ledger.
#[derive(Clone)]
pub struct BackupEngine {
    options: CopyOptions,
    ledger: BackupLedger,
}

impl BackupEngine {
    pub fn new(ledger: BackupLedger, sync_files: bool) -> Self {
        Self {
            options: CopyOptions::always(sync_files),
            ledger,
        }
    }

    pub fn ledger(&self) -> &BackupLedger {
        &self.ledger
    }

    /// Snapshot `source` onto every target. Returns one record per target
    /// that completed.
    pub async fn run(
        &self,
        source: &Path,
        targets: &[TargetVolume],
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Vec<BackupRecord>, SyncError> {
        let span = info_span!("backup", source = %source.display(), targets = targets.len());

        async {
            let scan = match copy_engine::scan_source(source).await {
                Ok(scan) => Arc::new(scan),
                Err(e) => {
                    SharedMeter::new(sink, ProgressChannel::Backup, 0).status(e.to_string());
                    return Err(e);
                }
            };

            let total_files = scan.file_count();
            let meter = SharedMeter::new(
                sink,
                ProgressChannel::Backup,
                total_files * targets.len() as u64,
            );

            if total_files == 0 {
                info!("No files found for backup");
                meter.finish("Backup complete: 0 files");
                return Ok(Vec::new());
            }

            meter.status("Backup in progress...");
            let created_at = Local::now();
            let mut records = Vec::new();

            for target in targets {
                if !target.root.is_dir() {
                    let err = SyncError::target_inaccessible(&target.root);
                    warn!(target = %target.label, "{}", err);
                    meter.status(err.to_string());
                    continue;
                }

                let per_file = meter.clone();
                let label = target.label.clone();
                let mut done = 0u64;
                let on_file = move |_: &FileInfo, _: &FileOutcome| {
                    done += 1;
                    per_file.advance(
                        1,
                        format!("Backup to {}: {}/{} files", label, done, total_files),
                    );
                };

                match self
                    .capture(source, scan.clone(), &target.root, created_at, on_file)
                    .await
                {
                    Ok(record) => {
                        info!(
                            target = %target.label,
                            backup_dir = %record.backup_dir.display(),
                            files = record.file_count(),
                            "Backup to target completed"
                        );
                        meter.status(format!("Backup to {} completed", target.label));
                        records.push(record);
                    }
                    Err(e) => {
                        warn!(target = %target.label, error = %e, "Backup to target failed");
                        meter.status(e.to_string());
                    }
                }
            }

            if records.is_empty() {
                meter.status("Backup failed: no target could be written");
            } else {
                meter.finish("Backup completed successfully");
            }

            Ok(records)
        }
        .instrument(span)
        .await
    }

    /// Snapshot whatever currently sits at `region` into a fresh backup
    /// directory under `target_root`. A missing region yields an empty
    /// snapshot, not an error.
    ///
    /// Unlike `run`, a snapshot is all or nothing: if any file of the region
    /// cannot be read or copied, nothing is recorded and the call fails.
    pub async fn snapshot(
        &self,
        region: &Path,
        target_root: &Path,
    ) -> Result<BackupRecord, SyncError> {
        let scan = if region.exists() {
            copy_engine::scan_directory(region)
                .await
                .map_err(|e| prerequisite(target_root, e.to_string()))?
        } else {
            debug!(region = %region.display(), "Nothing to snapshot yet");
            ScanResult::default()
        };

        self.snapshot_scanned(region, Arc::new(scan), target_root)
            .await
    }

    async fn snapshot_scanned(
        &self,
        region: &Path,
        scan: Arc<ScanResult>,
        target_root: &Path,
    ) -> Result<BackupRecord, SyncError> {
        if let Some(path) = scan.unreadable.first() {
            return Err(prerequisite(
                target_root,
                format!("cannot read {}", path.display()),
            ));
        }

        let created_at = Local::now();
        let (backup_dir, stats) = self
            .copy_into_new_dir(region, scan, target_root, &created_at, |_, _| {})
            .await
            .map_err(|e| match e {
                SyncError::BackupPrerequisiteFailure { .. } => e,
                other => prerequisite(target_root, other.to_string()),
            })?;

        if stats.failed > 0 {
            warn!(
                backup_dir = %backup_dir.display(),
                failed = stats.failed,
                "Incomplete snapshot discarded from history"
            );
            return Err(prerequisite(
                target_root,
                format!(
                    "{} of {} files could not be copied",
                    stats.failed,
                    stats.processed()
                ),
            ));
        }

        Ok(self
            .record(region, backup_dir, created_at, stats.files)
            .await)
    }

    /// Copy a scanned tree into a new `backup_<timestamp>` directory and
    /// record it. The record only lists files that made it into the backup.
    async fn capture<F>(
        &self,
        source: &Path,
        scan: Arc<ScanResult>,
        target_root: &Path,
        created_at: DateTime<Local>,
        on_file: F,
    ) -> Result<BackupRecord, SyncError>
    where
        F: FnMut(&FileInfo, &FileOutcome) + Send + 'static,
    {
        let (backup_dir, stats) = self
            .copy_into_new_dir(source, scan, target_root, &created_at, on_file)
            .await?;

        Ok(self
            .record(source, backup_dir, created_at, stats.files)
            .await)
    }

    async fn copy_into_new_dir<F>(
        &self,
        source: &Path,
        scan: Arc<ScanResult>,
        target_root: &Path,
        created_at: &DateTime<Local>,
        on_file: F,
    ) -> Result<(PathBuf, CopyStats), SyncError>
    where
        F: FnMut(&FileInfo, &FileOutcome) + Send + 'static,
    {
        let backup_dir = create_backup_dir(target_root, created_at)
            .map_err(|e| prerequisite(target_root, e.to_string()))?;

        let stats =
            copy_engine::copy_tree(source, &backup_dir, scan, self.options, on_file).await?;

        Ok((backup_dir, stats))
    }

    async fn record(
        &self,
        source: &Path,
        backup_dir: PathBuf,
        created_at: DateTime<Local>,
        files: Vec<PathBuf>,
    ) -> BackupRecord {
        let record = BackupRecord {
            id: Uuid::now_v7().to_string(),
            source: source.to_path_buf(),
            backup_dir,
            created_at,
            files,
        };

        self.ledger.record(record.clone()).await;
        record
    }
}

fn prerequisite(target_root: &Path, reason: String) -> SyncError {
    SyncError::BackupPrerequisiteFailure {
        target: target_root.to_path_buf(),
        reason,
    }
}

/// Directory name for a snapshot taken at `at`.
pub fn backup_dir_name(at: &DateTime<Local>) -> String {
    format!("{}{}", BACKUP_DIR_PREFIX, at.format(TIMESTAMP_FORMAT))
}

/// Create a new, empty snapshot directory under `target_root`.
///
/// Two snapshots in the same second never share a directory: the second gets
/// `_1` appended, the third `_2`, and so on.
pub fn create_backup_dir(target_root: &Path, at: &DateTime<Local>) -> std::io::Result<PathBuf> {
    let base = backup_dir_name(at);

    for attempt in 0..MAX_NAME_ATTEMPTS {
        let name = if attempt == 0 {
            base.clone()
        } else {
            format!("{}_{}", base, attempt)
        };
        let candidate = target_root.join(name);

        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }

    Err(std::io::Error::new(
        ErrorKind::AlreadyExists,
        format!("too many backups named {} in {}", base, target_root.display()),
    ))
}
