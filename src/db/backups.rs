use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio_rusqlite::{Connection, params, rusqlite};

use crate::core::ledger::LedgerStore;
use crate::core::models::BackupRecord;

/// Ledger store kept in a SQLite database.
pub struct SqliteLedgerStore {
    conn: Connection,
}

impl SqliteLedgerStore {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub async fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(super::init(path).await?))
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn append(&self, record: &BackupRecord) -> Result<()> {
        insert(&self.conn, record).await
    }

    async fn load(&self) -> Result<Vec<BackupRecord>> {
        list(&self.conn).await
    }
}

/// Row as stored, before text columns are decoded.
struct StoredBackup {
    id: String,
    source: String,
    backup_dir: String,
    created_at: String,
    files: String,
}

pub async fn insert(conn: &Connection, record: &BackupRecord) -> Result<()> {
    let files: Vec<String> = record
        .files
        .iter()
        .map(|f| f.to_string_lossy().into_owned())
        .collect();
    let files = serde_json::to_string(&files).context("Failed to encode file list")?;

    let id = record.id.clone();
    let source = record.source.to_string_lossy().into_owned();
    let backup_dir = record.backup_dir.to_string_lossy().into_owned();
    let created_at = record.created_at.to_rfc3339();
    let file_count = record.file_count() as i64;

    conn.call(move |c| {
        c.execute(
            "INSERT INTO backups (id, source, backup_dir, created_at, file_count, files)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, source, backup_dir, created_at, file_count, files],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

pub async fn list(conn: &Connection) -> Result<Vec<BackupRecord>> {
    let rows = conn
        .call(|c| {
            let mut stmt = c.prepare(
                "SELECT id, source, backup_dir, created_at, files
                 FROM backups
                 ORDER BY rowid ASC",
            )?;

            let rows = stmt
                .query_map([], |row| {
                    Ok(StoredBackup {
                        id: row.get(0)?,
                        source: row.get(1)?,
                        backup_dir: row.get(2)?,
                        created_at: row.get(3)?,
                        files: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok::<Vec<StoredBackup>, rusqlite::Error>(rows)
        })
        .await
        .map_err(|e| anyhow!("Failed to list backups: {}", e))?;

    rows.into_iter().map(decode).collect()
}

fn decode(row: StoredBackup) -> Result<BackupRecord> {
    let created_at = DateTime::parse_from_rfc3339(&row.created_at)
        .with_context(|| format!("Bad timestamp on backup {}", row.id))?
        .with_timezone(&Local);

    let files: Vec<String> = serde_json::from_str(&row.files)
        .with_context(|| format!("Bad file list on backup {}", row.id))?;

    Ok(BackupRecord {
        id: row.id,
        source: PathBuf::from(row.source),
        backup_dir: PathBuf::from(row.backup_dir),
        created_at,
        files: files.into_iter().map(PathBuf::from).collect(),
    })
}
