//! Append-only history of backup snapshots.
//!
//! The ledger always keeps history in memory. When a `LedgerStore` is
//! attached, existing history is loaded from it on open and every new record
//! is written through, so history survives restarts.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::models::BackupRecord;
use crate::db::SqliteLedgerStore;

/// Durable backing for the ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn append(&self, record: &BackupRecord) -> Result<()>;

    /// All stored records, oldest first.
    async fn load(&self) -> Result<Vec<BackupRecord>>;
}

#[derive(Clone, Default)]
pub struct BackupLedger {
    history: Arc<RwLock<Vec<BackupRecord>>>,
    store: Option<Arc<dyn LedgerStore>>,
    limit: Option<usize>,
}

impl BackupLedger {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a ledger over `store`, seeding memory with what it already holds.
    pub async fn with_store(store: Arc<dyn LedgerStore>) -> Result<Self> {
        let existing = store.load().await?;
        debug!(records = existing.len(), "Loaded backup history");

        Ok(Self {
            history: Arc::new(RwLock::new(existing)),
            store: Some(store),
            limit: None,
        })
    }

    /// Open the SQLite-backed ledger at `path`, or an in-memory one when no
    /// path is given.
    pub async fn open(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let store = SqliteLedgerStore::open(path).await?;
                Self::with_store(Arc::new(store)).await
            }
            None => Ok(Self::in_memory()),
        }
    }

    /// Cap how many records are kept in memory; the oldest go first,
    /// including any already loaded. The store, if any, is never pruned.
    pub async fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit.filter(|l| *l > 0);
        trim(&mut *self.history.write().await, self.limit);
        self
    }

    /// Append a record. A store write failure is logged and the record is
    /// still kept in memory.
    pub async fn record(&self, record: BackupRecord) {
        // Holding the write lock across the store call keeps both orders equal.
        let mut history = self.history.write().await;

        if let Some(store) = &self.store {
            if let Err(e) = store.append(&record).await {
                warn!(
                    backup_dir = %record.backup_dir.display(),
                    error = %e,
                    "Failed to persist backup record"
                );
            }
        }

        history.push(record);
        trim(&mut history, self.limit);
    }

    /// Snapshot of the history, oldest first.
    pub async fn history(&self) -> Vec<BackupRecord> {
        self.history.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.history.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn trim(history: &mut Vec<BackupRecord>, limit: Option<usize>) {
    if let Some(limit) = limit {
        let excess = history.len().saturating_sub(limit);
        history.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn record(dir: &str) -> BackupRecord {
        BackupRecord {
            id: dir.to_string(),
            source: PathBuf::from("/media/SRC"),
            backup_dir: PathBuf::from(dir),
            created_at: Local::now(),
            files: vec![PathBuf::from("a.txt")],
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        records: Mutex<Vec<BackupRecord>>,
        fail: bool,
    }

    #[async_trait]
    impl LedgerStore for MemoryStore {
        async fn append(&self, record: &BackupRecord) -> Result<()> {
            if self.fail {
                anyhow::bail!("disk full");
            }
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn load(&self) -> Result<Vec<BackupRecord>> {
            Ok(self.records.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn history_is_in_insertion_order() {
        let ledger = BackupLedger::in_memory();
        assert!(ledger.is_empty().await);

        ledger.record(record("/t/backup_1")).await;
        ledger.record(record("/t/backup_2")).await;

        let dirs: Vec<PathBuf> = ledger
            .history()
            .await
            .into_iter()
            .map(|r| r.backup_dir)
            .collect();
        assert_eq!(
            dirs,
            vec![PathBuf::from("/t/backup_1"), PathBuf::from("/t/backup_2")]
        );
    }

    #[tokio::test]
    async fn limit_drops_oldest_records() {
        let ledger = BackupLedger::in_memory().with_limit(Some(2)).await;
        for i in 0..4 {
            ledger.record(record(&format!("/t/backup_{}", i))).await;
        }

        let history = ledger.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].backup_dir, PathBuf::from("/t/backup_2"));
    }

    #[tokio::test]
    async fn store_is_loaded_and_written_through() {
        let store = Arc::new(MemoryStore::default());
        store.records.lock().unwrap().push(record("/t/old"));

        let ledger = BackupLedger::with_store(store.clone()).await.unwrap();
        assert_eq!(ledger.len().await, 1);

        ledger.record(record("/t/new")).await;
        assert_eq!(store.records.lock().unwrap().len(), 2);
        assert_eq!(ledger.history().await[1].backup_dir, PathBuf::from("/t/new"));
    }

    #[tokio::test]
    async fn limit_applies_to_loaded_history() {
        let store = Arc::new(MemoryStore::default());
        for dir in ["/t/backup_0", "/t/backup_1", "/t/backup_2"] {
            store.records.lock().unwrap().push(record(dir));
        }

        let ledger = BackupLedger::with_store(store.clone())
            .await
            .unwrap()
            .with_limit(Some(2))
            .await;

        let dirs: Vec<PathBuf> = ledger
            .history()
            .await
            .into_iter()
            .map(|r| r.backup_dir)
            .collect();
        assert_eq!(
            dirs,
            vec![PathBuf::from("/t/backup_1"), PathBuf::from("/t/backup_2")]
        );
        assert_eq!(store.records.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn store_failure_keeps_record_in_memory() {
        let store = Arc::new(MemoryStore {
            fail: true,
            ..Default::default()
        });
        let ledger = BackupLedger::with_store(store).await.unwrap();

        ledger.record(record("/t/backup")).await;
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn sqlite_history_survives_reopen() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("ledger/usbsync.db");

        let ledger = BackupLedger::open(Some(&path)).await.unwrap();
        ledger.record(record("/t/backup_a")).await;
        ledger.record(record("/t/backup_b")).await;
        drop(ledger);

        let reopened = BackupLedger::open(Some(&path)).await.unwrap();
        let history = reopened.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].backup_dir, PathBuf::from("/t/backup_a"));
        assert_eq!(history[1].files, vec![PathBuf::from("a.txt")]);

        assert!(BackupLedger::open(None).await.unwrap().is_empty().await);
    }
}
