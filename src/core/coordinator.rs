//! Single-flight execution of transfer, backup and sync operations.
//!
//! The coordinator owns the per-kind state machine
//! `Idle -> Running -> {Completed | Failed} -> Idle` and publishes every
//! transition, plus the engines' progress, on a broadcast channel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use super::backup_engine::BackupEngine;
use super::ledger::BackupLedger;
use super::models::{
    BackupRecord, OperationKind, OperationState, ProgressEvent, SyncOutcome, TargetVolume, Volume,
};
use super::progress::{ProgressSink, ProgressTracker};
use super::sync_engine::SyncEngine;
use super::transfer_engine::TransferEngine;
use crate::error::SyncError;

const EVENT_CAPACITY: usize = 256;

/// A validated source and target selection, with paths captured by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    pub source_label: String,
    pub source: PathBuf,
    pub targets: Vec<TargetVolume>,
}

impl OperationRequest {
    /// Resolve labels against a volume snapshot. Unknown target labels are
    /// dropped.
    pub fn from_labels(
        volumes: &[Volume],
        source_label: Option<&str>,
        target_labels: &[String],
    ) -> Result<Self, SyncError> {
        let source_label = source_label
            .filter(|l| !l.is_empty())
            .ok_or_else(|| SyncError::InvalidSelection("No source device selected".into()))?;

        if target_labels.is_empty() {
            return Err(SyncError::InvalidSelection(
                "No target devices selected".into(),
            ));
        }

        let source = volumes
            .iter()
            .find(|v| v.label == source_label)
            .ok_or_else(|| SyncError::InvalidSelection("Source device not found".into()))?;

        if target_labels.iter().any(|l| l == source_label) {
            return Err(SyncError::InvalidSelection(
                "Source cannot be a target".into(),
            ));
        }

        let targets: Vec<TargetVolume> = target_labels
            .iter()
            .filter_map(|label| match volumes.iter().find(|v| &v.label == label) {
                Some(volume) => Some(TargetVolume::from(volume)),
                None => {
                    debug!(label = %label, "Dropping unknown target");
                    None
                }
            })
            .collect();

        if targets.is_empty() {
            return Err(SyncError::InvalidSelection(
                "No target devices selected".into(),
            ));
        }

        Ok(Self {
            source_label: source.label.clone(),
            source: source.mount_point.clone(),
            targets,
        })
    }
}

/// What a finished operation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationReport {
    /// Labels of the targets that received the tree.
    Transfer(Vec<String>),
    Backup(Vec<BackupRecord>),
    Sync(Vec<SyncOutcome>),
}

impl OperationReport {
    pub fn succeeded_targets(&self) -> usize {
        match self {
            Self::Transfer(labels) => labels.len(),
            Self::Backup(records) => records.len(),
            Self::Sync(outcomes) => outcomes.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationEvent {
    Started {
        kind: OperationKind,
        source: String,
    },
    Progress {
        kind: OperationKind,
        event: ProgressEvent,
    },
    Completed {
        kind: OperationKind,
        message: String,
    },
    Failed {
        kind: OperationKind,
        reason: String,
    },
    /// A start request was refused because `running` holds the gate.
    Rejected {
        requested: OperationKind,
        running: OperationKind,
    },
    /// The kind went back to idle after its result was shown.
    Reset {
        kind: OperationKind,
        message: String,
    },
}

/// A running operation.
#[derive(Debug)]
pub struct OperationHandle {
    pub kind: OperationKind,
    task: JoinHandle<Result<OperationReport, SyncError>>,
}

impl OperationHandle {
    pub async fn wait(self) -> Result<OperationReport, SyncError> {
        self.task
            .await
            .map_err(|e| SyncError::Interrupted(e.to_string()))?
    }
}

#[derive(Debug, Clone)]
struct KindSlot {
    state: OperationState,
    generation: u64,
}

#[derive(Debug)]
struct Gate {
    active: Option<OperationKind>,
    slots: HashMap<OperationKind, KindSlot>,
}

struct Inner {
    transfer: TransferEngine,
    backup: BackupEngine,
    sync: SyncEngine,
    gate: Mutex<Gate>,
    events: broadcast::Sender<OperationEvent>,
    progress: ProgressTracker,
    reset_after: Duration,
}

#[derive(Clone)]
pub struct OperationCoordinator {
    inner: Arc<Inner>,
}

impl OperationCoordinator {
    pub fn new(ledger: BackupLedger, sync_files: bool, reset_after: Duration) -> Self {
        let backup = BackupEngine::new(ledger, sync_files);
        let slots = OperationKind::ALL
            .into_iter()
            .map(|kind| {
                (
                    kind,
                    KindSlot {
                        state: OperationState::Idle,
                        generation: 0,
                    },
                )
            })
            .collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                transfer: TransferEngine::new(sync_files),
                sync: SyncEngine::new(backup.clone(), sync_files),
                backup,
                gate: Mutex::new(Gate {
                    active: None,
                    slots,
                }),
                events,
                progress: ProgressTracker::new(),
                reset_after,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.inner.events.subscribe()
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.inner.progress
    }

    pub fn ledger(&self) -> &BackupLedger {
        self.inner.backup.ledger()
    }

    pub async fn history(&self) -> Vec<BackupRecord> {
        self.ledger().history().await
    }

    pub fn state(&self, kind: OperationKind) -> OperationState {
        self.inner
            .lock_gate()
            .slots
            .get(&kind)
            .map(|slot| slot.state.clone())
            .unwrap_or(OperationState::Idle)
    }

    /// The kind currently holding the gate, if any.
    pub fn active(&self) -> Option<OperationKind> {
        self.inner.lock_gate().active
    }

    pub fn start_transfer(&self, request: OperationRequest) -> Result<OperationHandle, SyncError> {
        self.start(OperationKind::Transfer, request)
    }

    pub fn start_backup(&self, request: OperationRequest) -> Result<OperationHandle, SyncError> {
        self.start(OperationKind::Backup, request)
    }

    pub fn start_sync(&self, request: OperationRequest) -> Result<OperationHandle, SyncError> {
        self.start(OperationKind::Sync, request)
    }

    /// Start `kind` in the background. Refused, with no state change, while
    /// any other operation is running.
    pub fn start(
        &self,
        kind: OperationKind,
        request: OperationRequest,
    ) -> Result<OperationHandle, SyncError> {
        {
            let mut gate = self.inner.lock_gate();
            if let Some(running) = gate.active {
                drop(gate);
                info!(requested = %kind, running = %running, "Rejecting operation");
                self.inner.emit(OperationEvent::Rejected {
                    requested: kind,
                    running,
                });
                return Err(SyncError::ConcurrentOperationRejected { running });
            }

            gate.active = Some(kind);
            if let Some(slot) = gate.slots.get_mut(&kind) {
                slot.state = OperationState::Running;
                slot.generation += 1;
            }
        }

        self.inner.emit(OperationEvent::Started {
            kind,
            source: request.source_label.clone(),
        });

        let inner = self.inner.clone();
        let span = info_span!("operation", kind = %kind, source = %request.source_label);
        let task = tokio::spawn(async move { inner.execute(kind, request).await }.instrument(span));

        Ok(OperationHandle { kind, task })
    }
}

impl Inner {
    fn lock_gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: OperationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn execute(
        self: Arc<Self>,
        kind: OperationKind,
        request: OperationRequest,
    ) -> Result<OperationReport, SyncError> {
        info!(targets = request.targets.len(), "Operation started");

        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
        let sink: Arc<dyn ProgressSink> = Arc::new(move |event: ProgressEvent| {
            let _ = tx.send(event);
        });

        let forwarder = {
            let inner = self.clone();
            tokio::spawn(async move {
                let mut last = None;
                while let Some(event) = rx.recv().await {
                    inner.progress.update(kind, event.clone()).await;
                    inner.emit(OperationEvent::Progress {
                        kind,
                        event: event.clone(),
                    });
                    last = Some(event);
                }
                last
            })
        };

        let result = match kind {
            OperationKind::Transfer => self
                .transfer
                .run(&request.source, &request.targets, sink)
                .await
                .map(OperationReport::Transfer),
            OperationKind::Backup => self
                .backup
                .run(&request.source, &request.targets, sink)
                .await
                .map(OperationReport::Backup),
            OperationKind::Sync => self
                .sync
                .run(&request.source, &request.targets, sink)
                .await
                .map(OperationReport::Sync),
        };

        let last = forwarder.await.ok().flatten();

        let outcome = match (&result, last) {
            (Err(e), _) => Err(e.to_string()),
            (Ok(_), Some(event)) if event.percent >= 100.0 => Ok(event.message),
            (Ok(_), Some(event)) => Err(event.message),
            (Ok(_), None) => Err(format!("{} produced no result", kind)),
        };

        if let Ok(report) = &result {
            info!(succeeded = report.succeeded_targets(), "Operation finished");
        }

        self.finish(kind, outcome);
        result
    }

    /// Release the gate, publish the result and schedule the reset to idle.
    /// `outcome` carries the summary on success and the reason on failure.
    fn finish(self: &Arc<Self>, kind: OperationKind, outcome: Result<String, String>) {
        let state = match &outcome {
            Ok(_) => OperationState::Completed,
            Err(reason) => OperationState::Failed(reason.clone()),
        };

        let generation = {
            let mut gate = self.lock_gate();
            if gate.active == Some(kind) {
                gate.active = None;
            }
            match gate.slots.get_mut(&kind) {
                Some(slot) => {
                    slot.state = state;
                    slot.generation
                }
                None => 0,
            }
        };

        match outcome {
            Ok(message) => self.emit(OperationEvent::Completed { kind, message }),
            Err(reason) => {
                warn!(reason = %reason, "Operation failed");
                self.emit(OperationEvent::Failed { kind, reason });
            }
        }

        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.reset_after).await;
            inner.reset(kind, generation).await;
        });
    }

    async fn reset(&self, kind: OperationKind, generation: u64) {
        {
            let mut gate = self.lock_gate();
            let Some(slot) = gate.slots.get_mut(&kind) else {
                return;
            };
            // A newer run of this kind owns the slot now.
            if slot.generation != generation || slot.state.is_running() {
                return;
            }
            slot.state = OperationState::Idle;
        }

        self.progress.remove(kind).await;
        debug!(kind = %kind, "Operation reset to idle");
        self.emit(OperationEvent::Reset {
            kind,
            message: kind.idle_message().to_string(),
        });
    }
}
