pub mod backup_engine;
pub mod coordinator;
pub mod copy_engine;
pub mod hardware;
pub mod ledger;
pub mod models;
pub mod probe;
pub mod progress;
pub mod registry;
pub mod sync_engine;
pub mod transfer_engine;

pub use backup_engine::BackupEngine;
pub use coordinator::{
    OperationCoordinator, OperationEvent, OperationHandle, OperationReport, OperationRequest,
};
pub use hardware::{MountedVolume, Usage, VolumeSource};
pub use ledger::{BackupLedger, LedgerStore};
pub use models::{
    BackupRecord, OperationKind, OperationState, ProgressChannel, ProgressEvent, SyncOutcome,
    TargetVolume, Volume,
};
pub use probe::{RemovablePolicy, VolumeProbe};
pub use progress::{ProgressSink, ProgressTracker};
pub use registry::{ChangeCallback, RegistryConfig, VolumeRegistry};
pub use sync_engine::SyncEngine;
pub use transfer_engine::TransferEngine;
