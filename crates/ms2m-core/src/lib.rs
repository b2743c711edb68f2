//! ---
//! ms2m_section: "01-core-functionality"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Migration orchestrator crate root and shared exports."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
//! Migration orchestration: the phase state machine, the collaborator
//! interfaces it drives, the versioned resource store, and the reconcile loop
//! that feeds it.

pub mod backoff;
pub mod clock;
pub mod collaborators;
pub mod controller;
pub mod error;
pub mod orchestrator;
pub mod reconcile;
pub mod shipper;
pub mod store;

pub use backoff::{RetryBackoff, RetryPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{
    ArtifactShipper, CheckpointApi, ClusterInspector, NodeInfo, ShipmentRequest, ShipmentState,
    SourceInfo, TargetSpec, TargetState, WorkloadRuntime,
};
pub use controller::{Controller, ControllerSettings};
pub use error::{
    is_disk_full, CheckpointError, ClusterError, ErrorClass, MigrationError, Result, StoreError,
};
pub use orchestrator::{phase_label, Collaborators, MigrationOrchestrator, Requeue, StepOutcome};
pub use reconcile::{ReconcileReport, Reconciler};
pub use shipper::LocalShipper;
pub use store::{InMemoryStore, ResourceStore, StoreResult, WatchEvent, WatchEventKind};

pub use tokio_util::sync::CancellationToken;
