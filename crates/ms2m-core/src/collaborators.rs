//! ---
//! ms2m_section: "01-core-functionality"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Narrow interfaces to the checkpoint API, cluster state, and workload runtime."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
//! Interfaces the orchestrator drives. Each call must be bounded by a single
//! network timeout and safe to repeat with the same arguments.

use async_trait::async_trait;
use ms2m_api::{MigrationKey, MigrationStrategy};
use ms2m_transport::Destination;

use crate::error::{CheckpointError, ClusterError, MigrationError};

/// Freeze a container and dump its state to node-local archives.
#[async_trait]
pub trait CheckpointApi: Send + Sync {
    /// Returns the archive locations in the order reported by the node.
    async fn checkpoint(
        &self,
        node: &str,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<Vec<String>, CheckpointError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceInfo {
    pub node: String,
    pub running: bool,
    pub containers: Vec<String>,
    /// Kind of the controlling owner, e.g. `StatefulSet`.
    pub owner_kind: Option<String>,
    pub owner_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeInfo {
    pub name: String,
    pub ready: bool,
    pub schedulable: bool,
    /// Allocatable pod slots, `None` when the node does not report them.
    pub pod_capacity: Option<u32>,
    pub pods_running: u32,
    /// Internal address the node agent listens on.
    pub address: Option<String>,
}

impl NodeInfo {
    pub fn has_capacity(&self) -> bool {
        self.pod_capacity
            .map(|capacity| self.pods_running < capacity)
            .unwrap_or(true)
    }
}

/// Read-only view of cluster objects used during validation.
#[async_trait]
pub trait ClusterInspector: Send + Sync {
    async fn source(&self, namespace: &str, pod: &str) -> Result<Option<SourceInfo>, ClusterError>;

    async fn node(&self, name: &str) -> Result<Option<NodeInfo>, ClusterError>;
}

/// Everything needed to start the restored workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub migration: MigrationKey,
    pub namespace: String,
    pub name: String,
    pub source_pod: String,
    pub node: String,
    pub container: String,
    pub image: String,
    pub strategy: MigrationStrategy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetState {
    Pending,
    Running,
    Failed(String),
}

#[async_trait]
pub trait WorkloadRuntime: Send + Sync {
    /// Create the target if absent and report its state.
    async fn ensure_target(&self, target: &TargetSpec) -> Result<TargetState, ClusterError>;

    /// Point the source's traffic selectors at the target.
    async fn switch_traffic(
        &self,
        namespace: &str,
        source_pod: &str,
        target_pod: &str,
    ) -> Result<(), ClusterError>;

    /// Delete the source pod. Returns `true` once it is gone. A pod carrying
    /// the target label of `migration` is never deleted and counts as gone.
    async fn retire_source(
        &self,
        namespace: &str,
        pod: &str,
        migration: &MigrationKey,
    ) -> Result<bool, ClusterError>;
}

/// One request to move a checkpoint archive off the source node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipmentRequest {
    pub migration: MigrationKey,
    pub source_node: String,
    /// Archive path on the source node.
    pub archive: String,
    pub destination: Destination,
    pub container: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipmentState {
    Done,
    InProgress,
}

/// Runs the build-and-transfer pipeline somewhere that can read the archive.
/// Repeating a request that already completed reports `Done`.
#[async_trait]
pub trait ArtifactShipper: Send + Sync {
    async fn ship(&self, request: &ShipmentRequest) -> Result<ShipmentState, MigrationError>;
}
