//! ---
//! ms2m_section: "08-control-plane"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Control-plane adapters crate root."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
//! Implementations of the orchestrator's collaborator traits against a
//! Kubernetes-style API server.

pub mod checkpoint;
pub mod client;
pub mod cluster;
pub mod error;
pub mod jobs;
pub mod store;

pub use checkpoint::{build_checkpoint_path, parse_checkpoint_response, KubeletCheckpointClient};
pub use client::ApiServerClient;
pub use cluster::{target_manifest, target_state, KubeCluster, CUTOVER_LABEL, SCALED_FROM_ANNOTATION, TARGET_LABEL};
pub use error::{KubeError, Result};
pub use jobs::{job_name, KubeJobShipper};
pub use store::{parse_watch_line, KubeMigrationStore};
