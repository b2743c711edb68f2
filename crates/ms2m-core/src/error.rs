//! ---
//! ms2m_section: "01-core-functionality"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Migration error taxonomy and classification."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
//! Every failure is classified into one of four classes. Only `Transient`
//! errors leave the migration in its current phase; the other classes end
//! it in `Failed`.

use std::fmt;
use std::io;

use ms2m_api::{IllegalTransition, MigrationKey, Phase};
use ms2m_checkpoint::ArtifactError;
use ms2m_replay::ReplayError;
use ms2m_transport::TransferError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MigrationError>;

const ENOSPC: i32 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Requeue the same phase with backoff.
    Transient,
    /// Malformed request or missing source; fail without retry.
    Validation,
    /// Corrupt or inconsistent data from a collaborator; fail.
    Integrity,
    /// Storage or workload failure that needs operator attention; fail.
    Resource,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Validation => "validation",
            ErrorClass::Integrity => "integrity",
            ErrorClass::Resource => "resource",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ErrorClass::Transient)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Network or proxy failure reaching the node. Retryable.
    #[error("checkpoint unavailable: {0}")]
    CheckpointUnavailable(String),
    /// The node answered with a body that cannot be parsed. Not retryable.
    #[error("checkpoint response invalid: {0}")]
    CheckpointResponseInvalid(String),
    /// The node refused the request, e.g. because the pod no longer exists.
    #[error("checkpoint rejected with status {status}: {reason}")]
    CheckpointRejected { status: u16, reason: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(MigrationKey),
    #[error("{key} was modified concurrently (expected version {expected}, found {actual})")]
    Conflict {
        key: MigrationKey,
        expected: String,
        actual: String,
    },
    #[error("resource store unavailable: {0}")]
    Unavailable(String),
    #[error("resource store returned invalid data: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster api unavailable: {0}")]
    Unavailable(String),
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("cluster api rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("invalid migration request: {0}")]
    Validation(String),
    #[error("checkpoint returned no archive")]
    NoCheckpointArchive,
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("target workload failed: {0}")]
    TargetFailed(String),
    /// An off-node shipment exhausted its retries.
    #[error("shipment failed: {0}")]
    ShipmentFailed(String),
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),
    #[error("operation cancelled")]
    Cancelled,
    #[error("{phase} {migration}: {source}")]
    Context {
        phase: Phase,
        migration: MigrationKey,
        #[source]
        source: Box<MigrationError>,
    },
}

impl From<ms2m_common::Cancelled> for MigrationError {
    fn from(_: ms2m_common::Cancelled) -> Self {
        MigrationError::Cancelled
    }
}

impl MigrationError {
    /// Attach the phase and migration the error surfaced in.
    pub fn in_phase(self, phase: Phase, migration: &MigrationKey) -> Self {
        match self {
            err @ MigrationError::Context { .. } => err,
            err => MigrationError::Context {
                phase,
                migration: migration.clone(),
                source: Box::new(err),
            },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            MigrationError::Cancelled => true,
            MigrationError::Context { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            MigrationError::Validation(_) => ErrorClass::Validation,
            MigrationError::NoCheckpointArchive => ErrorClass::Integrity,
            MigrationError::Checkpoint(CheckpointError::CheckpointUnavailable(_)) => {
                ErrorClass::Transient
            }
            MigrationError::Checkpoint(CheckpointError::CheckpointResponseInvalid(_)) => {
                ErrorClass::Integrity
            }
            MigrationError::Checkpoint(CheckpointError::CheckpointRejected { .. }) => {
                ErrorClass::Validation
            }
            MigrationError::Transfer(err) => classify_transfer(err),
            MigrationError::Replay(err) if err.is_transient() => ErrorClass::Transient,
            MigrationError::Replay(_) => ErrorClass::Validation,
            MigrationError::Store(StoreError::NotFound(_)) => ErrorClass::Validation,
            MigrationError::Store(StoreError::Invalid(_)) => ErrorClass::Integrity,
            MigrationError::Store(_) => ErrorClass::Transient,
            MigrationError::Cluster(ClusterError::Unavailable(_)) => ErrorClass::Transient,
            MigrationError::Cluster(ClusterError::NotFound { .. }) => ErrorClass::Validation,
            MigrationError::Cluster(ClusterError::Rejected(_)) => ErrorClass::Resource,
            MigrationError::TargetFailed(_) | MigrationError::ShipmentFailed(_) => {
                ErrorClass::Resource
            }
            MigrationError::IllegalTransition(_) => ErrorClass::Integrity,
            MigrationError::Cancelled => ErrorClass::Transient,
            MigrationError::Context { source, .. } => source.class(),
        }
    }
}

/// A full disk can be cleared externally, so it is worth retrying.
pub fn is_disk_full(err: &io::Error) -> bool {
    err.raw_os_error() == Some(ENOSPC)
}

fn classify_io(err: &io::Error) -> ErrorClass {
    if is_disk_full(err) {
        ErrorClass::Transient
    } else {
        ErrorClass::Resource
    }
}

fn classify_transfer(err: &TransferError) -> ErrorClass {
    if err.is_retryable() {
        return ErrorClass::Transient;
    }
    match err {
        TransferError::InvalidDestination(_) | TransferError::Credentials(_) => {
            ErrorClass::Validation
        }
        TransferError::Artifact(ArtifactError::InvalidArtifact(_))
        | TransferError::Artifact(ArtifactError::Encode(_)) => ErrorClass::Integrity,
        TransferError::Artifact(artifact) => artifact
            .io_error()
            .map(classify_io)
            .unwrap_or(ErrorClass::Resource),
        TransferError::Io(io) => classify_io(io),
        TransferError::TransferRejected { body, .. }
            if body.to_ascii_lowercase().contains("no space left on device") =>
        {
            ErrorClass::Transient
        }
        _ => ErrorClass::Resource,
    }
}
