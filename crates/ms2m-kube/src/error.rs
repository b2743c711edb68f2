//! ---
//! ms2m_section: "08-control-plane"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Control-plane error type and mapping into orchestrator errors."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use ms2m_core::{CheckpointError, ClusterError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KubeError>;

#[derive(Debug, Error)]
pub enum KubeError {
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },
    #[error("api server answered {status} for {url}: {message}")]
    Status {
        status: u16,
        url: String,
        message: String,
    },
    #[error("cannot decode {what}: {reason}")]
    Decode { what: String, reason: String },
    #[error("invalid client configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl KubeError {
    pub fn status(&self) -> Option<u16> {
        match self {
            KubeError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    /// Worth retrying with the same request.
    pub fn is_transient(&self) -> bool {
        match self {
            KubeError::Transport { .. } => true,
            KubeError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<KubeError> for ClusterError {
    fn from(err: KubeError) -> Self {
        if err.is_transient() {
            ClusterError::Unavailable(err.to_string())
        } else if err.is_not_found() {
            ClusterError::NotFound {
                kind: "object",
                name: err.to_string(),
            }
        } else {
            ClusterError::Rejected(err.to_string())
        }
    }
}

impl From<KubeError> for CheckpointError {
    fn from(err: KubeError) -> Self {
        match err {
            err if err.is_transient() => CheckpointError::CheckpointUnavailable(err.to_string()),
            KubeError::Status {
                status, message, ..
            } => CheckpointError::CheckpointRejected {
                status,
                reason: message,
            },
            KubeError::Decode { reason, .. } => CheckpointError::CheckpointResponseInvalid(reason),
            other => CheckpointError::CheckpointUnavailable(other.to_string()),
        }
    }
}
