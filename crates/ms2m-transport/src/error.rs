//! ---
//! ms2m_section: "04-artifact-transfer"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Error types for artifact transfer."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use ms2m_checkpoint::ArtifactError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid destination {0:?}")]
    InvalidDestination(String),
    /// Registry unreachable, refused credentials, or rejected a request.
    #[error("push to {reference} failed: {reason}")]
    PushFailed { reference: String, reason: String },
    /// Network failure while streaming to a receiving agent.
    #[error("upload to {url} failed: {reason}")]
    UploadFailed { url: String, reason: String },
    /// The receiving agent answered with a non-2xx status.
    #[error("transfer rejected with status {status}: {body}")]
    TransferRejected { status: u16, body: String },
    #[error("http client setup failed: {0}")]
    ClientSetup(String),
    #[error("credential lookup failed: {0}")]
    Credentials(String),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("transfer i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Whether repeating the same transfer may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::PushFailed { .. } | TransferError::UploadFailed { .. } => true,
            TransferError::TransferRejected { status, .. } => {
                matches!(status, 429 | 502 | 503 | 504)
            }
            _ => false,
        }
    }
}
