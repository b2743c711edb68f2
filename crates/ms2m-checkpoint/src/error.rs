//! ---
//! ms2m_section: "03-checkpoint-artifact"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Error types raised while building checkpoint artifacts."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ArtifactError>;

#[derive(Debug, Error)]
pub enum ArtifactError {
    /// The checkpoint archive is missing or cannot be read.
    #[error("artifact build failed: cannot read {path}: {source}")]
    ArchiveUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Manifest and config disagree on the image-spec family.
    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),
    #[error("artifact encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("artifact i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ArtifactError {
    /// Underlying I/O error, if any, so callers can spot a full disk.
    pub fn io_error(&self) -> Option<&std::io::Error> {
        match self {
            ArtifactError::ArchiveUnreadable { source, .. } => Some(source),
            ArtifactError::Io(err) => Some(err),
            _ => None,
        }
    }
}
