//! ---
//! ms2m_section: "05-node-agent"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Error types for the node loader."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use ms2m_checkpoint::ArtifactError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LoaderError>;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("build image: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("load {tag}: {output}")]
    LoadFailed { tag: String, output: String },
    #[error("launch image loader: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("scratch storage: {0}")]
    Io(#[from] std::io::Error),
}

impl LoaderError {
    pub fn io_error(&self) -> Option<&std::io::Error> {
        match self {
            LoaderError::Artifact(err) => err.io_error(),
            LoaderError::Spawn(err) | LoaderError::Io(err) => Some(err),
            LoaderError::LoadFailed { .. } => None,
        }
    }
}
