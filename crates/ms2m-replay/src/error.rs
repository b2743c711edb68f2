//! ---
//! ms2m_section: "06-replay"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Error types for replay coordination."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReplayError>;

#[derive(Debug, Error)]
pub enum ReplayError {
    /// Broker management call failed or returned an unexpected status.
    #[error("broker {operation} failed: {reason}")]
    Management {
        operation: &'static str,
        reason: String,
    },
    #[error("queue {0} does not exist")]
    QueueMissing(String),
    /// Message queue settings that can never work.
    #[error("invalid message queue config: {0}")]
    InvalidConfig(String),
}

impl ReplayError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReplayError::Management { .. } | ReplayError::QueueMissing(_)
        )
    }
}
