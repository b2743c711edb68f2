//! ---
//! ms2m_section: "02-data-model"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Migration phase lattice and transition rules."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle phase of a migration.
///
/// Phases are totally ordered along the happy path. `Completed` and `Failed`
/// are absorbing; `Failed` is reachable from every non-terminal phase.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum Phase {
    /// Freshly created record that has not been observed yet.
    #[default]
    #[serde(rename = "")]
    Initial,
    Pending,
    Checkpointing,
    Transferring,
    Restoring,
    Replaying,
    Finalizing,
    Completed,
    Failed,
}

impl Phase {
    /// Every phase in lattice order.
    pub const ALL: [Phase; 9] = [
        Phase::Initial,
        Phase::Pending,
        Phase::Checkpointing,
        Phase::Transferring,
        Phase::Restoring,
        Phase::Replaying,
        Phase::Finalizing,
        Phase::Completed,
        Phase::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initial => "",
            Phase::Pending => "Pending",
            Phase::Checkpointing => "Checkpointing",
            Phase::Transferring => "Transferring",
            Phase::Restoring => "Restoring",
            Phase::Replaying => "Replaying",
            Phase::Finalizing => "Finalizing",
            Phase::Completed => "Completed",
            Phase::Failed => "Failed",
        }
    }

    /// Position along the lattice, used for monotonicity checks.
    pub fn ordinal(&self) -> u8 {
        *self as u8
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    /// Successor on the happy path, `None` for terminal phases.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Initial => Some(Phase::Pending),
            Phase::Pending => Some(Phase::Checkpointing),
            Phase::Checkpointing => Some(Phase::Transferring),
            Phase::Transferring => Some(Phase::Restoring),
            Phase::Restoring => Some(Phase::Replaying),
            Phase::Replaying => Some(Phase::Finalizing),
            Phase::Finalizing => Some(Phase::Completed),
            Phase::Completed | Phase::Failed => None,
        }
    }

    pub fn can_transition_to(&self, to: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == Phase::Failed || self.next() == Some(to)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Initial => f.write_str("<initial>"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Raised when a string does not name a known phase.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown migration phase {0:?}")]
pub struct UnknownPhase(pub String);

impl FromStr for Phase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .iter()
            .copied()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| UnknownPhase(s.to_owned()))
    }
}
