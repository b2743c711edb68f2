//! ---
//! ms2m_section: "06-replay"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Replay window coordination between source and target."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---

pub mod admin;
pub mod coordinator;
pub mod error;
pub mod rabbit;

pub use admin::{BrokerConnector, ControlSignal, QueueAdmin, QueueDepth};
pub use coordinator::{
    secondary_queue_name, ReplayCoordinator, ReplayDecision, ReplayPolicy, SECONDARY_QUEUE_EXPIRY,
};
pub use error::{ReplayError, Result};
pub use rabbit::{RabbitConnector, RabbitManagementClient};
