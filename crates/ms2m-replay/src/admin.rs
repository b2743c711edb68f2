//! ---
//! ms2m_section: "06-replay"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Broker administration seam used by the coordinator."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ms2m_api::MessageQueueConfig;

use crate::error::Result;

/// Backlog snapshot of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueDepth {
    /// Ready plus unacknowledged messages.
    pub messages: u64,
    pub consumers: u64,
}

/// In-band markers delimiting the replay window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    StartReplay,
    EndReplay,
}

impl ControlSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlSignal::StartReplay => "START_REPLAY",
            ControlSignal::EndReplay => "END_REPLAY",
        }
    }
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait QueueAdmin: Send + Sync {
    /// Idempotent. `expiry` removes the queue once it has gone unused that long.
    async fn declare_queue(&self, queue: &str, expiry: Duration) -> Result<()>;
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;
    async fn queue_depth(&self, queue: &str) -> Result<QueueDepth>;
    /// Deliver `signal` straight to `queue`.
    async fn publish_control(&self, queue: &str, signal: ControlSignal, migration: &str) -> Result<()>;
    /// Returns false when the queue was already gone or, with `if_empty`,
    /// still held messages.
    async fn delete_queue(&self, queue: &str, if_empty: bool) -> Result<bool>;
}

/// Resolves the admin endpoint for a migration's broker.
pub trait BrokerConnector: Send + Sync {
    fn connect(&self, mq: &MessageQueueConfig) -> Result<Arc<dyn QueueAdmin>>;
}

impl<T> BrokerConnector for Arc<T>
where
    T: QueueAdmin + 'static,
{
    fn connect(&self, _mq: &MessageQueueConfig) -> Result<Arc<dyn QueueAdmin>> {
        Ok(self.clone())
    }
}
