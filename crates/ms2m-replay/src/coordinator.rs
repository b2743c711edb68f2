//! ---
//! ms2m_section: "06-replay"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Replay window state machine and cutover decision."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
//! The replay window opens once the target is running. Events that reached
//! the source after the checkpoint are mirrored into a secondary queue bound
//! to the same exchange and routing key, and the target drains that queue.
//!
//! The coordinator never blocks. Each [`ReplayCoordinator::evaluate`] call
//! takes one lag sample, updates the persisted [`ReplayProgress`] and
//! decides whether to keep waiting or cut over. Cutover happens once the lag
//! has stayed at or below the threshold for the whole stability window, or
//! unconditionally when the hard cutoff elapses. The second case is recorded
//! as degraded instead of failing the migration.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ms2m_api::{MessageQueueConfig, ReplayOutcome, ReplayProgress};
use ms2m_common::ReplayConfig;
use tracing::{debug, info, warn};

use crate::admin::{BrokerConnector, ControlSignal, QueueAdmin};
use crate::error::{ReplayError, Result};

/// How long an abandoned secondary queue survives without consumers.
pub const SECONDARY_QUEUE_EXPIRY: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayPolicy {
    pub lag_threshold: u64,
    pub stability_window: Duration,
    pub hard_cutoff: Duration,
    pub poll_interval: Duration,
}

impl Default for ReplayPolicy {
    fn default() -> Self {
        Self::from(&ReplayConfig::default())
    }
}

impl From<&ReplayConfig> for ReplayPolicy {
    fn from(config: &ReplayConfig) -> Self {
        Self {
            lag_threshold: config.lag_threshold,
            stability_window: config.stability_window,
            hard_cutoff: config.hard_cutoff,
            poll_interval: config.poll_interval,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayDecision {
    /// Poll again after the delay.
    Continue { retry_after: Duration },
    Cutover(ReplayOutcome),
}

/// `{queue}.ms2m.{migration}`.
pub fn secondary_queue_name(queue: &str, migration: &str) -> String {
    format!("{queue}.ms2m.{migration}")
}

#[derive(Clone)]
pub struct ReplayCoordinator {
    connector: Arc<dyn BrokerConnector>,
    policy: ReplayPolicy,
}

impl std::fmt::Debug for ReplayCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayCoordinator")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ReplayCoordinator {
    pub fn new(connector: Arc<dyn BrokerConnector>, policy: ReplayPolicy) -> Self {
        Self { connector, policy }
    }

    pub fn policy(&self) -> &ReplayPolicy {
        &self.policy
    }

    fn admin(&self, mq: &MessageQueueConfig) -> Result<Arc<dyn QueueAdmin>> {
        if mq.queue_name.is_empty() {
            return Err(ReplayError::InvalidConfig("queueName is empty".into()));
        }
        self.connector.connect(mq)
    }

    /// Declare and bind the secondary queue. Safe to repeat.
    pub async fn prepare(&self, mq: &MessageQueueConfig, migration: &str) -> Result<String> {
        let admin = self.admin(mq)?;
        let queue = secondary_queue_name(&mq.queue_name, migration);
        admin.declare_queue(&queue, SECONDARY_QUEUE_EXPIRY).await?;
        if mq.exchange_name.is_empty() {
            debug!(%queue, "no exchange configured, secondary queue left unbound");
        } else {
            admin
                .bind_queue(&queue, &mq.exchange_name, &mq.routing_key)
                .await?;
        }
        info!(%queue, exchange = %mq.exchange_name, routing_key = %mq.routing_key, "replay queue prepared");
        Ok(queue)
    }

    /// Take one lag sample and decide. `progress` is only meaningful to the
    /// caller when this returns `Ok`.
    pub async fn evaluate(
        &self,
        mq: &MessageQueueConfig,
        migration: &str,
        progress: &mut ReplayProgress,
        now: DateTime<Utc>,
    ) -> Result<ReplayDecision> {
        if let Some(outcome) = &progress.outcome {
            return Ok(ReplayDecision::Cutover(outcome.clone()));
        }
        let elapsed = (now - progress.started_at).to_std().unwrap_or_default();
        let past_cutoff = elapsed >= self.policy.hard_cutoff;
        let queue = secondary_queue_name(&mq.queue_name, migration);

        let mut published_now = false;
        let sampled = async {
            let admin = self.admin(mq)?;
            if !progress.control_sent {
                admin
                    .publish_control(&queue, ControlSignal::StartReplay, migration)
                    .await?;
                progress.control_sent = true;
                published_now = true;
            }
            admin.queue_depth(&queue).await
        }
        .await;

        let depth = match sampled {
            Ok(depth) => depth,
            Err(err) if past_cutoff => {
                warn!(%queue, error = %err, "lag poll failed after hard cutoff, cutting over");
                return Ok(self.degrade(progress, elapsed));
            }
            // The signal went out; the caller must persist that before retrying.
            Err(err) if published_now => {
                warn!(%queue, error = %err, "lag poll failed after START_REPLAY, retrying");
                return Ok(ReplayDecision::Continue {
                    retry_after: self.policy.poll_interval,
                });
            }
            Err(err) => return Err(err),
        };

        progress.polls += 1;
        progress.last_lag = Some(depth.messages);
        debug!(%queue, lag = depth.messages, consumers = depth.consumers, polls = progress.polls, "replay lag sampled");

        if depth.messages <= self.policy.lag_threshold {
            let since = *progress.below_threshold_since.get_or_insert(now);
            let stable_for = (now - since).to_std().unwrap_or_default();
            if stable_for >= self.policy.stability_window {
                info!(%queue, lag = depth.messages, elapsed_ms = elapsed.as_millis() as u64, "replay converged");
                progress.outcome = Some(ReplayOutcome::Converged);
                return Ok(ReplayDecision::Cutover(ReplayOutcome::Converged));
            }
        } else {
            progress.below_threshold_since = None;
        }

        if past_cutoff {
            return Ok(self.degrade(progress, elapsed));
        }
        Ok(ReplayDecision::Continue {
            retry_after: self.policy.poll_interval,
        })
    }

    fn degrade(&self, progress: &mut ReplayProgress, elapsed: Duration) -> ReplayDecision {
        let outcome = ReplayOutcome::Degraded {
            last_lag: progress.last_lag,
        };
        warn!(
            last_lag = ?progress.last_lag,
            elapsed_ms = elapsed.as_millis() as u64,
            cutoff_ms = self.policy.hard_cutoff.as_millis() as u64,
            "replay hit hard cutoff without converging"
        );
        progress.outcome = Some(outcome.clone());
        ReplayDecision::Cutover(outcome)
    }

    /// Mark the end of the window and drop the secondary queue when it is
    /// empty. A queue that still holds messages is left to expire.
    pub async fn finish(&self, mq: &MessageQueueConfig, migration: &str) -> Result<()> {
        let admin = self.admin(mq)?;
        let queue = secondary_queue_name(&mq.queue_name, migration);
        match admin
            .publish_control(&queue, ControlSignal::EndReplay, migration)
            .await
        {
            Ok(()) => {}
            Err(ReplayError::QueueMissing(_)) => {
                debug!(%queue, "secondary queue already gone");
                return Ok(());
            }
            Err(err) => return Err(err),
        }
        if admin.delete_queue(&queue, true).await? {
            info!(%queue, "replay queue removed");
        } else {
            info!(%queue, expiry_s = SECONDARY_QUEUE_EXPIRY.as_secs(), "replay queue not empty, left to expire");
        }
        Ok(())
    }
}
