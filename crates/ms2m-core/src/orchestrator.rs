//! ---
//! ms2m_section: "01-core-functionality"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Migration phase state machine executing one phase per step."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
//! The orchestrator is a function from the persisted record to the next
//! status plus a scheduling directive. It never writes to the store itself.
//!
//! Each handler checks for work already done before acting, because the same
//! step can run more than once for one transition.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ms2m_api::{MigrationStrategy, Phase, ReplayProgress, StatefulMigration, StatefulMigrationStatus};
use ms2m_checkpoint::checkpoint_image_tag;
use ms2m_common::{OrCancelExt, OrchestratorConfig, TransferConfig, TransferMode};
use ms2m_replay::{ReplayCoordinator, ReplayDecision};
use ms2m_transport::Destination;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::collaborators::{
    ArtifactShipper, CheckpointApi, ClusterInspector, ShipmentRequest, ShipmentState,
    TargetSpec, TargetState, WorkloadRuntime,
};
use crate::error::{ErrorClass, MigrationError, Result};

const STATEFULSET_KIND: &str = "StatefulSet";

/// What the caller should do after applying a step's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    Never,
    Immediately,
    After(Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub status: StatefulMigrationStatus,
    pub requeue: Requeue,
    /// Set when this step moved the migration to `Failed`.
    pub failure: Option<ErrorClass>,
}

impl StepOutcome {
    fn idle(status: StatefulMigrationStatus) -> Self {
        Self {
            status,
            requeue: Requeue::Never,
            failure: None,
        }
    }
}

/// External capabilities the state machine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub checkpoint: Arc<dyn CheckpointApi>,
    pub inspector: Arc<dyn ClusterInspector>,
    pub runtime: Arc<dyn WorkloadRuntime>,
    pub shipper: Arc<dyn ArtifactShipper>,
    pub replay: ReplayCoordinator,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct MigrationOrchestrator {
    deps: Collaborators,
    requeue_delay: Duration,
    target_suffix: String,
    transfer: TransferConfig,
}

impl std::fmt::Debug for MigrationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationOrchestrator")
            .field("requeue_delay", &self.requeue_delay)
            .field("target_suffix", &self.target_suffix)
            .field("transfer_mode", &self.transfer.mode)
            .finish_non_exhaustive()
    }
}

impl MigrationOrchestrator {
    pub fn new(
        deps: Collaborators,
        orchestrator: &OrchestratorConfig,
        transfer: &TransferConfig,
    ) -> Self {
        Self {
            deps,
            requeue_delay: orchestrator.requeue_delay,
            target_suffix: orchestrator.target_suffix.clone(),
            transfer: transfer.clone(),
        }
    }

    /// Run the current phase's work once.
    ///
    /// Returns `Err` only for transient failures and cancellation, in which
    /// case the persisted status must stay as it was. Terminal failures come
    /// back as `Ok` with the status moved to `Failed`.
    pub async fn step(
        &self,
        migration: &StatefulMigration,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        let phase = migration.status.phase;
        if phase.is_terminal() {
            return Ok(StepOutcome::idle(migration.status.clone()));
        }
        let key = migration.key();
        let mut status = migration.status.clone();

        let result = match self
            .run_phase(migration, &mut status)
            .or_cancel(cancel)
            .await
        {
            Ok(result) => result,
            Err(cancelled) => return Err(MigrationError::from(cancelled).in_phase(phase, &key)),
        };

        match result {
            Ok(requeue) => {
                if status.phase != phase {
                    info!(migration = %key, from = %phase, to = %status.phase, "phase advanced");
                }
                Ok(StepOutcome {
                    status,
                    requeue,
                    failure: None,
                })
            }
            Err(err) => {
                let err = err.in_phase(phase, &key);
                let class = err.class();
                if !class.is_terminal() {
                    debug!(migration = %key, %phase, error = %err, "transient failure, phase kept");
                    return Err(err);
                }
                warn!(migration = %key, %phase, class = %class, error = %err, "migration failed");
                status.fail(format!("{class}: {err}"), self.deps.clock.now())?;
                Ok(StepOutcome {
                    status,
                    requeue: Requeue::Never,
                    failure: Some(class),
                })
            }
        }
    }

    async fn run_phase(
        &self,
        migration: &StatefulMigration,
        status: &mut StatefulMigrationStatus,
    ) -> Result<Requeue> {
        match status.phase {
            Phase::Initial => {
                status.transition(Phase::Pending, self.now())?;
                Ok(Requeue::Immediately)
            }
            Phase::Pending => self.validate(migration, status).await,
            Phase::Checkpointing => self.checkpoint(migration, status).await,
            Phase::Transferring => self.transfer(migration, status).await,
            Phase::Restoring => self.restore(migration, status).await,
            Phase::Replaying => self.replay(migration, status).await,
            Phase::Finalizing => self.finalize(migration, status).await,
            Phase::Completed | Phase::Failed => Ok(Requeue::Never),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.deps.clock.now()
    }

    async fn validate(
        &self,
        migration: &StatefulMigration,
        status: &mut StatefulMigrationStatus,
    ) -> Result<Requeue> {
        let spec = &migration.spec;
        let mq = &spec.message_queue_config;
        for (field, value) in [
            ("sourcePod", spec.source_pod.as_str()),
            ("targetNode", spec.target_node.as_str()),
            ("messageQueueConfig.queueName", mq.queue_name.as_str()),
            ("messageQueueConfig.brokerURL", mq.broker_url.as_str()),
        ] {
            if value.trim().is_empty() {
                return Err(MigrationError::Validation(format!("{field} must be set")));
            }
        }

        let namespace = migration.source_namespace();
        let source = self
            .deps
            .inspector
            .source(namespace, &spec.source_pod)
            .await?
            .ok_or_else(|| {
                MigrationError::Validation(format!(
                    "source pod {namespace}/{} not found",
                    spec.source_pod
                ))
            })?;
        if !source.running {
            return Err(MigrationError::Validation(format!(
                "source pod {namespace}/{} is not running",
                spec.source_pod
            )));
        }
        if !spec.source_node.is_empty() && spec.source_node != source.node {
            return Err(MigrationError::Validation(format!(
                "source pod runs on {} but sourceNode is {}",
                source.node, spec.source_node
            )));
        }
        if source.node == spec.target_node {
            return Err(MigrationError::Validation(format!(
                "source and target node are both {}",
                spec.target_node
            )));
        }

        let container = if spec.container_name.is_empty() {
            source.containers.first().cloned().ok_or_else(|| {
                MigrationError::Validation(format!("source pod {} has no containers", spec.source_pod))
            })?
        } else if source.containers.iter().any(|c| c == &spec.container_name) {
            spec.container_name.clone()
        } else {
            return Err(MigrationError::Validation(format!(
                "container {} not found in pod {}",
                spec.container_name, spec.source_pod
            )));
        };

        let target = self
            .deps
            .inspector
            .node(&spec.target_node)
            .await?
            .ok_or_else(|| {
                MigrationError::Validation(format!("target node {} not found", spec.target_node))
            })?;
        if !target.ready || !target.schedulable {
            return Err(MigrationError::Validation(format!(
                "target node {} is not ready for scheduling (ready={}, schedulable={})",
                target.name, target.ready, target.schedulable
            )));
        }
        if !target.has_capacity() {
            return Err(MigrationError::Validation(format!(
                "target node {} has no pod capacity left",
                target.name
            )));
        }

        let strategy = match spec.migration_strategy {
            MigrationStrategy::Auto
                if source.owner_kind.as_deref() == Some(STATEFULSET_KIND) =>
            {
                MigrationStrategy::Sequential
            }
            MigrationStrategy::Auto => MigrationStrategy::ShadowPod,
            explicit => explicit,
        };
        debug!(
            migration = %migration.key(),
            source_node = %source.node,
            container = %container,
            strategy = %strategy,
            owner = source.owner_name.as_deref().unwrap_or(""),
            "request validated"
        );
        status.source_node = source.node;
        status.container_name = container;
        status.resolved_strategy = Some(strategy);
        status.transition(Phase::Checkpointing, self.now())?;
        Ok(Requeue::Immediately)
    }

    async fn checkpoint(
        &self,
        migration: &StatefulMigration,
        status: &mut StatefulMigrationStatus,
    ) -> Result<Requeue> {
        let key = migration.key();
        if status.checkpoint_id.is_empty() {
            let queue = self
                .deps
                .replay
                .prepare(&migration.spec.message_queue_config, &key.name)
                .await?;
            let items = self
                .deps
                .checkpoint
                .checkpoint(
                    &status.source_node,
                    migration.source_namespace(),
                    &migration.spec.source_pod,
                    &status.container_name,
                )
                .await?;
            if items.len() > 1 {
                debug!(migration = %key, count = items.len(), "multiple archives reported, using the first");
            }
            let archive = items
                .into_iter()
                .next()
                .ok_or(MigrationError::NoCheckpointArchive)?;
            info!(migration = %key, node = %status.source_node, archive = %archive, replay_queue = %queue, "checkpoint taken");
            status.checkpoint_id = archive;
        } else {
            debug!(migration = %key, checkpoint = %status.checkpoint_id, "checkpoint already recorded");
        }
        status.transition(Phase::Transferring, self.now())?;
        Ok(Requeue::Immediately)
    }

    async fn transfer(
        &self,
        migration: &StatefulMigration,
        status: &mut StatefulMigrationStatus,
    ) -> Result<Requeue> {
        let key = migration.key();
        let (destination, image) = self.destination(migration, &status.container_name).await?;
        status.checkpoint_image = image;
        let request = ShipmentRequest {
            migration: key.clone(),
            source_node: status.source_node.clone(),
            archive: status.checkpoint_id.clone(),
            destination,
            container: status.container_name.clone(),
        };
        match self.deps.shipper.ship(&request).await? {
            ShipmentState::Done => {
                info!(migration = %key, destination = %request.destination, image = %status.checkpoint_image, "checkpoint transferred");
                status.transition(Phase::Restoring, self.now())?;
                Ok(Requeue::Immediately)
            }
            ShipmentState::InProgress => {
                debug!(migration = %key, "shipment still running");
                Ok(Requeue::After(self.requeue_delay))
            }
        }
    }

    /// Destination for the artifact and the image reference the target
    /// restores from.
    async fn destination(
        &self,
        migration: &StatefulMigration,
        container: &str,
    ) -> Result<(Destination, String)> {
        match self.transfer.mode {
            TransferMode::Registry => {
                let prefix = self
                    .transfer
                    .registry
                    .as_deref()
                    .map(|prefix| prefix.trim().trim_end_matches('/'))
                    .filter(|prefix| !prefix.is_empty())
                    .ok_or_else(|| {
                        MigrationError::Validation("registry transfer without a registry".into())
                    })?;
                let image = format!("{prefix}/{container}:{}", migration.metadata.name);
                Ok((Destination::parse(&image)?, image))
            }
            TransferMode::Direct => {
                let target = &migration.spec.target_node;
                let address = self
                    .deps
                    .inspector
                    .node(target)
                    .await?
                    .and_then(|node| node.address)
                    .ok_or_else(|| {
                        MigrationError::Validation(format!("target node {target} has no address"))
                    })?;
                let host = if address.contains(':') {
                    format!("[{address}]")
                } else {
                    address
                };
                let url = format!(
                    "{}://{host}:{}/checkpoint",
                    self.transfer.agent_scheme, self.transfer.agent_port
                );
                Ok((Destination::parse(&url)?, checkpoint_image_tag(container)))
            }
        }
    }

    async fn restore(
        &self,
        migration: &StatefulMigration,
        status: &mut StatefulMigrationStatus,
    ) -> Result<Requeue> {
        let key = migration.key();
        let namespace = migration.source_namespace();
        let source_pod = &migration.spec.source_pod;
        let strategy = status
            .resolved_strategy
            .unwrap_or(MigrationStrategy::ShadowPod);
        let target_name = match strategy {
            MigrationStrategy::Sequential => source_pod.clone(),
            _ => format!("{source_pod}{}", self.target_suffix),
        };

        if strategy == MigrationStrategy::Sequential && status.target_pod.is_empty() {
            let gone = self
                .deps
                .runtime
                .retire_source(namespace, source_pod, &key)
                .await?;
            if !gone {
                debug!(migration = %key, pod = %source_pod, "waiting for source to terminate");
                return Ok(Requeue::After(self.requeue_delay));
            }
        }

        let spec = TargetSpec {
            migration: key.clone(),
            namespace: namespace.to_owned(),
            name: target_name.clone(),
            source_pod: source_pod.clone(),
            node: migration.spec.target_node.clone(),
            container: status.container_name.clone(),
            image: status.checkpoint_image.clone(),
            strategy,
        };
        let state = self.deps.runtime.ensure_target(&spec).await?;
        status.target_pod = target_name;
        match state {
            TargetState::Running => {
                info!(migration = %key, target = %status.target_pod, node = %spec.node, "target running");
                let now = self.now();
                status.replay = Some(ReplayProgress::new(now));
                status.transition(Phase::Replaying, now)?;
                Ok(Requeue::Immediately)
            }
            TargetState::Pending => Ok(Requeue::After(self.requeue_delay)),
            TargetState::Failed(reason) => Err(MigrationError::TargetFailed(format!(
                "{namespace}/{}: {reason}",
                status.target_pod
            ))),
        }
    }

    async fn replay(
        &self,
        migration: &StatefulMigration,
        status: &mut StatefulMigrationStatus,
    ) -> Result<Requeue> {
        let key = migration.key();
        let now = self.now();
        let mut progress = status
            .replay
            .clone()
            .unwrap_or_else(|| ReplayProgress::new(now));
        let decision = self
            .deps
            .replay
            .evaluate(&migration.spec.message_queue_config, &key.name, &mut progress, now)
            .await?;
        status.replay = Some(progress);
        match decision {
            ReplayDecision::Continue { retry_after } => Ok(Requeue::After(retry_after)),
            ReplayDecision::Cutover(outcome) => {
                info!(migration = %key, outcome = ?outcome, "cutover triggered");
                status.transition(Phase::Finalizing, now)?;
                Ok(Requeue::Immediately)
            }
        }
    }

    async fn finalize(
        &self,
        migration: &StatefulMigration,
        status: &mut StatefulMigrationStatus,
    ) -> Result<Requeue> {
        let key = migration.key();
        let namespace = migration.source_namespace();
        let source_pod = &migration.spec.source_pod;
        let runtime = &self.deps.runtime;

        runtime
            .switch_traffic(namespace, source_pod, &status.target_pod)
            .await?;
        self.deps
            .replay
            .finish(&migration.spec.message_queue_config, &key.name)
            .await?;
        if status.resolved_strategy != Some(MigrationStrategy::Sequential) {
            let gone = runtime.retire_source(namespace, source_pod, &key).await?;
            if !gone {
                debug!(migration = %key, pod = %source_pod, "waiting for source to terminate");
                return Ok(Requeue::After(self.requeue_delay));
            }
        }
        info!(
            migration = %key,
            target = %status.target_pod,
            degraded = status.replay_degraded(),
            "migration completed"
        );
        status.transition(Phase::Completed, self.now())?;
        Ok(Requeue::Never)
    }
}

/// Label used for metrics and logs; the initial phase has an empty wire name.
pub fn phase_label(phase: Phase) -> &'static str {
    match phase {
        Phase::Initial => "Initial",
        other => other.as_str(),
    }
}
