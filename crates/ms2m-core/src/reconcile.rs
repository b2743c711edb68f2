//! ---
//! ms2m_section: "01-core-functionality"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Single reconcile pass: read, step, conditional write."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::sync::Arc;

use ms2m_api::{MigrationKey, Phase, StatefulMigration, StatefulMigrationStatus};
use ms2m_metrics::MigrationMetrics;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{MigrationError, Result, StoreError};
use crate::orchestrator::{phase_label, MigrationOrchestrator, Requeue};
use crate::store::ResourceStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub requeue: Requeue,
    /// Resource version produced by this pass's own write, if any.
    pub written_version: Option<String>,
}

impl ReconcileReport {
    fn untouched(requeue: Requeue) -> Self {
        Self {
            requeue,
            written_version: None,
        }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn ResourceStore>,
    orchestrator: Arc<MigrationOrchestrator>,
    metrics: Option<MigrationMetrics>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        orchestrator: Arc<MigrationOrchestrator>,
        metrics: Option<MigrationMetrics>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    /// Read the record, run one step and write the status back if it changed.
    ///
    /// A version conflict abandons the pass and asks for an immediate retry
    /// from a fresh read. Cancellation never commits a write.
    pub async fn reconcile(
        &self,
        key: &MigrationKey,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport> {
        if let Some(metrics) = &self.metrics {
            metrics.inc_reconcile();
        }
        let Some(migration) = self.store.get(key).await? else {
            debug!(migration = %key, "record gone, nothing to do");
            return Ok(ReconcileReport::untouched(Requeue::Never));
        };
        if migration.status.phase.is_terminal() {
            return Ok(ReconcileReport::untouched(Requeue::Never));
        }

        let outcome = self.orchestrator.step(&migration, cancel).await?;
        if outcome.status == migration.status {
            return Ok(ReconcileReport::untouched(outcome.requeue));
        }
        if cancel.is_cancelled() {
            return Err(MigrationError::Cancelled.in_phase(migration.status.phase, key));
        }

        let version = migration.resource_version().ok_or_else(|| {
            StoreError::Invalid(format!("{key} has no resourceVersion"))
        })?;
        match self.store.update_status(key, version, &outcome.status).await {
            Ok(stored) => {
                self.observe(&migration, &outcome.status, outcome.failure.map(|c| c.as_str()));
                Ok(ReconcileReport {
                    requeue: outcome.requeue,
                    written_version: stored.metadata.resource_version,
                })
            }
            Err(StoreError::Conflict { expected, actual, .. }) => {
                info!(migration = %key, %expected, %actual, "status write conflicted, re-reading");
                Ok(ReconcileReport::untouched(Requeue::Immediately))
            }
            Err(err) => Err(MigrationError::from(err).in_phase(migration.status.phase, key)),
        }
    }

    fn observe(
        &self,
        before: &StatefulMigration,
        after: &StatefulMigrationStatus,
        failure: Option<&str>,
    ) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let from = before.status.phase;
        let to = after.phase;
        if from == to {
            return;
        }
        if from == Phase::Initial {
            metrics.inc_start();
        }
        let in_phase = match (before.status.phase_started_at, after.phase_started_at) {
            (Some(entered), Some(left)) => (left - entered).to_std().unwrap_or_default(),
            _ => Default::default(),
        };
        metrics.record_transition(phase_label(from), phase_label(to), in_phase);
        if let Some(class) = failure {
            metrics.record_failure(class);
        }
        if to == Phase::Finalizing && after.replay_degraded() {
            metrics.inc_degraded_cutover();
        }
    }
}
