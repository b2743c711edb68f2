//! ---
//! ms2m_section: "01-core-functionality"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Event loop driving reconciles from watch events and requeues."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
//! The controller runs one reconcile at a time. Triggers come from store
//! watch events, requeue timers and a periodic resync; duplicate triggers for
//! the same migration collapse into the earliest pending one.

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use ms2m_api::MigrationKey;
use ms2m_metrics::MigrationMetrics;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::time::delay_queue::{self, DelayQueue};
use tracing::{debug, info, warn};

use crate::backoff::{RetryBackoff, RetryPolicy};
use crate::error::Result;
use crate::orchestrator::Requeue;
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::store::WatchEventKind;

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub retry: RetryPolicy,
    pub resync_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(30)),
            resync_interval: Duration::from_secs(60),
        }
    }
}

/// Deduplicating timer queue keyed by migration.
#[derive(Default)]
struct WorkQueue {
    timers: DelayQueue<MigrationKey>,
    scheduled: HashMap<MigrationKey, delay_queue::Key>,
}

impl WorkQueue {
    /// Keep whichever deadline is earlier.
    fn schedule(&mut self, key: MigrationKey, delay: Duration) {
        let deadline = Instant::now() + delay;
        match self.scheduled.get(&key) {
            Some(existing) if self.timers.deadline(existing) <= deadline => {}
            Some(existing) => self.timers.reset_at(existing, deadline),
            None => {
                let handle = self.timers.insert_at(key.clone(), deadline);
                self.scheduled.insert(key, handle);
            }
        }
    }

    fn forget(&mut self, key: &MigrationKey) {
        if let Some(handle) = self.scheduled.remove(key) {
            self.timers.remove(&handle);
        }
    }

    fn len(&self) -> usize {
        self.scheduled.len()
    }
}

/// Per-record retry counts and the versions this controller wrote. Entries
/// live only while a record still has work ahead of it.
#[derive(Debug, Default)]
struct Ledger {
    attempts: HashMap<MigrationKey, u32>,
    own_writes: HashMap<MigrationKey, String>,
}

impl Ledger {
    fn succeeded(&mut self, key: &MigrationKey, report: &ReconcileReport) {
        self.attempts.remove(key);
        if report.requeue == Requeue::Never {
            self.own_writes.remove(key);
        } else if let Some(version) = &report.written_version {
            self.own_writes.insert(key.clone(), version.clone());
        }
    }

    /// Returns the attempt number of this failure.
    fn failed(&mut self, key: &MigrationKey) -> u32 {
        let attempt = self.attempts.entry(key.clone()).or_insert(0);
        *attempt += 1;
        *attempt
    }

    fn is_own_write(&self, key: &MigrationKey, version: &str) -> bool {
        self.own_writes.get(key).map(String::as_str) == Some(version)
    }

    fn forget(&mut self, key: &MigrationKey) {
        self.attempts.remove(key);
        self.own_writes.remove(key);
    }
}

pub struct Controller {
    reconciler: Reconciler,
    backoff: RetryBackoff,
    resync_interval: Duration,
    metrics: Option<MigrationMetrics>,
    queue: WorkQueue,
    ledger: Ledger,
}

impl Controller {
    pub fn new(
        reconciler: Reconciler,
        settings: ControllerSettings,
        metrics: Option<MigrationMetrics>,
    ) -> Self {
        Self {
            reconciler,
            backoff: RetryBackoff::new(settings.retry),
            resync_interval: settings.resync_interval,
            metrics,
            queue: WorkQueue::default(),
            ledger: Ledger::default(),
        }
    }

    /// Seed the retry jitter for deterministic testing.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.backoff = self.backoff.with_seed(seed);
        self
    }

    /// Run until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let store = self.reconciler.store().clone();
        let mut watch = store.watch();
        let mut resync = tokio::time::interval(self.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(resync_s = self.resync_interval.as_secs(), "migration controller started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = watch.recv() => match event {
                    Ok(event) => {
                        if event.kind == WatchEventKind::Deleted {
                            debug!(migration = %event.key, "record deleted");
                            self.queue.forget(&event.key);
                            self.ledger.forget(&event.key);
                            continue;
                        }
                        if self.ledger.is_own_write(&event.key, &event.resource_version) {
                            continue;
                        }
                        self.queue.schedule(event.key, Duration::ZERO);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "watch lagged, relisting");
                        self.relist().await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("watch closed, resubscribing");
                        tokio::time::sleep(self.backoff.policy().base_delay).await;
                        watch = store.watch();
                        self.relist().await;
                    }
                },
                Some(expired) = self.queue.timers.next() => {
                    let key = expired.into_inner();
                    self.queue.scheduled.remove(&key);
                    self.process(key, &cancel).await;
                }
                _ = resync.tick() => self.relist().await,
            }
        }
        info!(pending = self.queue.len(), "migration controller stopped");
        Ok(())
    }

    async fn relist(&mut self) {
        match self.reconciler.store().list().await {
            Ok(records) => {
                for record in records.iter().filter(|r| !r.status.phase.is_terminal()) {
                    self.queue.schedule(record.key(), Duration::ZERO);
                }
            }
            Err(err) => warn!(error = %err, "listing migrations failed"),
        }
    }

    async fn process(&mut self, key: MigrationKey, cancel: &CancellationToken) {
        match self.reconciler.reconcile(&key, cancel).await {
            Ok(report) => {
                self.ledger.succeeded(&key, &report);
                match report.requeue {
                    Requeue::Never => {}
                    Requeue::Immediately => self.queue.schedule(key, Duration::ZERO),
                    Requeue::After(delay) => self.queue.schedule(key, delay),
                }
            }
            Err(err) if err.is_cancelled() => {
                debug!(migration = %key, "reconcile cancelled");
            }
            Err(err) => {
                let attempt = self.ledger.failed(&key);
                let delay = self.backoff.delay(attempt);
                let class = err.class();
                if let Some(metrics) = &self.metrics {
                    metrics.record_reconcile_error(class.as_str());
                }
                warn!(
                    migration = %key,
                    attempt,
                    class = %class,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "reconcile failed, retrying"
                );
                self.queue.schedule(key, delay);
            }
        }
    }
}
