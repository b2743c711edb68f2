//! ---
//! ms2m_section: "02-data-model"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "StatefulMigration resource, spec, and status records."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use ms2m_common::format_duration;
use serde::{Deserialize, Serialize};

use crate::phase::Phase;

pub const API_GROUP: &str = "migration.vibe.io";
pub const API_VERSION: &str = "v1alpha1";
pub const KIND: &str = "StatefulMigration";
pub const PLURAL: &str = "statefulmigrations";

/// Namespaced identity of a migration record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MigrationKey {
    pub namespace: String,
    pub name: String,
}

impl MigrationKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for MigrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    /// Opaque optimistic-concurrency token assigned by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// The persisted migration resource: immutable request plus mutable status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatefulMigration {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: StatefulMigrationSpec,
    #[serde(default)]
    pub status: StatefulMigrationStatus,
}

fn default_api_version() -> String {
    format!("{API_GROUP}/{API_VERSION}")
}

fn default_kind() -> String {
    KIND.to_owned()
}

impl StatefulMigration {
    pub fn new(key: &MigrationKey, spec: StatefulMigrationSpec) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta {
                name: key.name.clone(),
                namespace: key.namespace.clone(),
                ..ObjectMeta::default()
            },
            spec,
            status: StatefulMigrationStatus::default(),
        }
    }

    pub fn key(&self) -> MigrationKey {
        MigrationKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    /// Namespace of the source workload; defaults to the record's namespace.
    pub fn source_namespace(&self) -> &str {
        if self.spec.namespace.is_empty() {
            &self.metadata.namespace
        } else {
            &self.spec.namespace
        }
    }
}

/// Immutable migration request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatefulMigrationSpec {
    pub source_pod: String,
    /// Node hosting the source; resolved from the pod when empty.
    #[serde(default)]
    pub source_node: String,
    #[serde(default)]
    pub namespace: String,
    /// Container to checkpoint; the pod's first container when empty.
    #[serde(default)]
    pub container_name: String,
    pub target_node: String,
    #[serde(default)]
    pub migration_strategy: MigrationStrategy,
    #[serde(default)]
    pub message_queue_config: MessageQueueConfig,
}

/// Strategy selector. The empty string requests auto-detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MigrationStrategy {
    #[default]
    #[serde(rename = "")]
    Auto,
    /// Target runs alongside the source until cutover.
    ShadowPod,
    /// Source is retired before the target starts and the identity is reused.
    Sequential,
}

impl MigrationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStrategy::Auto => "",
            MigrationStrategy::ShadowPod => "ShadowPod",
            MigrationStrategy::Sequential => "Sequential",
        }
    }
}

impl fmt::Display for MigrationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationStrategy::Auto => f.write_str("auto"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Broker coordinates used for the replay window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageQueueConfig {
    pub queue_name: String,
    #[serde(rename = "brokerURL")]
    pub broker_url: String,
    #[serde(default)]
    pub exchange_name: String,
    #[serde(default)]
    pub routing_key: String,
}

/// Mutable migration state written exclusively by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatefulMigrationStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(rename = "checkpointID", default, skip_serializing_if = "String::is_empty")]
    pub checkpoint_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_pod: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub phase_timings: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_strategy: Option<MigrationStrategy>,
    /// Source node and container after defaults were resolved in Pending.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_node: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checkpoint_image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay: Option<ReplayProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Raised when a status mutation would break the phase lattice.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal phase transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: Phase,
    pub to: Phase,
}

impl StatefulMigrationStatus {
    /// Move to `to`, recording the exited phase's duration and stamping the
    /// start time on the Pending -> Checkpointing edge.
    pub fn transition(&mut self, to: Phase, now: DateTime<Utc>) -> Result<(), IllegalTransition> {
        let from = self.phase;
        if !from.can_transition_to(to) {
            return Err(IllegalTransition { from, to });
        }
        if from != Phase::Initial {
            let elapsed = self
                .phase_started_at
                .map(|started| (now - started).to_std().unwrap_or_default())
                .unwrap_or_default();
            self.record_phase_timing(from, elapsed);
        }
        if from == Phase::Pending && to == Phase::Checkpointing && self.start_time.is_none() {
            self.start_time = Some(now);
        }
        self.phase = to;
        self.phase_started_at = Some(now);
        Ok(())
    }

    /// Terminal failure carrying a diagnostic reason.
    pub fn fail(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), IllegalTransition> {
        self.transition(Phase::Failed, now)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Append-only: a phase keeps the first duration ever recorded for it.
    pub fn record_phase_timing(&mut self, phase: Phase, elapsed: std::time::Duration) {
        self.phase_timings
            .entry(phase.as_str().to_owned())
            .or_insert_with(|| format_duration(elapsed));
    }

    /// Whether replay ended at the hard cutoff instead of converging.
    pub fn replay_degraded(&self) -> bool {
        matches!(
            self.replay.as_ref().and_then(|r| r.outcome.as_ref()),
            Some(ReplayOutcome::Degraded { .. })
        )
    }
}

/// Bookkeeping for the replay window, persisted between polls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayProgress {
    pub started_at: DateTime<Utc>,
    /// Whether the start-of-replay control signal has been published.
    #[serde(default)]
    pub control_sent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub below_threshold_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_lag: Option<u64>,
    #[serde(default)]
    pub polls: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ReplayOutcome>,
}

impl ReplayProgress {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            control_sent: false,
            below_threshold_since: None,
            last_lag: None,
            polls: 0,
            outcome: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum ReplayOutcome {
    /// Lag stayed below the threshold for the stability window.
    Converged,
    /// Hard cutoff elapsed first; cutover proceeded anyway.
    Degraded {
        #[serde(rename = "lastLag", default, skip_serializing_if = "Option::is_none")]
        last_lag: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    #[test]
    fn strategy_accepts_known_values_and_empty_auto() {
        for (raw, expected) in [
            ("\"ShadowPod\"", MigrationStrategy::ShadowPod),
            ("\"Sequential\"", MigrationStrategy::Sequential),
            ("\"\"", MigrationStrategy::Auto),
        ] {
            let parsed: MigrationStrategy = serde_json::from_str(raw).unwrap();
            assert_eq!(parsed, expected);
        }
        assert!(serde_json::from_str::<MigrationStrategy>("\"Teleport\"").is_err());
    }

    #[test]
    fn message_queue_config_uses_wire_names() {
        let raw = r#"{
            "queueName": "orders-queue",
            "brokerURL": "amqp://localhost:5672",
            "exchangeName": "orders-exchange",
            "routingKey": "orders.new"
        }"#;
        let mq: MessageQueueConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(mq.exchange_name, "orders-exchange");
        assert_eq!(mq.routing_key, "orders.new");
        assert_eq!(mq.broker_url, "amqp://localhost:5672");
    }

    #[test]
    fn status_serialises_with_persisted_field_names() {
        let mut status = StatefulMigrationStatus {
            phase: Phase::Transferring,
            checkpoint_id: "/var/lib/kubelet/checkpoints/a.tar".into(),
            start_time: Some(at(0)),
            ..Default::default()
        };
        status
            .phase_timings
            .insert("Checkpointing".into(), "12s".into());
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["phase"], "Transferring");
        assert_eq!(value["checkpointID"], "/var/lib/kubelet/checkpoints/a.tar");
        assert_eq!(value["phaseTimings"]["Checkpointing"], "12s");
        assert!(value.get("failureReason").is_none());

        let back: StatefulMigrationStatus = serde_json::from_value(value).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn transition_records_exit_timing_and_start_time_once() {
        let mut status = StatefulMigrationStatus::default();
        status.transition(Phase::Pending, at(0)).unwrap();
        assert!(status.phase_timings.is_empty(), "initial phase is not timed");
        assert!(status.start_time.is_none());

        status.transition(Phase::Checkpointing, at(2)).unwrap();
        assert_eq!(status.start_time, Some(at(2)));
        assert_eq!(status.phase_timings.get("Pending").map(String::as_str), Some("2s"));

        status.transition(Phase::Transferring, at(14)).unwrap();
        assert_eq!(status.start_time, Some(at(2)), "start time never moves");
        assert_eq!(
            status.phase_timings.get("Checkpointing").map(String::as_str),
            Some("12s")
        );
    }

    #[test]
    fn recorded_timings_are_never_overwritten() {
        let mut status = StatefulMigrationStatus::default();
        status.record_phase_timing(Phase::Checkpointing, Duration::from_secs(10));
        status.record_phase_timing(Phase::Checkpointing, Duration::from_secs(99));
        assert_eq!(status.phase_timings["Checkpointing"], "10s");
    }

    #[test]
    fn illegal_transitions_leave_status_untouched() {
        let mut status = StatefulMigrationStatus {
            phase: Phase::Restoring,
            phase_started_at: Some(at(0)),
            ..Default::default()
        };
        let before = status.clone();
        let err = status.transition(Phase::Checkpointing, at(5)).unwrap_err();
        assert_eq!(err.from, Phase::Restoring);
        assert_eq!(status, before);

        status.fail("boom", at(6)).unwrap();
        assert_eq!(status.phase, Phase::Failed);
        assert!(status.transition(Phase::Completed, at(7)).is_err());
        assert_eq!(status.failure_reason.as_deref(), Some("boom"));
    }

    #[test]
    fn clone_is_independent_of_original() {
        let mut original = StatefulMigrationStatus {
            phase: Phase::Pending,
            start_time: Some(at(0)),
            ..Default::default()
        };
        original.phase_timings.insert("Checkpointing".into(), "10s".into());
        original.phase_timings.insert("Transferring".into(), "30s".into());

        let mut copied = original.clone();
        assert_eq!(copied, original);

        copied.phase_timings.insert("Checkpointing".into(), "99s".into());
        copied.phase_timings.insert("NewPhase".into(), "5s".into());
        copied.start_time = Some(at(60));

        assert_eq!(original.phase_timings["Checkpointing"], "10s");
        assert!(!original.phase_timings.contains_key("NewPhase"));
        assert_eq!(original.start_time, Some(at(0)));
    }

    #[test]
    fn clone_of_empty_status_stays_empty() {
        let original = StatefulMigrationStatus::default();
        let copied = original.clone();
        assert!(copied.phase_timings.is_empty());
        assert!(copied.start_time.is_none());
    }

    #[test]
    fn degraded_outcome_round_trips_with_lag() {
        let progress = ReplayProgress {
            outcome: Some(ReplayOutcome::Degraded { last_lag: Some(42) }),
            ..ReplayProgress::new(at(0))
        };
        let value = serde_json::to_value(&progress).unwrap();
        assert_eq!(value["outcome"]["result"], "degraded");
        assert_eq!(value["outcome"]["lastLag"], 42);
        let status = StatefulMigrationStatus {
            replay: Some(progress),
            ..Default::default()
        };
        assert!(status.replay_degraded());
    }

    #[test]
    fn source_namespace_defaults_to_record_namespace() {
        let key = MigrationKey::new("default", "mig-1");
        let mut migration = StatefulMigration::new(
            &key,
            StatefulMigrationSpec {
                source_pod: "myapp-pod".into(),
                target_node: "worker-2".into(),
                ..Default::default()
            },
        );
        assert_eq!(migration.source_namespace(), "default");
        migration.spec.namespace = "apps".into();
        assert_eq!(migration.source_namespace(), "apps");
        assert_eq!(migration.key().to_string(), "default/mig-1");
        assert_eq!(migration.api_version, "migration.vibe.io/v1alpha1");
    }
}
