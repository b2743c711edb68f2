//! ---
//! ms2m_section: "01-core-functionality"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Versioned resource store abstraction and in-memory binding."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use ms2m_api::{MigrationKey, StatefulMigration, StatefulMigrationStatus};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

const WATCH_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Applied,
    Deleted,
}

/// Change notification. Receivers re-read the record; the event carries no
/// payload beyond the version that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: MigrationKey,
    pub resource_version: String,
    pub kind: WatchEventKind,
}

/// Watchable store holding migration records.
///
/// `update_status` is a compare-and-write on the record's resource version:
/// it fails with [`StoreError::Conflict`] when the stored version differs from
/// `expected_version`, and never merges.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, key: &MigrationKey) -> StoreResult<Option<StatefulMigration>>;

    async fn list(&self) -> StoreResult<Vec<StatefulMigration>>;

    /// Replace the status sub-document. Returns the stored record, including
    /// its new resource version.
    async fn update_status(
        &self,
        key: &MigrationKey,
        expected_version: &str,
        status: &StatefulMigrationStatus,
    ) -> StoreResult<StatefulMigration>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

/// Process-local store used by tests and single-binary embeddings.
#[derive(Debug)]
pub struct InMemoryStore {
    records: RwLock<BTreeMap<MigrationKey, StatefulMigration>>,
    version: AtomicU64,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            records: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            events,
        }
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn notify(&self, key: MigrationKey, resource_version: String, kind: WatchEventKind) {
        // No subscribers is fine.
        let _ = self.events.send(WatchEvent {
            key,
            resource_version,
            kind,
        });
    }

    /// Insert or replace a whole record, as an operator would.
    pub fn apply(&self, mut migration: StatefulMigration) -> StatefulMigration {
        let key = migration.key();
        let version = self.next_version();
        migration.metadata.resource_version = Some(version.clone());
        self.records.write().insert(key.clone(), migration.clone());
        debug!(migration = %key, version = %version, "record applied");
        self.notify(key, version, WatchEventKind::Applied);
        migration
    }

    pub fn delete(&self, key: &MigrationKey) -> Option<StatefulMigration> {
        let removed = self.records.write().remove(key);
        if removed.is_some() {
            let version = self.next_version();
            self.notify(key.clone(), version, WatchEventKind::Deleted);
        }
        removed
    }

    /// Synchronous read for assertions.
    pub fn snapshot(&self, key: &MigrationKey) -> Option<StatefulMigration> {
        self.records.read().get(key).cloned()
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get(&self, key: &MigrationKey) -> StoreResult<Option<StatefulMigration>> {
        Ok(self.snapshot(key))
    }

    async fn list(&self) -> StoreResult<Vec<StatefulMigration>> {
        Ok(self.records.read().values().cloned().collect())
    }

    async fn update_status(
        &self,
        key: &MigrationKey,
        expected_version: &str,
        status: &StatefulMigrationStatus,
    ) -> StoreResult<StatefulMigration> {
        let stored = {
            let mut records = self.records.write();
            let record = records
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            let actual = record.resource_version().unwrap_or_default();
            if actual != expected_version {
                return Err(StoreError::Conflict {
                    key: key.clone(),
                    expected: expected_version.to_owned(),
                    actual: actual.to_owned(),
                });
            }
            record.status = status.clone();
            record.metadata.resource_version = Some(self.next_version());
            record.clone()
        };
        let version = stored.resource_version().unwrap_or_default().to_owned();
        self.notify(key.clone(), version, WatchEventKind::Applied);
        Ok(stored)
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ms2m_api::{Phase, StatefulMigrationSpec};

    fn record(name: &str) -> StatefulMigration {
        StatefulMigration::new(
            &MigrationKey::new("default", name),
            StatefulMigrationSpec {
                source_pod: "app-0".into(),
                target_node: "worker-2".into(),
                ..StatefulMigrationSpec::default()
            },
        )
    }

    #[tokio::test]
    async fn update_requires_current_version() {
        let store = InMemoryStore::new();
        let stored = store.apply(record("m1"));
        let key = stored.key();
        let version = stored.resource_version().unwrap().to_owned();

        let mut status = stored.status.clone();
        status.phase = Phase::Pending;
        let updated = store.update_status(&key, &version, &status).await.unwrap();
        assert_ne!(updated.resource_version(), Some(version.as_str()));
        assert_eq!(updated.status.phase, Phase::Pending);

        let err = store
            .update_status(&key, &version, &status)
            .await
            .expect_err("stale version must conflict");
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn conflicting_write_leaves_record_untouched() {
        let store = InMemoryStore::new();
        let stored = store.apply(record("m2"));
        let key = stored.key();
        let mut status = stored.status.clone();
        status.failure_reason = Some("boom".into());
        let _ = store.update_status(&key, "stale", &status).await;
        assert_eq!(store.snapshot(&key).unwrap().status, stored.status);
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let store = InMemoryStore::new();
        let key = MigrationKey::new("default", "ghost");
        let err = store
            .update_status(&key, "1", &StatefulMigrationStatus::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watchers_see_applies_updates_and_deletes() {
        let store = InMemoryStore::new();
        let mut events = store.watch();
        let stored = store.apply(record("m3"));
        let key = stored.key();
        store
            .update_status(&key, stored.resource_version().unwrap(), &stored.status)
            .await
            .unwrap();
        store.delete(&key);

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        let third = events.recv().await.unwrap();
        assert_eq!(first.kind, WatchEventKind::Applied);
        assert_eq!(second.kind, WatchEventKind::Applied);
        assert_ne!(first.resource_version, second.resource_version);
        assert_eq!(third.kind, WatchEventKind::Deleted);
        assert_eq!(store.list().await.unwrap().len(), 0);
    }
}
