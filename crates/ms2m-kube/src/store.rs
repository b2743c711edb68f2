//! ---
//! ms2m_section: "08-control-plane"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "StatefulMigration store backed by the custom resource and its status subresource."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use ms2m_api::{MigrationKey, StatefulMigration, StatefulMigrationStatus, API_GROUP, API_VERSION, PLURAL};
use ms2m_core::{ResourceStore, StoreError, StoreResult, WatchEvent, WatchEventKind};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ApiServerClient;
use crate::error::{KubeError, Result};

const WATCH_CAPACITY: usize = 256;
const WATCH_RETRY: Duration = Duration::from_secs(2);

#[derive(Debug, Default, Deserialize)]
struct ListMeta {
    #[serde(default, rename = "resourceVersion")]
    resource_version: String,
}

#[derive(Debug, Default, Deserialize)]
struct MigrationList {
    #[serde(default)]
    metadata: ListMeta,
    #[serde(default)]
    items: Vec<StatefulMigration>,
}

#[derive(Debug, Deserialize)]
struct WatchLine {
    #[serde(rename = "type")]
    kind: String,
    object: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct WatchStatus {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

/// Decode one line of a watch stream. Bookmarks yield `None`; an `ERROR`
/// entry (typically 410 Gone) is returned as an error so the caller relists.
pub fn parse_watch_line(line: &[u8]) -> Result<Option<WatchEvent>> {
    let decode = |err: serde_json::Error| KubeError::Decode {
        what: "watch event".into(),
        reason: err.to_string(),
    };
    let line: WatchLine = serde_json::from_slice(line).map_err(decode)?;
    let kind = match line.kind.as_str() {
        "ADDED" | "MODIFIED" => WatchEventKind::Applied,
        "DELETED" => WatchEventKind::Deleted,
        "BOOKMARK" => return Ok(None),
        "ERROR" => {
            let status: WatchStatus = serde_json::from_value(line.object).unwrap_or_default();
            return Err(KubeError::Status {
                status: status.code,
                url: "watch".into(),
                message: status.message,
            });
        }
        other => {
            debug!(kind = other, "ignoring unknown watch event type");
            return Ok(None);
        }
    };
    let migration: StatefulMigration = serde_json::from_value(line.object).map_err(decode)?;
    Ok(Some(WatchEvent {
        key: migration.key(),
        resource_version: migration.resource_version().unwrap_or_default().to_owned(),
        kind,
    }))
}

#[derive(Debug)]
pub struct KubeMigrationStore {
    api: ApiServerClient,
    namespace: Option<String>,
    events: broadcast::Sender<WatchEvent>,
}

impl KubeMigrationStore {
    /// `namespace = None` watches every namespace.
    pub fn new(api: ApiServerClient, namespace: Option<String>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            api,
            namespace,
            events,
        }
    }

    fn collection_path(&self) -> String {
        match &self.namespace {
            Some(namespace) => {
                format!("/apis/{API_GROUP}/{API_VERSION}/namespaces/{namespace}/{PLURAL}")
            }
            None => format!("/apis/{API_GROUP}/{API_VERSION}/{PLURAL}"),
        }
    }

    fn object_path(key: &MigrationKey) -> String {
        format!(
            "/apis/{API_GROUP}/{API_VERSION}/namespaces/{}/{PLURAL}/{}",
            key.namespace, key.name
        )
    }

    fn store_error(key: &MigrationKey, err: KubeError) -> StoreError {
        match err {
            err if err.is_not_found() => StoreError::NotFound(key.clone()),
            err if err.is_transient() => StoreError::Unavailable(err.to_string()),
            err @ KubeError::Decode { .. } => StoreError::Invalid(err.to_string()),
            err @ KubeError::Status { .. } => StoreError::Invalid(err.to_string()),
            err => StoreError::Unavailable(err.to_string()),
        }
    }

    async fn list_raw(&self) -> Result<MigrationList> {
        Ok(self
            .api
            .get::<MigrationList>(&self.collection_path(), &[])
            .await?
            .unwrap_or_default())
    }

    /// Feed the broadcast channel from the API server until `cancel` fires.
    pub fn spawn_watch(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match store.watch_once(&cancel).await {
                    Ok(()) => debug!("watch stream ended, reconnecting"),
                    Err(err) => warn!(error = %err, "watch failed, relisting"),
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(WATCH_RETRY) => {}
                }
            }
            info!("migration watch stopped");
        })
    }

    async fn watch_once(&self, cancel: &CancellationToken) -> Result<()> {
        let list = self.list_raw().await?;
        for item in &list.items {
            self.publish(WatchEvent {
                key: item.key(),
                resource_version: item.resource_version().unwrap_or_default().to_owned(),
                kind: WatchEventKind::Applied,
            });
        }
        let version = list.metadata.resource_version;
        debug!(%version, items = list.items.len(), "listed migrations, opening watch");
        let response = self
            .api
            .stream(
                &self.collection_path(),
                &[
                    ("watch", "true"),
                    ("resourceVersion", version.as_str()),
                    ("allowWatchBookmarks", "true"),
                ],
            )
            .await?;
        let url = response.url().to_string();
        let mut body = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else {
                return Ok(());
            };
            let chunk = chunk.map_err(|err| KubeError::Transport {
                url: url.clone(),
                reason: err.to_string(),
            })?;
            buffer.extend_from_slice(&chunk);
            while let Some(end) = buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = buffer.drain(..=end).collect();
                let line = &line[..line.len() - 1];
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match parse_watch_line(line) {
                    Ok(Some(event)) => self.publish(event),
                    Ok(None) => {}
                    Err(err @ KubeError::Status { .. }) => return Err(err),
                    Err(err) => warn!(error = %err, "skipping undecodable watch event"),
                }
            }
        }
    }

    fn publish(&self, event: WatchEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl ResourceStore for KubeMigrationStore {
    async fn get(&self, key: &MigrationKey) -> StoreResult<Option<StatefulMigration>> {
        self.api
            .get(&Self::object_path(key), &[])
            .await
            .map_err(|err| Self::store_error(key, err))
    }

    async fn list(&self) -> StoreResult<Vec<StatefulMigration>> {
        self.list_raw()
            .await
            .map(|list| list.items)
            .map_err(|err| match err {
                err if err.is_transient() => StoreError::Unavailable(err.to_string()),
                err => StoreError::Invalid(err.to_string()),
            })
    }

    async fn update_status(
        &self,
        key: &MigrationKey,
        expected_version: &str,
        status: &StatefulMigrationStatus,
    ) -> StoreResult<StatefulMigration> {
        let path = Self::object_path(key);
        let mut current: StatefulMigration = self
            .api
            .get(&path, &[])
            .await
            .map_err(|err| Self::store_error(key, err))?
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let actual = current.resource_version().unwrap_or_default().to_owned();
        if actual != expected_version {
            return Err(StoreError::Conflict {
                key: key.clone(),
                expected: expected_version.to_owned(),
                actual,
            });
        }
        current.status = status.clone();
        self.api
            .put(&format!("{path}/status"), &current)
            .await
            .map_err(|err| {
                if err.is_conflict() {
                    StoreError::Conflict {
                        key: key.clone(),
                        expected: expected_version.to_owned(),
                        actual: "newer".into(),
                    }
                } else {
                    Self::store_error(key, err)
                }
            })
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
