//! ---
//! ms2m_section: "08-control-plane"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Pod and node inspection plus target pod lifecycle on the API server."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
//! Target pods are cloned from the source pod spec. Before a source is
//! deleted its manifest is parked in a ConfigMap so a sequential restore can
//! still build the replacement after the original object is gone.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ms2m_api::{MigrationKey, MigrationStrategy};
use ms2m_core::{
    ClusterError, ClusterInspector, NodeInfo, SourceInfo, TargetSpec, TargetState, WorkloadRuntime,
};
use serde::de::IgnoredAny;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::client::ApiServerClient;
use crate::error::KubeError;

/// Marks a pod as the restore target of the named migration.
pub const TARGET_LABEL: &str = "migration.vibe.io/target-of";
/// Set on a source pod once traffic has moved to the named target.
pub const CUTOVER_LABEL: &str = "migration.vibe.io/cutover-to";
/// Replica count a StatefulSet had before a migration scaled it down.
pub const SCALED_FROM_ANNOTATION: &str = "migration.vibe.io/scaled-from";
const SNAPSHOT_KEY: &str = "pod.json";

/// Container waiting reasons that will not resolve on their own.
const FATAL_WAITING_REASONS: [&str; 5] = [
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CreateContainerError",
    "CrashLoopBackOff",
];

/// Labels owned by workload controllers; copying them onto a target would
/// let the controller adopt or count it.
const CONTROLLER_LABELS: [&str; 3] = [
    "pod-template-hash",
    "controller-revision-hash",
    "statefulset.kubernetes.io/pod-name",
];

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OwnerReference {
    kind: String,
    name: String,
    #[serde(default)]
    controller: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct StatefulSetSpecView {
    #[serde(default)]
    replicas: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct StatefulSetView {
    #[serde(default)]
    spec: StatefulSetSpecView,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodMeta {
    #[serde(default)]
    owner_references: Vec<OwnerReference>,
}

#[derive(Debug, Default, Deserialize)]
struct NamedContainer {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodSpecView {
    #[serde(default)]
    node_name: String,
    #[serde(default)]
    containers: Vec<NamedContainer>,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatusView {
    #[serde(default)]
    phase: String,
}

#[derive(Debug, Default, Deserialize)]
struct PodView {
    #[serde(default)]
    metadata: PodMeta,
    #[serde(default)]
    spec: PodSpecView,
    #[serde(default)]
    status: PodStatusView,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Condition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

#[derive(Debug, Default, Deserialize)]
struct NodeAddress {
    #[serde(rename = "type")]
    kind: String,
    address: String,
}

#[derive(Debug, Default, Deserialize)]
struct NodeSpecView {
    #[serde(default)]
    unschedulable: bool,
}

#[derive(Debug, Default, Deserialize)]
struct NodeStatusView {
    #[serde(default)]
    conditions: Vec<Condition>,
    #[serde(default)]
    allocatable: BTreeMap<String, String>,
    #[serde(default)]
    addresses: Vec<NodeAddress>,
}

#[derive(Debug, Default, Deserialize)]
struct NodeView {
    #[serde(default)]
    spec: NodeSpecView,
    #[serde(default)]
    status: NodeStatusView,
}

#[derive(Debug, Default, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<IgnoredAny>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceSpecView {
    #[serde(default)]
    selector: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceView {
    #[serde(default)]
    spec: ServiceSpecView,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceList {
    #[serde(default)]
    items: Vec<ServiceView>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigMapView {
    #[serde(default)]
    data: BTreeMap<String, String>,
}

fn pods_path(namespace: &str) -> String {
    format!("/api/v1/namespaces/{namespace}/pods")
}

fn pod_path(namespace: &str, pod: &str) -> String {
    format!("/api/v1/namespaces/{namespace}/pods/{pod}")
}

fn statefulset_path(namespace: &str, name: &str) -> String {
    format!("/apis/apps/v1/namespaces/{namespace}/statefulsets/{name}")
}

/// Name of the StatefulSet that controls `pod`, if any.
fn owning_statefulset(pod: &Value) -> Option<String> {
    let meta: PodMeta = serde_json::from_value(pod.get("metadata")?.clone()).ok()?;
    meta.owner_references
        .into_iter()
        .find(|owner| owner.controller == Some(true) && owner.kind == "StatefulSet")
        .map(|owner| owner.name)
}

/// `consumer-2` in StatefulSet `consumer` is ordinal 2.
fn ordinal_of(pod: &str, statefulset: &str) -> Option<u32> {
    pod.strip_prefix(statefulset)?.strip_prefix('-')?.parse().ok()
}

fn snapshot_name(migration: &MigrationKey) -> String {
    format!("ms2m-{}-source", migration.name)
}

fn labels_of(pod: &Value) -> BTreeMap<String, String> {
    pod.pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(key, value)| value.as_str().map(|value| (key.clone(), value.to_owned())))
                .collect()
        })
        .unwrap_or_default()
}

fn is_target_of(pod: &Value, migration: &MigrationKey) -> bool {
    labels_of(pod).get(TARGET_LABEL).map(String::as_str) == Some(migration.name.as_str())
}

/// Map an observed target pod onto the orchestrator's view.
pub fn target_state(pod: &Value) -> TargetState {
    let phase = pod
        .pointer("/status/phase")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if phase == "Failed" {
        let reason = pod
            .pointer("/status/message")
            .or_else(|| pod.pointer("/status/reason"))
            .and_then(Value::as_str)
            .unwrap_or("pod failed");
        return TargetState::Failed(reason.to_owned());
    }
    let statuses = pod
        .pointer("/status/containerStatuses")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for status in statuses {
        let Some(waiting) = status.pointer("/state/waiting") else {
            continue;
        };
        let reason = waiting.get("reason").and_then(Value::as_str).unwrap_or_default();
        if FATAL_WAITING_REASONS.contains(&reason) {
            let message = waiting.get("message").and_then(Value::as_str).unwrap_or_default();
            return TargetState::Failed(if message.is_empty() {
                reason.to_owned()
            } else {
                format!("{reason}: {message}")
            });
        }
    }
    let ready = !statuses.is_empty()
        && statuses
            .iter()
            .all(|status| status.get("ready").and_then(Value::as_bool) == Some(true));
    if phase == "Running" && ready {
        TargetState::Running
    } else {
        TargetState::Pending
    }
}

/// Build the target pod manifest from the source manifest.
pub fn target_manifest(source: &Value, target: &TargetSpec) -> Result<Value, ClusterError> {
    let mut spec = source
        .get("spec")
        .cloned()
        .ok_or_else(|| ClusterError::Rejected(format!("source {} has no spec", target.source_pod)))?;
    let spec_map = spec
        .as_object_mut()
        .ok_or_else(|| ClusterError::Rejected(format!("source {} spec is not an object", target.source_pod)))?;

    spec_map.insert("nodeName".into(), json!(target.node));
    spec_map.remove("schedulerName");

    if let Some(volumes) = spec_map.get_mut("volumes").and_then(Value::as_array_mut) {
        volumes.retain(|volume| !is_service_account_volume(volume));
    }
    let mut restored = false;
    for key in ["initContainers", "containers"] {
        let Some(containers) = spec_map.get_mut(key).and_then(Value::as_array_mut) else {
            continue;
        };
        for container in containers.iter_mut() {
            if let Some(mounts) = container.get_mut("volumeMounts").and_then(Value::as_array_mut) {
                mounts.retain(|mount| !is_service_account_volume(mount));
            }
            if key == "containers"
                && container.get("name").and_then(Value::as_str) == Some(target.container.as_str())
            {
                container["image"] = json!(target.image);
                container["imagePullPolicy"] = json!("IfNotPresent");
                restored = true;
            }
        }
    }
    if !restored {
        return Err(ClusterError::Rejected(format!(
            "source {} has no container {:?}",
            target.source_pod, target.container
        )));
    }

    let mut labels: Map<String, Value> = labels_of(source)
        .into_iter()
        .filter(|(key, _)| !CONTROLLER_LABELS.contains(&key.as_str()))
        .map(|(key, value)| (key, Value::String(value)))
        .collect();
    labels.insert(TARGET_LABEL.into(), json!(target.migration.name));

    let mut annotations: Map<String, Value> = source
        .pointer("/metadata/annotations")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    annotations.insert("migration.vibe.io/source-pod".into(), json!(target.source_pod));
    annotations.insert("migration.vibe.io/strategy".into(), json!(target.strategy.as_str()));

    Ok(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": target.name,
            "namespace": target.namespace,
            "labels": labels,
            "annotations": annotations,
        },
        "spec": spec,
    }))
}

fn is_service_account_volume(entry: &Value) -> bool {
    entry
        .get("name")
        .and_then(Value::as_str)
        .is_some_and(|name| name.starts_with("kube-api-access"))
}

/// Cluster inspector and workload runtime over core/v1 objects.
#[derive(Debug, Clone)]
pub struct KubeCluster {
    api: ApiServerClient,
}

impl KubeCluster {
    pub fn new(api: ApiServerClient) -> Self {
        Self { api }
    }

    async fn pod(&self, namespace: &str, pod: &str) -> Result<Option<Value>, ClusterError> {
        Ok(self.api.get(&pod_path(namespace, pod), &[]).await?)
    }

    async fn park_source(
        &self,
        namespace: &str,
        migration: &MigrationKey,
        pod: &Value,
    ) -> Result<(), ClusterError> {
        let manifest = serde_json::to_string(pod)
            .map_err(|err| ClusterError::Rejected(format!("encoding source manifest: {err}")))?;
        let name = snapshot_name(migration);
        let body = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": { TARGET_LABEL: migration.name },
            },
            "data": { SNAPSHOT_KEY: manifest },
        });
        match self
            .api
            .post::<_, IgnoredAny>(&format!("/api/v1/namespaces/{namespace}/configmaps"), &body)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_conflict() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Scales the owning StatefulSet below `pod`'s ordinal so the pod is not
    /// recreated under its name once deleted. Only the highest ordinal can be
    /// released.
    async fn release_from_statefulset(
        &self,
        namespace: &str,
        pod: &str,
        statefulset: &str,
        migration: &MigrationKey,
    ) -> Result<(), ClusterError> {
        let path = statefulset_path(namespace, statefulset);
        let Some(view) = self.api.get::<StatefulSetView>(&path, &[]).await? else {
            return Ok(());
        };
        let replicas = view.spec.replicas.unwrap_or(1);
        let ordinal = ordinal_of(pod, statefulset).ok_or_else(|| {
            ClusterError::Rejected(format!(
                "pod {namespace}/{pod} is not named after StatefulSet {statefulset}"
            ))
        })?;
        if ordinal >= replicas {
            return Ok(());
        }
        if ordinal + 1 != replicas {
            return Err(ClusterError::Rejected(format!(
                "pod {namespace}/{pod} is ordinal {ordinal} of {replicas} in StatefulSet {statefulset}; only the highest ordinal can be released"
            )));
        }
        self.api
            .merge_patch(
                &path,
                &json!({
                    "metadata": { "annotations": { SCALED_FROM_ANNOTATION: replicas.to_string() } },
                    "spec": { "replicas": ordinal },
                }),
            )
            .await?;
        info!(%migration, %namespace, %statefulset, from = replicas, to = ordinal, "statefulset scaled down to release source");
        Ok(())
    }

    async fn parked_source(
        &self,
        namespace: &str,
        migration: &MigrationKey,
    ) -> Result<Option<Value>, ClusterError> {
        let path = format!("/api/v1/namespaces/{namespace}/configmaps/{}", snapshot_name(migration));
        let Some(config_map) = self.api.get::<ConfigMapView>(&path, &[]).await? else {
            return Ok(None);
        };
        let Some(raw) = config_map.data.get(SNAPSHOT_KEY) else {
            return Ok(None);
        };
        serde_json::from_str(raw)
            .map(Some)
            .map_err(|err| ClusterError::Rejected(format!("parked manifest {path}: {err}")))
    }

    async fn running_pods(&self, node: &str) -> Result<u32, KubeError> {
        let selector = format!("spec.nodeName={node},status.phase=Running");
        let list: PodList = self
            .api
            .get("/api/v1/pods", &[("fieldSelector", selector.as_str())])
            .await?
            .unwrap_or_default();
        Ok(u32::try_from(list.items.len()).unwrap_or(u32::MAX))
    }

    /// Selector keys of Services in `namespace` that select `labels`.
    async fn service_selector_keys(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, KubeError> {
        let services: ServiceList = self
            .api
            .get(&format!("/api/v1/namespaces/{namespace}/services"), &[])
            .await?
            .unwrap_or_default();
        let mut keys: Vec<String> = services
            .items
            .into_iter()
            .filter_map(|service| service.spec.selector)
            .filter(|selector| {
                !selector.is_empty()
                    && selector
                        .iter()
                        .all(|(key, value)| labels.get(key) == Some(value))
            })
            .flat_map(|selector| selector.into_keys())
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[async_trait]
impl ClusterInspector for KubeCluster {
    async fn source(&self, namespace: &str, pod: &str) -> Result<Option<SourceInfo>, ClusterError> {
        let Some(view) = self
            .api
            .get::<PodView>(&pod_path(namespace, pod), &[])
            .await?
        else {
            return Ok(None);
        };
        let owner = view
            .metadata
            .owner_references
            .into_iter()
            .find(|owner| owner.controller == Some(true));
        Ok(Some(SourceInfo {
            node: view.spec.node_name,
            running: view.status.phase == "Running",
            containers: view.spec.containers.into_iter().map(|c| c.name).collect(),
            owner_kind: owner.as_ref().map(|owner| owner.kind.clone()),
            owner_name: owner.map(|owner| owner.name),
        }))
    }

    async fn node(&self, name: &str) -> Result<Option<NodeInfo>, ClusterError> {
        let Some(view) = self
            .api
            .get::<NodeView>(&format!("/api/v1/nodes/{name}"), &[])
            .await?
        else {
            return Ok(None);
        };
        let ready = view
            .status
            .conditions
            .iter()
            .any(|condition| condition.kind == "Ready" && condition.status == "True");
        let pod_capacity = view
            .status
            .allocatable
            .get("pods")
            .and_then(|pods| pods.parse::<u32>().ok());
        let address = view
            .status
            .addresses
            .iter()
            .find(|address| address.kind == "InternalIP")
            .map(|address| address.address.clone());
        let pods_running = self.running_pods(name).await?;
        Ok(Some(NodeInfo {
            name: name.to_owned(),
            ready,
            schedulable: !view.spec.unschedulable,
            pod_capacity,
            pods_running,
            address,
        }))
    }
}

#[async_trait]
impl WorkloadRuntime for KubeCluster {
    async fn ensure_target(&self, target: &TargetSpec) -> Result<TargetState, ClusterError> {
        if let Some(existing) = self.pod(&target.namespace, &target.name).await? {
            if !is_target_of(&existing, &target.migration) {
                // A replacement the StatefulSet made before it saw the scale-down.
                if target.strategy == MigrationStrategy::Sequential
                    && owning_statefulset(&existing).is_some()
                {
                    debug!(pod = %target.name, "name still held by its StatefulSet");
                    return Ok(TargetState::Pending);
                }
                return Err(ClusterError::Rejected(format!(
                    "pod {}/{} exists and is not a target of {}",
                    target.namespace, target.name, target.migration
                )));
            }
            let state = target_state(&existing);
            debug!(pod = %target.name, ?state, "target pod observed");
            return Ok(state);
        }

        let template = match self.pod(&target.namespace, &target.source_pod).await? {
            Some(source) => source,
            None => self
                .parked_source(&target.namespace, &target.migration)
                .await?
                .ok_or_else(|| ClusterError::NotFound {
                    kind: "pod",
                    name: format!("{}/{}", target.namespace, target.source_pod),
                })?,
        };
        let manifest = target_manifest(&template, target)?;
        match self
            .api
            .post::<_, IgnoredAny>(&pods_path(&target.namespace), &manifest)
            .await
        {
            Ok(_) => {
                info!(
                    migration = %target.migration,
                    pod = %target.name,
                    node = %target.node,
                    image = %target.image,
                    "target pod created"
                );
                Ok(TargetState::Pending)
            }
            Err(err) if err.is_conflict() => Ok(TargetState::Pending),
            Err(err) => Err(err.into()),
        }
    }

    async fn switch_traffic(
        &self,
        namespace: &str,
        source_pod: &str,
        target_pod: &str,
    ) -> Result<(), ClusterError> {
        if source_pod == target_pod {
            return Ok(());
        }
        let Some(source) = self.pod(namespace, source_pod).await? else {
            return Ok(());
        };
        let labels = labels_of(&source);
        if labels.get(CUTOVER_LABEL).map(String::as_str) == Some(target_pod) {
            return Ok(());
        }
        let selected_by = self.service_selector_keys(namespace, &labels).await?;
        let mut patch = Map::new();
        for key in &selected_by {
            patch.insert(key.clone(), Value::Null);
        }
        patch.insert(CUTOVER_LABEL.into(), json!(target_pod));
        self.api
            .merge_patch(
                &pod_path(namespace, source_pod),
                &json!({ "metadata": { "labels": patch } }),
            )
            .await?;
        info!(
            %namespace,
            source = %source_pod,
            target = %target_pod,
            detached = selected_by.len(),
            "traffic switched to target"
        );
        Ok(())
    }

    async fn retire_source(
        &self,
        namespace: &str,
        pod: &str,
        migration: &MigrationKey,
    ) -> Result<bool, ClusterError> {
        let Some(source) = self.pod(namespace, pod).await? else {
            return Ok(true);
        };
        if is_target_of(&source, migration) {
            return Ok(true);
        }
        if source.pointer("/metadata/deletionTimestamp").is_some() {
            debug!(%namespace, %pod, "source pod still terminating");
            return Ok(false);
        }
        self.park_source(namespace, migration, &source).await?;
        if let Some(statefulset) = owning_statefulset(&source) {
            self.release_from_statefulset(namespace, pod, &statefulset, migration)
                .await?;
        }
        self.api.delete(&pod_path(namespace, pod)).await?;
        info!(%migration, %namespace, %pod, "source pod deleted");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_pod() -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "consumer-0",
                "namespace": "default",
                "uid": "a1",
                "labels": { "app": "consumer", "pod-template-hash": "7d9f" },
                "annotations": { "team": "payments" },
                "ownerReferences": [{ "kind": "ReplicaSet", "name": "consumer-7d9f", "controller": true }]
            },
            "spec": {
                "nodeName": "worker-1",
                "containers": [
                    {
                        "name": "consumer",
                        "image": "ghcr.io/acme/consumer:1.4",
                        "volumeMounts": [
                            { "name": "data", "mountPath": "/data" },
                            { "name": "kube-api-access-x2k", "mountPath": "/var/run/secrets/kubernetes.io/serviceaccount" }
                        ]
                    },
                    { "name": "sidecar", "image": "busybox" }
                ],
                "volumes": [
                    { "name": "data", "emptyDir": {} },
                    { "name": "kube-api-access-x2k", "projected": {} }
                ]
            },
            "status": { "phase": "Running" }
        })
    }

    fn target() -> TargetSpec {
        TargetSpec {
            migration: MigrationKey::new("default", "orders-move"),
            namespace: "default".into(),
            name: "consumer-0-shadow".into(),
            source_pod: "consumer-0".into(),
            node: "worker-2".into(),
            container: "consumer".into(),
            image: "localhost/checkpoint/consumer:latest".into(),
            strategy: MigrationStrategy::ShadowPod,
        }
    }

    #[test]
    fn target_manifest_rewrites_placement_and_image() {
        let manifest = target_manifest(&source_pod(), &target()).unwrap();
        assert_eq!(manifest["metadata"]["name"], "consumer-0-shadow");
        assert_eq!(manifest["metadata"]["labels"]["app"], "consumer");
        assert_eq!(manifest["metadata"]["labels"][TARGET_LABEL], "orders-move");
        assert!(manifest["metadata"]["labels"].get("pod-template-hash").is_none());
        assert!(manifest["metadata"].get("ownerReferences").is_none());
        assert!(manifest["metadata"].get("uid").is_none());
        assert_eq!(manifest["metadata"]["annotations"]["team"], "payments");
        assert_eq!(manifest["spec"]["nodeName"], "worker-2");
        let consumer = &manifest["spec"]["containers"][0];
        assert_eq!(consumer["image"], "localhost/checkpoint/consumer:latest");
        assert_eq!(consumer["imagePullPolicy"], "IfNotPresent");
        assert_eq!(consumer["volumeMounts"].as_array().unwrap().len(), 1);
        assert_eq!(manifest["spec"]["containers"][1]["image"], "busybox");
        assert_eq!(manifest["spec"]["volumes"].as_array().unwrap().len(), 1);
        assert!(manifest.get("status").is_none());
    }

    #[test]
    fn target_manifest_requires_the_checkpointed_container() {
        let mut spec = target();
        spec.container = "missing".into();
        assert!(matches!(
            target_manifest(&source_pod(), &spec),
            Err(ClusterError::Rejected(_))
        ));
    }

    #[test]
    fn target_state_reads_readiness_and_fatal_waits() {
        let running = json!({ "status": { "phase": "Running", "containerStatuses": [{ "ready": true }] } });
        assert_eq!(target_state(&running), TargetState::Running);

        let starting = json!({ "status": { "phase": "Running", "containerStatuses": [{ "ready": false }] } });
        assert_eq!(target_state(&starting), TargetState::Pending);

        let scheduled = json!({ "status": { "phase": "Pending" } });
        assert_eq!(target_state(&scheduled), TargetState::Pending);

        let pulling = json!({ "status": { "phase": "Pending", "containerStatuses": [{
            "ready": false,
            "state": { "waiting": { "reason": "ImagePullBackOff", "message": "not found" } }
        }] } });
        assert_eq!(
            target_state(&pulling),
            TargetState::Failed("ImagePullBackOff: not found".into())
        );

        let failed = json!({ "status": { "phase": "Failed", "reason": "Evicted" } });
        assert_eq!(target_state(&failed), TargetState::Failed("Evicted".into()));
    }

    #[test]
    fn statefulset_owner_and_ordinal_are_read_from_the_pod() {
        assert_eq!(owning_statefulset(&source_pod()), None);
        let owned = json!({ "metadata": { "ownerReferences": [
            { "kind": "StatefulSet", "name": "consumer", "controller": true }
        ] } });
        assert_eq!(owning_statefulset(&owned).as_deref(), Some("consumer"));
        assert_eq!(ordinal_of("consumer-2", "consumer"), Some(2));
        assert_eq!(ordinal_of("consumer-db-0", "consumer"), None);
        assert_eq!(ordinal_of("consumer", "consumer"), None);
    }
}
