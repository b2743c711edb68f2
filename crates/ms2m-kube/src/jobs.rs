//! ---
//! ms2m_section: "08-control-plane"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Artifact shipper that runs checkpoint-transfer as a Job on the source node."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use ms2m_common::TransferConfig;
use ms2m_core::{
    ArtifactShipper, ClusterError, MigrationError, ShipmentRequest, ShipmentState,
};
use serde::de::IgnoredAny;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::client::ApiServerClient;

const JOB_PREFIX: &str = "ms2m-transfer-";
const MAX_NAME_LEN: usize = 63;
const TTL_AFTER_FINISHED_SECS: u32 = 600;
const MIGRATION_LABEL: &str = "migration.vibe.io/migration";

#[derive(Debug, Default, Deserialize)]
struct JobCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct JobStatus {
    #[serde(default)]
    succeeded: u32,
    #[serde(default)]
    failed: u32,
    #[serde(default)]
    conditions: Vec<JobCondition>,
}

#[derive(Debug, Default, Deserialize)]
struct JobView {
    #[serde(default)]
    status: JobStatus,
}

/// DNS-label safe Job name for a migration.
pub fn job_name(migration: &str) -> String {
    let mut name = format!("{JOB_PREFIX}{migration}");
    name.truncate(MAX_NAME_LEN);
    name.trim_end_matches(['-', '.']).to_owned()
}

#[derive(Debug, Clone)]
pub struct KubeJobShipper {
    api: ApiServerClient,
    image: String,
    checkpoint_dir: PathBuf,
    insecure_registry: bool,
    backoff_limit: u32,
    deadline: Duration,
}

impl KubeJobShipper {
    pub fn new(api: ApiServerClient, config: &TransferConfig) -> Self {
        Self {
            api,
            image: config.transfer_image.clone(),
            checkpoint_dir: config.checkpoint_dir.clone(),
            insecure_registry: config.insecure_registry,
            backoff_limit: config.job_backoff_limit,
            deadline: config.deadline,
        }
    }

    /// Host directory to mount: the configured checkpoint directory when it
    /// holds the archive, otherwise the archive's own parent.
    fn host_dir(&self, archive: &Path) -> PathBuf {
        if archive.starts_with(&self.checkpoint_dir) {
            return self.checkpoint_dir.clone();
        }
        archive
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.checkpoint_dir.clone())
    }

    pub fn manifest(&self, request: &ShipmentRequest) -> Value {
        let name = job_name(&request.migration.name);
        let host_dir = self.host_dir(Path::new(&request.archive));
        let host_dir = host_dir.display().to_string();
        let mut env = vec![json!({
            "name": "TRANSFER_DEADLINE",
            "value": self.deadline.as_secs().to_string(),
        })];
        if self.insecure_registry {
            env.push(json!({ "name": "INSECURE_REGISTRY", "value": "true" }));
        }
        let labels = json!({
            "app.kubernetes.io/managed-by": "ms2m-controller",
            MIGRATION_LABEL: request.migration.name,
        });
        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": name,
                "namespace": request.migration.namespace,
                "labels": labels,
            },
            "spec": {
                "backoffLimit": self.backoff_limit,
                "ttlSecondsAfterFinished": TTL_AFTER_FINISHED_SECS,
                "template": {
                    "metadata": { "labels": labels },
                    "spec": {
                        "nodeName": request.source_node,
                        "restartPolicy": "Never",
                        "containers": [{
                            "name": "transfer",
                            "image": self.image,
                            "args": [
                                request.archive,
                                request.destination.to_string(),
                                request.container,
                            ],
                            "env": env,
                            "volumeMounts": [{
                                "name": "checkpoints",
                                "mountPath": host_dir,
                                "readOnly": true,
                            }],
                        }],
                        "volumes": [{
                            "name": "checkpoints",
                            "hostPath": { "path": host_dir, "type": "Directory" },
                        }],
                    },
                },
            },
        })
    }

    fn state(&self, name: &str, job: &JobView) -> Result<ShipmentState, MigrationError> {
        if job.status.succeeded > 0 {
            return Ok(ShipmentState::Done);
        }
        if let Some(failed) = job
            .status
            .conditions
            .iter()
            .find(|condition| condition.kind == "Failed" && condition.status == "True")
        {
            return Err(MigrationError::ShipmentFailed(format!(
                "job {name}: {}: {}",
                failed.reason, failed.message
            )));
        }
        if job.status.failed > 0 {
            return Err(ClusterError::Unavailable(format!(
                "job {name} attempt failed ({} of {} allowed retries used)",
                job.status.failed, self.backoff_limit
            ))
            .into());
        }
        Ok(ShipmentState::InProgress)
    }
}

#[async_trait]
impl ArtifactShipper for KubeJobShipper {
    async fn ship(&self, request: &ShipmentRequest) -> Result<ShipmentState, MigrationError> {
        let namespace = &request.migration.namespace;
        let name = job_name(&request.migration.name);
        let path = format!("/apis/batch/v1/namespaces/{namespace}/jobs/{name}");
        let existing = self
            .api
            .get::<JobView>(&path, &[])
            .await
            .map_err(ClusterError::from)?;
        if let Some(job) = existing {
            let state = self.state(&name, &job)?;
            debug!(job = %name, ?state, "transfer job observed");
            return Ok(state);
        }

        let manifest = self.manifest(request);
        match self
            .api
            .post::<_, IgnoredAny>(&format!("/apis/batch/v1/namespaces/{namespace}/jobs"), &manifest)
            .await
        {
            Ok(_) => {
                info!(
                    migration = %request.migration,
                    job = %name,
                    node = %request.source_node,
                    destination = %request.destination,
                    "transfer job created"
                );
                Ok(ShipmentState::InProgress)
            }
            Err(err) if err.is_conflict() => Ok(ShipmentState::InProgress),
            Err(err) => Err(ClusterError::from(err).into()),
        }
    }
}
