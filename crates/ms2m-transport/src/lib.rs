//! ---
//! ms2m_section: "04-artifact-transfer"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Checkpoint artifact transfer to target nodes."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
//! Moves a checkpoint to its target node, either by pushing an image to a
//! registry or by streaming the archive straight to the node agent.

pub mod credentials;
pub mod destination;
pub mod direct;
pub mod error;
pub mod registry;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use tracing::{info, warn};

pub use credentials::{Anonymous, Credential, CredentialProvider, DockerConfigKeychain, StaticCredentials};
pub use destination::{Destination, ImageReference};
pub use direct::{DirectUploader, UploadReceipt, CHECKPOINT_FIELD, CONTAINER_FIELD};
pub use error::{Result, TransferError};
pub use registry::RegistryPusher;

/// Summary of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub destination: String,
    pub bytes: u64,
    /// Manifest digest for registry pushes.
    pub digest: Option<String>,
    pub build_time: Duration,
    pub send_time: Duration,
}

/// Upper bound on one push or upload when none is configured.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(600);

pub(crate) fn http_client(insecure: bool) -> Result<Client> {
    Client::builder()
        .danger_accept_invalid_certs(insecure)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|err| TransferError::ClientSetup(err.to_string()))
}

/// Dispatches to the registry or direct strategy based on the destination.
#[derive(Debug, Clone)]
pub struct ArtifactTransfer {
    registry: RegistryPusher,
    direct: DirectUploader,
    deadline: Duration,
}

impl ArtifactTransfer {
    pub fn new(credentials: Arc<dyn CredentialProvider>, insecure: bool) -> Result<Self> {
        let client = http_client(insecure)?;
        Ok(Self {
            registry: RegistryPusher::with_client(client.clone(), credentials, insecure),
            direct: DirectUploader::with_client(client),
            deadline: DEFAULT_DEADLINE,
        })
    }

    /// Bounds each push or upload. The image build before a push is not
    /// counted.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Sends `archive` to `destination`. A send still running at the
    /// deadline is abandoned with a retryable error.
    pub async fn send(
        &self,
        archive: &Path,
        destination: &Destination,
        label: Option<&str>,
    ) -> Result<TransferReport> {
        let expired = |_: tokio::time::error::Elapsed| {
            warn!(%destination, deadline_ms = self.deadline.as_millis() as u64, "transfer deadline exceeded");
            let reason = format!("no completion within {:?}", self.deadline);
            match destination {
                Destination::Direct(url) => TransferError::UploadFailed {
                    url: url.to_string(),
                    reason,
                },
                Destination::Registry(reference) => TransferError::PushFailed {
                    reference: reference.to_string(),
                    reason,
                },
            }
        };
        match destination {
            Destination::Direct(url) => {
                let started = Instant::now();
                let receipt = tokio::time::timeout(self.deadline, self.direct.upload(url, archive, label))
                    .await
                    .map_err(expired)??;
                Ok(TransferReport {
                    destination: destination.to_string(),
                    bytes: receipt.bytes_sent,
                    digest: None,
                    build_time: Duration::ZERO,
                    send_time: started.elapsed(),
                })
            }
            Destination::Registry(reference) => {
                let build_started = Instant::now();
                let artifact = build_blocking(archive.to_path_buf(), label.map(str::to_owned)).await?;
                let build_time = build_started.elapsed();
                info!(archive = %archive.display(), elapsed_ms = build_time.as_millis() as u64, "checkpoint image built");

                let send_started = Instant::now();
                let digest = tokio::time::timeout(self.deadline, self.registry.push(&artifact, reference))
                    .await
                    .map_err(expired)??;
                Ok(TransferReport {
                    destination: destination.to_string(),
                    bytes: artifact.layer().size,
                    digest: Some(digest),
                    build_time,
                    send_time: send_started.elapsed(),
                })
            }
        }
    }
}

/// Hashing reads the whole archive, so keep it off the async workers.
async fn build_blocking(
    archive: PathBuf,
    label: Option<String>,
) -> Result<ms2m_checkpoint::ImageArtifact> {
    tokio::task::spawn_blocking(move || ms2m_checkpoint::build_artifact(&archive, label.as_deref()))
        .await
        .map_err(|err| TransferError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))?
        .map_err(TransferError::from)
}
