//! ---
//! ms2m_section: "04-artifact-transfer"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Streaming multipart upload to a node agent."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
//! Direct upload streams the raw checkpoint archive to the target node's
//! agent as `multipart/form-data`.
//!
//! A producer task writes the multipart framing and the archive into an
//! in-memory duplex pipe while reqwest drains the other end. The pipe is
//! bounded, so memory use stays constant whatever the archive size. The
//! producer reports failures through a oneshot channel that is checked
//! after the request finishes, and a producer failure outranks an HTTP
//! success.

use std::io;
use std::path::Path;
use ms2m_checkpoint::ArtifactError;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{Result, TransferError};
use crate::http_client;

const PIPE_CAPACITY: usize = 64 * 1024;
pub const CHECKPOINT_FIELD: &str = "checkpoint";
pub const CONTAINER_FIELD: &str = "containerName";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub status: u16,
    pub body: String,
    pub bytes_sent: u64,
}

#[derive(Debug, Clone)]
pub struct DirectUploader {
    client: Client,
}

impl DirectUploader {
    pub fn new(insecure: bool) -> Result<Self> {
        Ok(Self::with_client(http_client(insecure)?))
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    pub async fn upload(
        &self,
        url: &Url,
        archive: &Path,
        container_name: Option<&str>,
    ) -> Result<UploadReceipt> {
        let unreadable = |source| ArtifactError::ArchiveUnreadable {
            path: archive.to_path_buf(),
            source,
        };
        let mut file = tokio::fs::File::open(archive).await.map_err(unreadable)?;
        let archive_len = file.metadata().await.map_err(unreadable)?.len();

        let boundary = format!("ms2m-{}", Uuid::new_v4().simple());
        let file_name = archive
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("checkpoint.tar");
        let preamble = preamble(&boundary, file_name, container_name);
        let epilogue = format!("\r\n--{boundary}--\r\n");
        let content_length = preamble.len() as u64 + archive_len + epilogue.len() as u64;

        let (mut writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (err_tx, err_rx) = oneshot::channel::<io::Error>();
        let producer = tokio::spawn(async move {
            let produced = async {
                writer.write_all(preamble.as_bytes()).await?;
                let copied = tokio::io::copy(&mut file, &mut writer).await?;
                if copied != archive_len {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("archive changed during upload: expected {archive_len} bytes, read {copied}"),
                    ));
                }
                writer.write_all(epilogue.as_bytes()).await?;
                writer.shutdown().await
            }
            .await;
            if let Err(err) = produced {
                let _ = err_tx.send(err);
            }
        });

        debug!(%url, archive = %archive.display(), bytes = archive_len, "starting direct upload");
        let sent = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
            .header(CONTENT_LENGTH, content_length)
            .body(Body::wrap_stream(ReaderStream::new(reader)))
            .send()
            .await;
        let outcome = match sent {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                Ok((status, body))
            }
            Err(err) => Err(err),
        };

        if let Err(err) = producer.await {
            warn!(error = %err, "upload producer task did not complete");
        }
        let produced = err_rx.await.ok();

        let failed = |reason: String| TransferError::UploadFailed {
            url: url.to_string(),
            reason,
        };
        match (produced, outcome) {
            // A broken pipe only echoes the consumer side going away.
            (Some(err), Ok((status, body)))
                if err.kind() == io::ErrorKind::BrokenPipe && !status.is_success() =>
            {
                Err(rejected(status, body))
            }
            (Some(err), Err(send)) if err.kind() == io::ErrorKind::BrokenPipe => {
                Err(failed(send.to_string()))
            }
            (Some(err), _) => Err(TransferError::Io(err)),
            (None, Err(send)) => Err(failed(send.to_string())),
            (None, Ok((status, body))) if !status.is_success() => Err(rejected(status, body)),
            (None, Ok((status, body))) => {
                info!(%url, bytes = archive_len, "checkpoint uploaded");
                Ok(UploadReceipt {
                    status: status.as_u16(),
                    body,
                    bytes_sent: archive_len,
                })
            }
        }
    }
}

fn rejected(status: StatusCode, body: String) -> TransferError {
    TransferError::TransferRejected {
        status: status.as_u16(),
        body: body.trim().to_owned(),
    }
}

fn preamble(boundary: &str, file_name: &str, container_name: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(name) = container_name.filter(|name| !name.is_empty()) {
        out.push_str(&format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{CONTAINER_FIELD}\"\r\n\r\n{name}\r\n"
        ));
    }
    out.push_str(&format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"{CHECKPOINT_FIELD}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
        file_name.replace('"', "%22")
    ));
    out
}
