//! ---
//! ms2m_section: "05-node-agent"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "HTTP upload endpoint for direct checkpoint transfer."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use ms2m_metrics::AgentMetrics;
use ms2m_transport::{CHECKPOINT_FIELD, CONTAINER_FIELD};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::node::{NodeLoader, ScratchArchive};

pub const SUCCESS_BODY: &str = "checkpoint loaded successfully";

struct AgentState {
    loader: NodeLoader,
    metrics: Option<AgentMetrics>,
}

/// Builder for the node agent's upload server.
pub struct AgentServerBuilder {
    listen: SocketAddr,
    loader: NodeLoader,
    max_upload_bytes: Option<usize>,
    metrics: Option<AgentMetrics>,
}

impl AgentServerBuilder {
    pub fn new(listen: SocketAddr, loader: NodeLoader) -> Self {
        Self {
            listen,
            loader,
            max_upload_bytes: None,
            metrics: None,
        }
    }

    /// Cap request bodies; uncapped when unset.
    pub fn with_max_upload_bytes(mut self, limit: usize) -> Self {
        self.max_upload_bytes = Some(limit);
        self
    }

    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn router(self) -> Router {
        let limit = match self.max_upload_bytes {
            Some(limit) => DefaultBodyLimit::max(limit),
            None => DefaultBodyLimit::disable(),
        };
        let state = Arc::new(AgentState {
            loader: self.loader,
            metrics: self.metrics,
        });
        Router::new()
            .route("/checkpoint", post(upload).fallback(method_not_allowed))
            .route("/", post(upload).fallback(method_not_allowed))
            .layer(limit)
            .with_state(state)
    }

    pub async fn spawn(self) -> anyhow::Result<AgentServerHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let address = listener.local_addr()?;
        info!(%address, storage = %self.loader.storage_dir().display(), "node agent listening");

        let router = self.router();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                warn!(error = %err, "node agent server exited with error");
            }
        });

        Ok(AgentServerHandle {
            address,
            task,
            shutdown: shutdown_tx,
        })
    }
}

pub struct AgentServerHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl AgentServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Wait until the server stops on its own.
    pub async fn wait(self) -> anyhow::Result<()> {
        self.task.await.map_err(|join| anyhow::anyhow!(join))
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await.map_err(|join| anyhow::anyhow!(join))
    }
}

async fn method_not_allowed() -> Response {
    (StatusCode::METHOD_NOT_ALLOWED, "method not allowed").into_response()
}

async fn upload(
    State(state): State<Arc<AgentState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let started = Instant::now();
    let (status, body, bytes) = match receive(&state, multipart).await {
        Ok((scratch, container, bytes)) => {
            info!(archive = %scratch.archive().display(), container = %container, bytes, "checkpoint received");
            match state.loader.materialize(scratch, &container).await {
                Ok(_) => (StatusCode::OK, SUCCESS_BODY.to_owned(), bytes),
                Err(err) => {
                    error!(error = %err, container = %container, "checkpoint load failed");
                    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), bytes)
                }
            }
        }
        Err((status, message)) => {
            warn!(%status, error = %message, "checkpoint upload rejected");
            (status, message, 0)
        }
    };

    if let Some(metrics) = &state.metrics {
        let result = if status.is_success() { "ok" } else { "error" };
        metrics.record_upload(result, bytes);
        if status.is_success() {
            metrics.observe_load(started.elapsed());
        }
    }
    (status, body).into_response()
}

type Rejection = (StatusCode, String);

/// Stream the form to disk. The archive is written chunk by chunk as it
/// arrives; the container name may precede or follow it.
async fn receive(
    state: &AgentState,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(ScratchArchive, String, u64), Rejection> {
    let bad_request = |what: &str, err: &dyn std::fmt::Display| {
        (StatusCode::BAD_REQUEST, format!("{what}: {err}"))
    };
    let internal = |what: &str, err: &dyn std::fmt::Display| {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{what}: {err}"))
    };

    let mut multipart = multipart.map_err(|err| bad_request("parse form", &err))?;
    let mut container = String::new();
    let mut archive = None;

    loop {
        let mut field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return Err(bad_request("parse form", &err)),
        };
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some(CHECKPOINT_FIELD) => {
                let (scratch, mut file) = state
                    .loader
                    .create_scratch()
                    .await
                    .map_err(|err| internal("create file", &err))?;
                let mut written = 0u64;
                loop {
                    match field.chunk().await {
                        Ok(Some(chunk)) => {
                            file.write_all(&chunk)
                                .await
                                .map_err(|err| internal("write file", &err))?;
                            written += chunk.len() as u64;
                        }
                        Ok(None) => break,
                        Err(err) => return Err(bad_request("read upload", &err)),
                    }
                }
                file.flush().await.map_err(|err| internal("write file", &err))?;
                archive = Some((scratch, written));
            }
            Some(CONTAINER_FIELD) => {
                container = field
                    .text()
                    .await
                    .map_err(|err| bad_request("read containerName", &err))?;
            }
            _ => {}
        }
    }

    let (scratch, written) = archive.ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            format!("get file: missing {CHECKPOINT_FIELD:?} field"),
        )
    })?;
    Ok((scratch, container, written))
}
