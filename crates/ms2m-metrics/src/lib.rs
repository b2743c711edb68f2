//! ---
//! ms2m_section: "07-observability"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Metrics collection and export utilities."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .context("failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .context("failed to read metrics listener address")?;
    let listener =
        TcpListener::from_std(std_listener).context("failed to adopt metrics listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error").into_response()
        }
    }
}

/// Handle to the running exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Controller-side migration metrics.
#[derive(Clone, Debug)]
pub struct MigrationMetrics {
    registry: SharedRegistry,
    migrations_started: IntCounter,
    reconciles_total: IntCounter,
    phase_transitions: IntCounterVec,
    phase_seconds: HistogramVec,
    failures: IntCounterVec,
    reconcile_errors: IntCounterVec,
    degraded_cutovers: IntCounter,
}

impl MigrationMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let migrations_started = IntCounter::with_opts(Opts::new(
            "ms2m_migrations_started_total",
            "Migrations picked up by the controller",
        ))?;
        registry.register(Box::new(migrations_started.clone()))?;

        let reconciles_total = IntCounter::with_opts(Opts::new(
            "ms2m_reconciles_total",
            "Reconcile steps executed",
        ))?;
        registry.register(Box::new(reconciles_total.clone()))?;

        let phase_transitions = IntCounterVec::new(
            Opts::new(
                "ms2m_phase_transitions_total",
                "Migration phase transitions by source and destination phase",
            ),
            &["from", "to"],
        )?;
        registry.register(Box::new(phase_transitions.clone()))?;

        let buckets = prometheus::exponential_buckets(0.05, 2.0, 14)
            .context("failed to construct histogram buckets")?;
        let phase_seconds = HistogramVec::new(
            HistogramOpts::new(
                "ms2m_phase_duration_seconds",
                "Time spent in each migration phase",
            )
            .buckets(buckets),
            &["phase"],
        )?;
        registry.register(Box::new(phase_seconds.clone()))?;

        let failures = IntCounterVec::new(
            Opts::new(
                "ms2m_migration_failures_total",
                "Migrations that ended in Failed, by error class",
            ),
            &["class"],
        )?;
        registry.register(Box::new(failures.clone()))?;

        let reconcile_errors = IntCounterVec::new(
            Opts::new(
                "ms2m_reconcile_errors_total",
                "Reconcile steps that returned an error and were requeued",
            ),
            &["class"],
        )?;
        registry.register(Box::new(reconcile_errors.clone()))?;

        let degraded_cutovers = IntCounter::with_opts(Opts::new(
            "ms2m_degraded_cutovers_total",
            "Replay windows that hit the hard cutoff before converging",
        ))?;
        registry.register(Box::new(degraded_cutovers.clone()))?;

        Ok(Self {
            registry,
            migrations_started,
            reconciles_total,
            phase_transitions,
            phase_seconds,
            failures,
            reconcile_errors,
            degraded_cutovers,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.migrations_started.inc();
    }

    pub fn inc_reconcile(&self) {
        self.reconciles_total.inc();
    }

    pub fn record_transition(&self, from: &str, to: &str, time_in_phase: Duration) {
        self.phase_transitions.with_label_values(&[from, to]).inc();
        if !from.is_empty() && from != "Initial" {
            self.phase_seconds
                .with_label_values(&[from])
                .observe(time_in_phase.as_secs_f64());
        }
    }

    pub fn record_failure(&self, class: &str) {
        self.failures.with_label_values(&[class]).inc();
    }

    pub fn record_reconcile_error(&self, class: &str) {
        self.reconcile_errors.with_label_values(&[class]).inc();
    }

    pub fn inc_degraded_cutover(&self) {
        self.degraded_cutovers.inc();
    }
}

/// Node agent upload metrics.
#[derive(Clone, Debug)]
pub struct AgentMetrics {
    registry: SharedRegistry,
    uploads: IntCounterVec,
    received_bytes: IntCounter,
    load_seconds: Histogram,
}

impl AgentMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let uploads = IntCounterVec::new(
            Opts::new("ms2m_agent_uploads_total", "Checkpoint uploads by result"),
            &["result"],
        )?;
        registry.register(Box::new(uploads.clone()))?;

        let received_bytes = IntCounter::with_opts(Opts::new(
            "ms2m_agent_received_bytes_total",
            "Checkpoint archive bytes received",
        ))?;
        registry.register(Box::new(received_bytes.clone()))?;

        let buckets = prometheus::exponential_buckets(0.01, 2.0, 14)
            .context("failed to construct histogram buckets")?;
        let load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "ms2m_agent_load_seconds",
                "Time from upload completion to image loaded",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(load_seconds.clone()))?;

        Ok(Self {
            registry,
            uploads,
            received_bytes,
            load_seconds,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_upload(&self, result: &str, bytes: u64) {
        self.uploads.with_label_values(&[result]).inc();
        self.received_bytes.inc_by(bytes);
    }

    pub fn observe_load(&self, elapsed: Duration) {
        self.load_seconds.observe(elapsed.as_secs_f64());
    }
}

pub use prometheus;
