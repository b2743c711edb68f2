//! ---
//! ms2m_section: "08-control-plane"
//! ms2m_subsection: "binary"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Binary entrypoint for the migration controller."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use ms2m_common::{init_tracing, AppConfig, ShipperKind};
use ms2m_core::{
    ArtifactShipper, CancellationToken, Collaborators, Controller, ControllerSettings,
    LocalShipper, MigrationOrchestrator, Reconciler, RetryPolicy, SystemClock,
};
use ms2m_kube::{
    ApiServerClient, KubeCluster, KubeJobShipper, KubeMigrationStore, KubeletCheckpointClient,
};
use ms2m_metrics::{new_registry, spawn_http_server, MigrationMetrics};
use ms2m_replay::{RabbitConnector, ReplayCoordinator, ReplayPolicy};
use ms2m_transport::{ArtifactTransfer, DockerConfigKeychain};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "MS2M stateful migration controller", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Only reconcile migrations in this namespace")]
    namespace: Option<String>,

    #[arg(long, value_enum, help = "Override where checkpoint archives are shipped from")]
    shipper: Option<CliShipper>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliShipper {
    Job,
    Local,
}

impl From<CliShipper> for ShipperKind {
    fn from(value: CliShipper) -> Self {
        match value {
            CliShipper::Job => ShipperKind::Job,
            CliShipper::Local => ShipperKind::Local,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/ms2m.toml"));
    candidates.push(PathBuf::from("/etc/ms2m/controller.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(namespace) = cli.namespace {
        config.kube.watch_namespace = Some(namespace);
    }
    if let Some(shipper) = cli.shipper {
        config.transfer.shipper = shipper.into();
    }
    config.validate()?;

    init_tracing("ms2m-controller", &config.logging)?;
    info!(
        config = %loaded.source.as_deref().map(|p| p.display().to_string()).unwrap_or_else(|| "defaults".into()),
        namespace = config.kube.watch_namespace.as_deref().unwrap_or("*"),
        mode = ?config.transfer.mode,
        shipper = ?config.transfer.shipper,
        "configuration loaded"
    );

    run_controller(config).await
}

async fn run_controller(config: AppConfig) -> Result<()> {
    let registry = new_registry();
    let metrics = MigrationMetrics::new(registry.clone())?;
    let metrics_server = if config.metrics.enabled {
        let server = spawn_http_server(registry, config.metrics.listen)?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let api = ApiServerClient::from_config(&config.kube).context("configuring api server client")?;
    let store = Arc::new(KubeMigrationStore::new(
        api.clone(),
        config.kube.watch_namespace.clone(),
    ));
    let cluster = Arc::new(KubeCluster::new(api.clone()));
    let shipper: Arc<dyn ArtifactShipper> = match config.transfer.shipper {
        ShipperKind::Job => Arc::new(KubeJobShipper::new(api.clone(), &config.transfer)),
        ShipperKind::Local => {
            let transfer = ArtifactTransfer::new(
                Arc::new(DockerConfigKeychain::from_env()),
                config.transfer.insecure_registry,
            )?
            .with_deadline(config.transfer.deadline);
            Arc::new(LocalShipper::new(transfer))
        }
    };
    let connector = RabbitConnector::new(config.replay.clone(), config.kube.request_timeout)?;

    let collaborators = Collaborators {
        checkpoint: Arc::new(KubeletCheckpointClient::new(api)),
        inspector: cluster.clone(),
        runtime: cluster,
        shipper,
        replay: ReplayCoordinator::new(Arc::new(connector), ReplayPolicy::from(&config.replay)),
        clock: Arc::new(SystemClock),
    };
    let orchestrator = Arc::new(MigrationOrchestrator::new(
        collaborators,
        &config.orchestrator,
        &config.transfer,
    ));
    let reconciler = Reconciler::new(store.clone(), orchestrator, Some(metrics.clone()));
    let settings = ControllerSettings {
        retry: RetryPolicy::new(config.orchestrator.backoff_base, config.orchestrator.backoff_max),
        resync_interval: config.kube.resync_interval,
    };

    let cancel = CancellationToken::new();
    let watch = store.spawn_watch(cancel.clone());
    let controller = tokio::spawn(
        Controller::new(reconciler, settings, Some(metrics)).run(cancel.clone()),
    );

    info!("controller running; waiting for termination signal");
    shutdown_signal().await?;
    info!("termination signal received; shutting down");
    cancel.cancel();

    match controller.await {
        Ok(result) => result?,
        Err(err) => warn!(error = %err, "controller task aborted"),
    }
    if let Err(err) = watch.await {
        warn!(error = %err, "watch task aborted");
    }
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
