//! ---
//! ms2m_section: "05-node-agent"
//! ms2m_subsection: "binary"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Binary entrypoint for the node receiving agent."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::builder::FalseyValueParser;
use clap::{ArgAction, Parser, Subcommand};
use ms2m_common::{init_console_tracing, LogFormat};
use ms2m_metrics::{new_registry, spawn_http_server, AgentMetrics};
use ms2m_node::{AgentServerBuilder, ImageLoader, NodeLoader, SkipLoader, SkopeoLoader};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "MS2M node agent", long_about = None)]
struct Cli {
    #[arg(long, env = "STORAGE_DIR", default_value = "/var/lib/ms2m/incoming")]
    storage_dir: PathBuf,

    #[arg(long, env = "PORT", default_value_t = 9443)]
    port: u16,

    #[arg(long, env = "LISTEN_ADDR", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    listen_addr: IpAddr,

    #[arg(
        long,
        env = "SKIP_LOAD",
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new(),
        help = "Build images but do not load them into container storage"
    )]
    skip_load: bool,

    #[arg(long, env = "MAX_UPLOAD_BYTES", help = "Reject uploads larger than this")]
    max_upload_bytes: Option<usize>,

    #[arg(long, env = "METRICS_LISTEN", help = "Serve Prometheus metrics on this address")]
    metrics_listen: Option<SocketAddr>,

    #[arg(long, env = "SKOPEO_BIN", default_value = "skopeo")]
    skopeo: PathBuf,

    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Receive uploads over HTTP (default)")]
    Serve,
    #[command(about = "Build and load an archive already present on this node")]
    LocalLoad {
        tar: PathBuf,
        container: String,
        tag: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_console_tracing(cli.log_format);

    let image_loader: Arc<dyn ImageLoader> = if cli.skip_load {
        warn!("SKIP_LOAD set; images will not reach container storage");
        Arc::new(SkipLoader)
    } else {
        Arc::new(SkopeoLoader::with_binary(cli.skopeo.clone()))
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::LocalLoad {
            tar,
            container,
            tag,
        } => {
            let node = NodeLoader::new(cli.storage_dir.clone(), image_loader);
            let report = node
                .local_load(&tar, &container, &tag)
                .await
                .with_context(|| format!("loading {}", tar.display()))?;
            info!(
                image = %report.image_tag,
                bytes = report.archive_bytes,
                digest = %report.layer_digest,
                build_ms = report.build_time.as_millis() as u64,
                load_ms = report.load_time.as_millis() as u64,
                "local load complete"
            );
            Ok(())
        }
        Command::Serve => {
            tokio::fs::create_dir_all(&cli.storage_dir)
                .await
                .with_context(|| format!("creating {}", cli.storage_dir.display()))?;
            let node = NodeLoader::new(cli.storage_dir.clone(), image_loader);

            let registry = new_registry();
            let mut builder =
                AgentServerBuilder::new(SocketAddr::new(cli.listen_addr, cli.port), node)
                    .with_metrics(AgentMetrics::new(registry.clone())?);
            if let Some(limit) = cli.max_upload_bytes {
                builder = builder.with_max_upload_bytes(limit);
            }
            let metrics_server = match cli.metrics_listen {
                Some(addr) => Some(spawn_http_server(registry, addr)?),
                None => None,
            };
            let agent = builder.spawn().await?;
            info!(address = %agent.local_addr(), "agent ready");

            tokio::signal::ctrl_c().await?;
            info!("ctrl-c received; shutting down");
            agent.shutdown().await?;
            if let Some(server) = metrics_server {
                server.shutdown().await?;
            }
            Ok(())
        }
    }
}
