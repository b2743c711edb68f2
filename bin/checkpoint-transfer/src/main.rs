//! ---
//! ms2m_section: "04-artifact-transfer"
//! ms2m_subsection: "binary"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Binary entrypoint for the checkpoint transfer tool."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::builder::FalseyValueParser;
use clap::{ArgAction, Parser};
use ms2m_common::{init_console_tracing, LogFormat};
use ms2m_transport::{ArtifactTransfer, Destination, DockerConfigKeychain};
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Build a checkpoint image and push it to a registry or stream it to a node agent",
    long_about = None
)]
struct Cli {
    /// Checkpoint archive written by the kubelet.
    archive: PathBuf,

    /// `http(s)://host:port/checkpoint` for a direct upload, otherwise an image reference.
    destination: String,

    /// Container name recorded in the checkpoint annotation.
    label: Option<String>,

    #[arg(
        long,
        env = "INSECURE_REGISTRY",
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new(),
        help = "Accept invalid certificates and plain HTTP registries"
    )]
    insecure: bool,

    /// Seconds allowed for the push or upload itself.
    #[arg(long, env = "TRANSFER_DEADLINE", default_value_t = 600, value_parser = clap::value_parser!(u64).range(1..))]
    deadline: u64,

    #[arg(long, env = "LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_console_tracing(cli.log_format);

    let destination = Destination::parse(&cli.destination)
        .with_context(|| format!("invalid destination {}", cli.destination))?;
    let keychain = DockerConfigKeychain::from_env();
    info!(
        credentials = %keychain.path().display(),
        insecure = cli.insecure,
        deadline_s = cli.deadline,
        "transfer configured"
    );
    let transfer = ArtifactTransfer::new(Arc::new(keychain), cli.insecure)?
        .with_deadline(Duration::from_secs(cli.deadline));

    let started = Instant::now();
    let label = cli.label.as_deref().filter(|label| !label.is_empty());
    let report = transfer
        .send(&cli.archive, &destination, label)
        .await
        .with_context(|| format!("transferring {} to {destination}", cli.archive.display()))?;
    info!(
        destination = %report.destination,
        bytes = report.bytes,
        digest = report.digest.as_deref().unwrap_or(""),
        build_ms = report.build_time.as_millis() as u64,
        send_ms = report.send_time.as_millis() as u64,
        total_ms = started.elapsed().as_millis() as u64,
        "checkpoint transferred"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(["checkpoint-transfer"].iter().chain(args)).unwrap()
    }

    #[test]
    fn insecure_registry_env_is_a_boolean_flag() {
        let args = ["cp.tar", "registry.local:5000/ms2m/app:m1"];
        for (value, expected) in [
            ("true", true),
            ("1", true),
            ("yes", true),
            ("false", false),
            ("FALSE", false),
            ("0", false),
            ("off", false),
            ("", false),
        ] {
            std::env::set_var("INSECURE_REGISTRY", value);
            assert_eq!(parse(&args).insecure, expected, "INSECURE_REGISTRY={value:?}");
        }
        std::env::remove_var("INSECURE_REGISTRY");
        assert!(!parse(&args).insecure);
        assert!(parse(&["--insecure", "cp.tar", "registry.local:5000/ms2m/app:m1"]).insecure);
    }

    #[test]
    fn deadline_must_be_positive() {
        let cli = parse(&["--deadline", "30", "cp.tar", "http://10.0.0.5:9443/checkpoint"]);
        assert_eq!(cli.deadline, 30);
        assert!(Cli::try_parse_from(["checkpoint-transfer", "--deadline", "0", "cp.tar", "x"]).is_err());
    }
}
