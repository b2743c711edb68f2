//! ---
//! ms2m_section: "01-core-functionality"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Shared primitives and utilities for the migration runtime."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::{debug, warn};

use crate::logging::LogFormat;

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_watch_resync() -> Duration {
    Duration::from_secs(60)
}

fn default_requeue_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(500)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(30)
}

fn default_target_suffix() -> String {
    "-shadow".to_owned()
}

fn default_agent_port() -> u16 {
    9443
}

fn default_agent_scheme() -> String {
    "http".to_owned()
}

fn default_transfer_image() -> String {
    "ghcr.io/haidinhtuan/checkpoint-transfer:latest".to_owned()
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("/var/lib/kubelet/checkpoints")
}

fn default_job_backoff_limit() -> u32 {
    2
}

fn default_transfer_deadline() -> Duration {
    Duration::from_secs(600)
}

fn default_lag_threshold() -> u64 {
    10
}

fn default_stability_window() -> Duration {
    Duration::from_secs(5)
}

fn default_hard_cutoff() -> Duration {
    Duration::from_secs(120)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_vhost() -> String {
    "/".to_owned()
}

/// Primary configuration object for the migration controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub kube: KubeConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "MS2M_CONFIG";

    /// Load configuration from disk, respecting the `MS2M_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    ///
    /// An explicit `MS2M_CONFIG` path must exist. When none of the candidates
    /// exist the built-in defaults are used, which suits in-cluster deployments
    /// configured entirely through the service account.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        let inspected = candidates
            .iter()
            .map(|p| p.as_ref().display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        warn!(%inspected, "no configuration file found; using defaults");
        let config = AppConfig::default();
        config.validate()?;
        Ok(LoadedAppConfig {
            config,
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.orchestrator.validate()?;
        self.transfer.validate()?;
        self.replay.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

/// Connection settings for the cluster control plane.
///
/// Leaving `api_server` unset selects the in-cluster service account
/// (`KUBERNETES_SERVICE_HOST`, token and CA under
/// `/var/run/secrets/kubernetes.io/serviceaccount`).
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeConfig {
    #[serde(default)]
    pub api_server: Option<String>,
    #[serde(default)]
    pub token_path: Option<PathBuf>,
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
    #[serde(default)]
    pub watch_namespace: Option<String>,
    #[serde(default = "default_watch_resync")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub resync_interval: Duration,
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            api_server: None,
            token_path: None,
            ca_path: None,
            insecure_skip_tls_verify: false,
            request_timeout: default_request_timeout(),
            watch_namespace: None,
            resync_interval: default_watch_resync(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Delay applied when a phase asks to be revisited shortly.
    #[serde(default = "default_requeue_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub requeue_delay: Duration,
    #[serde(default = "default_backoff_base")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub backoff_base: Duration,
    #[serde(default = "default_backoff_max")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub backoff_max: Duration,
    /// Suffix appended to the source pod name for shadow targets.
    #[serde(default = "default_target_suffix")]
    pub target_suffix: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            requeue_delay: default_requeue_delay(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            target_suffix: default_target_suffix(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.backoff_base.is_zero() {
            return Err(anyhow!("orchestrator.backoff_base must be greater than zero"));
        }
        if self.backoff_max < self.backoff_base {
            return Err(anyhow!(
                "orchestrator.backoff_max must not be shorter than orchestrator.backoff_base"
            ));
        }
        if self.target_suffix.trim().is_empty() {
            return Err(anyhow!("orchestrator.target_suffix must not be empty"));
        }
        Ok(())
    }
}

/// How the checkpoint artifact travels to the target node.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Push to a container registry the target node pulls from.
    Registry,
    /// Stream the raw archive to the agent running on the target node.
    #[default]
    Direct,
}

/// Where the transfer pipeline executes.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShipperKind {
    /// A Job pinned to the source node runs `checkpoint-transfer`.
    #[default]
    Job,
    /// The controller process reads the archive itself.
    Local,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default)]
    pub mode: TransferMode,
    #[serde(default)]
    pub shipper: ShipperKind,
    /// Registry repository prefix, e.g. `registry.local:5000/ms2m`.
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default)]
    pub insecure_registry: bool,
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,
    #[serde(default = "default_agent_scheme")]
    pub agent_scheme: String,
    #[serde(default = "default_transfer_image")]
    pub transfer_image: String,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_job_backoff_limit")]
    pub job_backoff_limit: u32,
    /// Upper bound on one in-process push or upload.
    #[serde(default = "default_transfer_deadline")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub deadline: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            mode: TransferMode::default(),
            shipper: ShipperKind::default(),
            registry: None,
            insecure_registry: false,
            agent_port: default_agent_port(),
            agent_scheme: default_agent_scheme(),
            transfer_image: default_transfer_image(),
            checkpoint_dir: default_checkpoint_dir(),
            job_backoff_limit: default_job_backoff_limit(),
            deadline: default_transfer_deadline(),
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mode == TransferMode::Registry
            && self
                .registry
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
        {
            return Err(anyhow!(
                "transfer.registry is required when transfer.mode = \"registry\""
            ));
        }
        if !matches!(self.agent_scheme.as_str(), "http" | "https") {
            return Err(anyhow!(
                "transfer.agent_scheme must be http or https, got {}",
                self.agent_scheme
            ));
        }
        if self.agent_port == 0 {
            return Err(anyhow!("transfer.agent_port must be non-zero"));
        }
        if self.deadline.is_zero() {
            return Err(anyhow!("transfer.deadline must be positive"));
        }
        Ok(())
    }
}

/// Tuning for the replay window between target start and source retirement.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Queue depth at or below which the target is considered caught up.
    #[serde(default = "default_lag_threshold")]
    pub lag_threshold: u64,
    #[serde(default = "default_stability_window")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub stability_window: Duration,
    #[serde(default = "default_hard_cutoff")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub hard_cutoff: Duration,
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    /// Broker management API root; derived from the broker URL when absent.
    #[serde(default)]
    pub management_url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_vhost")]
    pub vhost: String,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            lag_threshold: default_lag_threshold(),
            stability_window: default_stability_window(),
            hard_cutoff: default_hard_cutoff(),
            poll_interval: default_poll_interval(),
            management_url: None,
            username: None,
            password: None,
            vhost: default_vhost(),
        }
    }
}

impl ReplayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.hard_cutoff.is_zero() {
            return Err(anyhow!("replay.hard_cutoff must be greater than zero"));
        }
        if self.stability_window >= self.hard_cutoff {
            return Err(anyhow!(
                "replay.stability_window ({:?}) must be shorter than replay.hard_cutoff ({:?})",
                self.stability_window,
                self.hard_cutoff
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(anyhow!("replay.poll_interval must be greater than zero"));
        }
        if let Some(url) = &self.management_url {
            url::Url::parse(url)
                .with_context(|| format!("replay.management_url {url} is not a valid URL"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: AppConfig = "".parse().expect("defaults are valid");
        assert_eq!(config.transfer.mode, TransferMode::Direct);
        assert_eq!(config.transfer.agent_port, 9443);
        assert_eq!(config.replay.lag_threshold, 10);
        assert_eq!(config.replay.hard_cutoff, Duration::from_secs(120));
        assert_eq!(config.orchestrator.target_suffix, "-shadow");
    }

    #[test]
    fn parses_sections_with_durations() {
        let config: AppConfig = r#"
            [orchestrator]
            requeue_delay = 250
            backoff_base = 100
            backoff_max = 10

            [transfer]
            mode = "registry"
            registry = "registry.local:5000/ms2m"
            insecure_registry = true
            deadline = 90

            [replay]
            lag_threshold = 3
            stability_window = 2
            hard_cutoff = 30
            poll_interval = 500
            management_url = "http://rabbitmq:15672"
        "#
        .parse()
        .expect("valid configuration");
        assert_eq!(config.orchestrator.requeue_delay, Duration::from_millis(250));
        assert_eq!(config.orchestrator.backoff_max, Duration::from_secs(10));
        assert_eq!(config.transfer.mode, TransferMode::Registry);
        assert!(config.transfer.insecure_registry);
        assert_eq!(config.transfer.deadline, Duration::from_secs(90));
        assert_eq!(config.replay.poll_interval, Duration::from_millis(500));
        assert_eq!(config.replay.stability_window, Duration::from_secs(2));
    }

    #[test]
    fn shipped_sample_matches_defaults() {
        let sample: AppConfig = include_str!("../../../configs/ms2m.toml")
            .parse()
            .expect("sample configuration is valid");
        let defaults: AppConfig = "".parse().unwrap();
        assert_eq!(sample.transfer.shipper, defaults.transfer.shipper);
        assert_eq!(sample.transfer.checkpoint_dir, defaults.transfer.checkpoint_dir);
        assert_eq!(sample.transfer.deadline, defaults.transfer.deadline);
        assert_eq!(sample.replay.poll_interval, defaults.replay.poll_interval);
        assert_eq!(sample.kube.resync_interval, defaults.kube.resync_interval);
        assert_eq!(sample.logging.format, defaults.logging.format);
    }

    #[test]
    fn registry_mode_requires_registry_prefix() {
        let err = "[transfer]\nmode = \"registry\"\n"
            .parse::<AppConfig>()
            .expect_err("missing registry must be rejected");
        assert!(format!("{err:#}").contains("transfer.registry"));
    }

    #[test]
    fn zero_transfer_deadline_is_rejected() {
        let err = "[transfer]\ndeadline = 0\n"
            .parse::<AppConfig>()
            .expect_err("unbounded transfers are rejected");
        assert!(format!("{err:#}").contains("transfer.deadline"));
    }

    #[test]
    fn stability_window_must_fit_inside_cutoff() {
        let err = "[replay]\nstability_window = 60\nhard_cutoff = 60\n"
            .parse::<AppConfig>()
            .expect_err("window equal to cutoff is rejected");
        assert!(format!("{err:#}").contains("stability_window"));
    }

    #[test]
    fn load_falls_back_to_defaults_without_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let loaded = AppConfig::load_with_source(&[missing]).expect("defaults load");
        assert!(loaded.source.is_none());
        assert_eq!(loaded.config.metrics.listen.port(), 9898);
    }

    #[test]
    fn load_reads_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.toml");
        fs::write(&path, "[transfer]\nagent_port = 9555\n").unwrap();
        let loaded = AppConfig::load_with_source(&[dir.path().join("nope.toml"), path.clone()])
            .expect("config loads");
        assert_eq!(loaded.source.as_deref(), Some(path.as_path()));
        assert_eq!(loaded.config.transfer.agent_port, 9555);
    }
}
