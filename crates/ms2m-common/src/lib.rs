//! ---
//! ms2m_section: "01-core-functionality"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Shared primitives and utilities for the migration runtime."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
//! Shared primitives for the MS2M workspace.
//! This crate exposes configuration loading, logging bootstrap, cancellation
//! helpers, and duration formatting consumed across the workspace.

pub mod cancel;
pub mod config;
pub mod logging;
pub mod time;

pub use cancel::{Cancelled, OrCancelExt};
pub use config::{
    AppConfig, KubeConfig, LoggingConfig, MetricsConfig, OrchestratorConfig, ReplayConfig,
    ShipperKind, TransferConfig, TransferMode,
};
pub use logging::{init_console_tracing, init_tracing, LogFormat};
pub use time::format_duration;
