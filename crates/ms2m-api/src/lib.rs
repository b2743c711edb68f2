//! ---
//! ms2m_section: "02-data-model"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "StatefulMigration resource model shared across the workspace."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
//! Data model for `statefulmigrations.migration.vibe.io`.

pub mod phase;
pub mod types;

pub use phase::{Phase, UnknownPhase};
pub use types::{
    IllegalTransition, MessageQueueConfig, MigrationKey, MigrationStrategy, ObjectMeta,
    ReplayOutcome, ReplayProgress, StatefulMigration, StatefulMigrationSpec,
    StatefulMigrationStatus, API_GROUP, API_VERSION, KIND, PLURAL,
};
