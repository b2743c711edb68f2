//! ---
//! ms2m_section: "05-node-agent"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Target-side checkpoint receiver and loader."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
//! Target-node half of a direct transfer: accepts the uploaded archive,
//! builds the checkpoint image, and loads it into local container storage.

pub mod error;
pub mod loader;
pub mod node;
pub mod server;

pub use error::{LoaderError, Result};
pub use loader::{ImageLoader, SkipLoader, SkopeoLoader};
pub use ms2m_checkpoint::checkpoint_image_tag;
pub use node::{LoadReport, NodeLoader, ScratchArchive};
pub use server::{AgentServerBuilder, AgentServerHandle, SUCCESS_BODY};
