//! ---
//! ms2m_section: "03-checkpoint-artifact"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Checkpoint archive to OCI image artifact pipeline."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
//! Turns a raw checkpoint archive into a single-layer image artifact that a
//! CRI-O node can restore from.
//!
//! The layer is framed as gzip but stored without compression, so the blob
//! is only a few bytes larger than the archive itself. Blobs are streamed from
//! disk on demand; the archive is never held in memory.

pub mod error;
pub mod layout;
pub mod media;
pub mod oci;
pub mod pipeline;

pub use error::{ArtifactError, Result};
pub use layout::write_oci_layout;
pub use media::{checkpoint_image_tag, validate_media_types, CHECKPOINT_ANNOTATION};
pub use oci::{Descriptor, ImageConfig, ImageIndex, ImageManifest, RootFs};
pub use pipeline::{build_artifact, ImageArtifact, LayerReader};
