//! ---
//! ms2m_section: "03-checkpoint-artifact"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "On-disk OCI image layout writer."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;
use crate::media;
use crate::oci::{Descriptor, ImageIndex};
use crate::pipeline::ImageArtifact;

const LAYOUT_FILE: &str = "oci-layout";
const LAYOUT_VERSION: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Write `artifact` as an OCI image layout rooted at `dir`, tagging the
/// manifest with `ref_name` when given. Returns the layout root.
pub fn write_oci_layout(dir: &Path, artifact: &ImageArtifact, ref_name: Option<&str>) -> Result<PathBuf> {
    let blobs = dir.join("blobs").join("sha256");
    fs::create_dir_all(&blobs)?;
    fs::write(dir.join(LAYOUT_FILE), LAYOUT_VERSION)?;

    let layer_path = blobs.join(artifact.layer().encoded());
    let mut out = BufWriter::new(File::create(&layer_path)?);
    io::copy(&mut artifact.open_layer()?, &mut out)?;
    out.flush()?;

    fs::write(
        blobs.join(artifact.config_descriptor().encoded()),
        artifact.config_bytes(),
    )?;

    let mut manifest_desc = Descriptor::new(
        media::OCI_MANIFEST,
        artifact.manifest_digest(),
        artifact.manifest_bytes().len() as u64,
    );
    fs::write(blobs.join(manifest_desc.encoded()), artifact.manifest_bytes())?;
    if let Some(name) = ref_name {
        manifest_desc
            .annotations
            .insert(REF_NAME_ANNOTATION.to_owned(), name.to_owned());
    }

    let index = ImageIndex {
        schema_version: 2,
        media_type: media::OCI_INDEX.to_owned(),
        manifests: vec![manifest_desc],
    };
    fs::write(dir.join("index.json"), serde_json::to_vec(&index)?)?;

    debug!(layout = %dir.display(), "oci layout written");
    Ok(dir.to_path_buf())
}
