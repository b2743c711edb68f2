//! ---
//! ms2m_section: "03-checkpoint-artifact"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Media type constants and family checks."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use crate::error::{ArtifactError, Result};

/// Annotation CRI-O reads to recognise a checkpoint image.
pub const CHECKPOINT_ANNOTATION: &str = "io.kubernetes.cri-o.annotations.checkpoint.name";

/// Tag under which a restored container finds its checkpoint image when the
/// image is loaded straight into node-local storage.
pub fn checkpoint_image_tag(container: &str) -> String {
    let name = if container.is_empty() { "checkpoint" } else { container };
    format!("localhost/checkpoint/{name}:latest")
}

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Oci,
    Docker,
}

fn family(media_type: &str) -> Option<Family> {
    if media_type.starts_with("application/vnd.oci.") {
        Some(Family::Oci)
    } else if media_type.starts_with("application/vnd.docker.") {
        Some(Family::Docker)
    } else {
        None
    }
}

/// Manifest and config must both be OCI; CRI-O ignores the checkpoint
/// annotation on anything else and rejects mixed images outright.
pub fn validate_media_types(manifest: &str, config: &str) -> Result<()> {
    match (family(manifest), family(config)) {
        (Some(Family::Oci), Some(Family::Oci)) => Ok(()),
        (Some(m), Some(c)) if m != c => Err(ArtifactError::InvalidArtifact(format!(
            "mixed image kinds: manifest {manifest} with config {config}"
        ))),
        _ => Err(ArtifactError::InvalidArtifact(format!(
            "checkpoint images require OCI media types, got manifest {manifest} and config {config}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_is_derived_from_container_name() {
        assert_eq!(checkpoint_image_tag("counter"), "localhost/checkpoint/counter:latest");
        assert_eq!(checkpoint_image_tag(""), "localhost/checkpoint/checkpoint:latest");
    }

    #[test]
    fn oci_pair_is_accepted() {
        assert!(validate_media_types(OCI_MANIFEST, OCI_CONFIG).is_ok());
    }

    #[test]
    fn mixed_kinds_are_rejected() {
        let err = validate_media_types(OCI_MANIFEST, DOCKER_CONFIG).unwrap_err();
        assert!(err.to_string().contains("mixed"), "{err}");
        assert!(validate_media_types(DOCKER_MANIFEST, OCI_CONFIG).is_err());
    }

    #[test]
    fn legacy_docker_pair_is_rejected() {
        assert!(validate_media_types(DOCKER_MANIFEST, DOCKER_CONFIG).is_err());
    }
}
