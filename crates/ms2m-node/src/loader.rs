//! ---
//! ms2m_section: "05-node-agent"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Local image loader capability."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{LoaderError, Result};

/// Copies an on-disk OCI layout into the node's container storage.
#[async_trait]
pub trait ImageLoader: Send + Sync {
    async fn load(&self, layout: &Path, image_tag: &str) -> Result<()>;
}

/// Shells out to `skopeo copy`.
#[derive(Debug, Clone)]
pub struct SkopeoLoader {
    binary: PathBuf,
}

impl Default for SkopeoLoader {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("skopeo"),
        }
    }
}

impl SkopeoLoader {
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl ImageLoader for SkopeoLoader {
    async fn load(&self, layout: &Path, image_tag: &str) -> Result<()> {
        let source = format!("oci:{}", layout.display());
        let target = format!("containers-storage:{image_tag}");
        debug!(%source, %target, "running skopeo copy");
        let output = Command::new(&self.binary)
            .arg("copy")
            .arg(&source)
            .arg(&target)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(LoaderError::Spawn)?;
        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(LoaderError::LoadFailed {
                tag: image_tag.to_owned(),
                output: format!("{}: {}", output.status, combined.trim()),
            });
        }
        info!(image = %image_tag, "image loaded into container storage");
        Ok(())
    }
}

/// Leaves the layout on disk untouched. Used when no container storage is
/// available, e.g. in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkipLoader;

#[async_trait]
impl ImageLoader for SkipLoader {
    async fn load(&self, layout: &Path, image_tag: &str) -> Result<()> {
        debug!(layout = %layout.display(), image = %image_tag, "image load skipped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let loader = SkopeoLoader::with_binary("/nonexistent/skopeo-for-tests");
        let err = loader
            .load(Path::new("/tmp/layout"), "localhost/checkpoint/app:latest")
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::Spawn(_)), "{err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_loader_reports_output() {
        let loader = SkopeoLoader::with_binary("false");
        let err = loader
            .load(Path::new("/tmp/layout"), "localhost/checkpoint/app:latest")
            .await
            .unwrap_err();
        match err {
            LoaderError::LoadFailed { tag, .. } => {
                assert_eq!(tag, "localhost/checkpoint/app:latest")
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
