//! ---
//! ms2m_section: "05-node-agent"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Materialises received checkpoints into container storage."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ms2m_checkpoint::{build_artifact, checkpoint_image_tag, write_oci_layout};
use tempfile::TempDir;
use tokio::fs::{File, OpenOptions};
use tracing::{info, warn};

use crate::error::{LoaderError, Result};
use crate::loader::ImageLoader;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub image_tag: String,
    pub archive_bytes: u64,
    pub layer_digest: String,
    pub build_time: Duration,
    pub load_time: Duration,
}

/// Received archive plus the layout derived from it. Both paths are removed
/// when the last reference goes away, on the blocking pool when a runtime is
/// available. A layout build in flight holds a reference of its own.
#[derive(Debug)]
pub struct ScratchArchive {
    paths: Option<Arc<ScratchPaths>>,
}

#[derive(Debug)]
struct ScratchPaths {
    archive: PathBuf,
    layout: PathBuf,
    keep_archive: bool,
    /// Parent of `layout` when it was made just for this load.
    _workdir: Option<TempDir>,
}

impl ScratchArchive {
    fn new(archive: PathBuf, layout: PathBuf, keep_archive: bool, workdir: Option<TempDir>) -> Self {
        Self {
            paths: Some(Arc::new(ScratchPaths {
                archive,
                layout,
                keep_archive,
                _workdir: workdir,
            })),
        }
    }

    fn shared(&self) -> Option<Arc<ScratchPaths>> {
        self.paths.clone()
    }

    pub fn archive(&self) -> &Path {
        self.paths.as_ref().map_or(Path::new(""), |paths| paths.archive.as_path())
    }

    pub fn layout(&self) -> &Path {
        self.paths.as_ref().map_or(Path::new(""), |paths| paths.layout.as_path())
    }

    /// Remove the scratch files and wait for the removal to finish.
    pub async fn remove(mut self) {
        if let Some(paths) = self.paths.take() {
            if let Err(err) = tokio::task::spawn_blocking(move || drop(paths)).await {
                warn!(error = %err, "scratch cleanup task failed");
            }
        }
    }
}

impl Drop for ScratchArchive {
    fn drop(&mut self) {
        let Some(paths) = self.paths.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => drop(runtime.spawn_blocking(move || drop(paths))),
            Err(_) => drop(paths),
        }
    }
}

impl Drop for ScratchPaths {
    fn drop(&mut self) {
        if !self.keep_archive {
            if let Err(err) = std::fs::remove_file(&self.archive) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.archive.display(), error = %err, "failed to remove scratch archive");
                }
            }
        }
        if let Err(err) = std::fs::remove_dir_all(&self.layout) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.layout.display(), error = %err, "failed to remove scratch layout");
            }
        }
    }
}

#[derive(Clone)]
pub struct NodeLoader {
    storage_dir: PathBuf,
    loader: Arc<dyn ImageLoader>,
}

impl std::fmt::Debug for NodeLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLoader")
            .field("storage_dir", &self.storage_dir)
            .finish_non_exhaustive()
    }
}

impl NodeLoader {
    pub fn new(storage_dir: impl Into<PathBuf>, loader: Arc<dyn ImageLoader>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            loader,
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Reserve a uniquely named archive in the storage directory and open it
    /// for writing.
    pub async fn create_scratch(&self) -> Result<(ScratchArchive, File)> {
        tokio::fs::create_dir_all(&self.storage_dir).await?;
        let mut stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        loop {
            let archive = self.storage_dir.join(format!("checkpoint-{stamp}.tar"));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&archive)
                .await
            {
                Ok(file) => {
                    let layout = PathBuf::from(format!("{}-oci", archive.display()));
                    return Ok((ScratchArchive::new(archive, layout, false, None), file));
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => stamp += 1,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Build, lay out and load a received archive. Scratch files are removed
    /// whether or not loading succeeds.
    pub async fn materialize(&self, scratch: ScratchArchive, container: &str) -> Result<LoadReport> {
        let tag = checkpoint_image_tag(container);
        let report = self.build_and_load(&scratch, container, &tag).await;
        scratch.remove().await;
        report
    }

    /// Load an archive that already sits on this node. The archive is kept;
    /// only the temporary layout is removed.
    pub async fn local_load(&self, archive: &Path, container: &str, image_tag: &str) -> Result<LoadReport> {
        let workdir = tempfile::Builder::new().prefix("ms2m-oci-").tempdir()?;
        let layout = workdir.path().join("layout");
        let scratch = ScratchArchive::new(archive.to_path_buf(), layout, true, Some(workdir));
        let report = self.build_and_load(&scratch, container, image_tag).await;
        scratch.remove().await;
        report
    }

    async fn build_and_load(
        &self,
        scratch: &ScratchArchive,
        container: &str,
        image_tag: &str,
    ) -> Result<LoadReport> {
        let paths = scratch.shared().ok_or_else(|| {
            LoaderError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "scratch already removed"))
        })?;
        let label = (!container.is_empty()).then(|| container.to_owned());

        let build_started = Instant::now();
        let artifact = tokio::task::spawn_blocking(move || -> Result<_> {
            let artifact = build_artifact(&paths.archive, label.as_deref())?;
            write_oci_layout(&paths.layout, &artifact, Some("latest"))?;
            Ok(artifact)
        })
        .await
        .map_err(|err| LoaderError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))??;
        let build_time = build_started.elapsed();

        let load_started = Instant::now();
        self.loader.load(scratch.layout(), image_tag).await?;
        let load_time = load_started.elapsed();

        info!(
            image = %image_tag,
            archive_bytes = artifact.archive_size(),
            build_ms = build_time.as_millis() as u64,
            load_ms = load_time.as_millis() as u64,
            "checkpoint materialised"
        );
        Ok(LoadReport {
            image_tag: image_tag.to_owned(),
            archive_bytes: artifact.archive_size(),
            layer_digest: artifact.layer().digest.clone(),
            build_time,
            load_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::SkipLoader;
    use async_trait::async_trait;
    use tokio::io::AsyncWriteExt;

    struct FailingLoader;

    #[async_trait]
    impl ImageLoader for FailingLoader {
        async fn load(&self, layout: &Path, image_tag: &str) -> Result<()> {
            assert!(layout.join("index.json").exists(), "layout written before load");
            Err(LoaderError::LoadFailed {
                tag: image_tag.to_owned(),
                output: "storage locked".into(),
            })
        }
    }

    async fn received(loader: &NodeLoader, bytes: &[u8]) -> ScratchArchive {
        let (scratch, mut file) = loader.create_scratch().await.unwrap();
        file.write_all(bytes).await.unwrap();
        file.flush().await.unwrap();
        scratch
    }

    #[tokio::test]
    async fn scratch_names_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let loader = NodeLoader::new(dir.path(), Arc::new(SkipLoader));
        let (a, _) = loader.create_scratch().await.unwrap();
        let (b, _) = loader.create_scratch().await.unwrap();
        assert_ne!(a.archive(), b.archive());
        assert!(a.archive().file_name().unwrap().to_str().unwrap().starts_with("checkpoint-"));
        assert!(a.layout().to_str().unwrap().ends_with(".tar-oci"));
    }

    #[tokio::test]
    async fn successful_load_cleans_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let loader = NodeLoader::new(dir.path(), Arc::new(SkipLoader));
        let scratch = received(&loader, b"fake tar content").await;
        let (archive, layout) = (scratch.archive().to_path_buf(), scratch.layout().to_path_buf());

        let report = loader.materialize(scratch, "mycontainer").await.unwrap();
        assert_eq!(report.image_tag, "localhost/checkpoint/mycontainer:latest");
        assert_eq!(report.archive_bytes, 16);
        assert!(!archive.exists());
        assert!(!layout.exists());
    }

    #[tokio::test]
    async fn failed_load_still_cleans_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let loader = NodeLoader::new(dir.path(), Arc::new(FailingLoader));
        let scratch = received(&loader, b"fake tar content").await;
        let (archive, layout) = (scratch.archive().to_path_buf(), scratch.layout().to_path_buf());

        let err = loader.materialize(scratch, "c").await.unwrap_err();
        assert!(err.to_string().contains("storage locked"));
        assert!(!archive.exists());
        assert!(!layout.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn local_load_keeps_source_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("existing.tar");
        std::fs::write(&archive, b"checkpoint").unwrap();

        let loader = NodeLoader::new(dir.path().join("incoming"), Arc::new(SkipLoader));
        let report = loader
            .local_load(&archive, "app", "localhost/checkpoint/app:mig-7")
            .await
            .unwrap();
        assert_eq!(report.image_tag, "localhost/checkpoint/app:mig-7");
        assert!(archive.exists());
    }

    async fn wait_until_gone(paths: &[&Path]) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while paths.iter().any(|path| path.exists()) {
            assert!(tokio::time::Instant::now() < deadline, "scratch files left behind");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn dropped_scratch_is_removed_off_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let loader = NodeLoader::new(dir.path(), Arc::new(SkipLoader));
        let scratch = received(&loader, b"partial upload").await;
        let archive = scratch.archive().to_path_buf();
        drop(scratch);
        wait_until_gone(&[&archive]).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_materialize_leaves_no_layout_behind() {
        let dir = tempfile::tempdir().unwrap();
        let loader = NodeLoader::new(dir.path(), Arc::new(SkipLoader));
        let payload: Vec<u8> = (0..32 * 1024 * 1024u32).map(|i| (i % 253) as u8).collect();
        let scratch = received(&loader, &payload).await;
        let (archive, layout) = (scratch.archive().to_path_buf(), scratch.layout().to_path_buf());

        let task = tokio::spawn({
            let loader = loader.clone();
            async move { loader.materialize(scratch, "c").await }
        });
        while !layout.exists() && !task.is_finished() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        task.abort();
        let _ = task.await;

        wait_until_gone(&[&archive, &layout]).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!layout.exists(), "layout recreated after cleanup");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
