//! ---
//! ms2m_section: "03-checkpoint-artifact"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Builds single-layer checkpoint image artifacts from archives."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{ArtifactError, Result};
use crate::media::{self, CHECKPOINT_ANNOTATION};
use crate::oci::{oci_architecture, Descriptor, ImageConfig, ImageManifest, RootFs};

/// A checkpoint image whose only layer is backed by the archive on disk.
#[derive(Debug, Clone)]
pub struct ImageArtifact {
    archive_path: PathBuf,
    archive_size: u64,
    diff_id: String,
    layer: Descriptor,
    config_bytes: Vec<u8>,
    manifest: ImageManifest,
    manifest_bytes: Vec<u8>,
}

impl ImageArtifact {
    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    pub fn archive_size(&self) -> u64 {
        self.archive_size
    }

    /// Digest of the uncompressed layer content.
    pub fn diff_id(&self) -> &str {
        &self.diff_id
    }

    pub fn layers(&self) -> &[Descriptor] {
        &self.manifest.layers
    }

    pub fn layer(&self) -> &Descriptor {
        &self.layer
    }

    pub fn config_descriptor(&self) -> &Descriptor {
        &self.manifest.config
    }

    pub fn config_bytes(&self) -> &[u8] {
        &self.config_bytes
    }

    pub fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    pub fn manifest_bytes(&self) -> &[u8] {
        &self.manifest_bytes
    }

    pub fn manifest_digest(&self) -> String {
        sha256_digest(&self.manifest_bytes)
    }

    pub fn annotation(&self) -> Option<&str> {
        self.manifest
            .annotations
            .get(CHECKPOINT_ANNOTATION)
            .map(String::as_str)
    }

    /// Fresh reader over the framed layer blob. Every call re-reads the
    /// archive, so the blob can be sent more than once without buffering.
    pub fn open_layer(&self) -> Result<LayerReader> {
        let file = open_archive(&self.archive_path)?;
        Ok(LayerReader {
            inner: GzEncoder::new(BufReader::new(file), Compression::none()),
        })
    }
}

/// Streams the gzip-framed, uncompressed layer blob.
pub struct LayerReader {
    inner: GzEncoder<BufReader<File>>,
}

impl Read for LayerReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Package `archive` as a single-layer OCI image. A non-empty `label` is
/// recorded under the checkpoint annotation; otherwise no annotation is set.
pub fn build_artifact(archive: &Path, label: Option<&str>) -> Result<ImageArtifact> {
    let file = open_archive(archive)?;

    let mut framed = GzEncoder::new(
        HashingReader::new(BufReader::new(file)),
        Compression::none(),
    );
    let mut blob_hasher = Sha256::new();
    let blob_size = io::copy(&mut framed, &mut blob_hasher).map_err(|source| {
        ArtifactError::ArchiveUnreadable {
            path: archive.to_path_buf(),
            source,
        }
    })?;
    let raw = framed.into_inner();
    let archive_size = raw.bytes;
    let diff_id = format!("sha256:{}", hex::encode(raw.hasher.finalize()));
    let layer = Descriptor::new(
        media::OCI_LAYER_GZIP,
        format!("sha256:{}", hex::encode(blob_hasher.finalize())),
        blob_size,
    );

    let config = ImageConfig {
        architecture: oci_architecture().to_owned(),
        os: "linux".to_owned(),
        rootfs: RootFs {
            kind: "layers".to_owned(),
            diff_ids: vec![diff_id.clone()],
        },
        config: Default::default(),
    };
    let config_bytes = serde_json::to_vec(&config)?;

    let mut annotations = BTreeMap::new();
    if let Some(label) = label.filter(|label| !label.is_empty()) {
        annotations.insert(CHECKPOINT_ANNOTATION.to_owned(), label.to_owned());
    }
    let manifest = ImageManifest {
        schema_version: 2,
        media_type: media::OCI_MANIFEST.to_owned(),
        config: Descriptor::new(
            media::OCI_CONFIG,
            sha256_digest(&config_bytes),
            config_bytes.len() as u64,
        ),
        layers: vec![layer.clone()],
        annotations,
    };
    media::validate_media_types(&manifest.media_type, &manifest.config.media_type)?;
    let manifest_bytes = serde_json::to_vec(&manifest)?;

    debug!(
        archive = %archive.display(),
        archive_size,
        layer_size = blob_size,
        layer_digest = %layer.digest,
        "checkpoint artifact built"
    );

    Ok(ImageArtifact {
        archive_path: archive.to_path_buf(),
        archive_size,
        diff_id,
        layer,
        config_bytes,
        manifest,
        manifest_bytes,
    })
}

pub(crate) fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

fn open_archive(path: &Path) -> Result<File> {
    let unreadable = |source| ArtifactError::ArchiveUnreadable {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(unreadable)?;
    let metadata = file.metadata().map_err(unreadable)?;
    if !metadata.is_file() {
        return Err(unreadable(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file",
        )));
    }
    Ok(file)
}

struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Write;

    fn write_archive(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        path
    }

    fn read_layer(artifact: &ImageArtifact) -> Vec<u8> {
        let mut blob = Vec::new();
        artifact.open_layer().unwrap().read_to_end(&mut blob).unwrap();
        blob
    }

    #[test]
    fn build_is_structurally_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_archive(dir.path(), "checkpoint.tar", b"fake checkpoint data for testing");

        let first = build_artifact(&path, Some("my-container")).unwrap();
        let second = build_artifact(&path, Some("my-container")).unwrap();

        assert_eq!(first.layers().len(), 1);
        assert_eq!(second.layers().len(), 1);
        assert_eq!(first.annotation(), Some("my-container"));
        assert_eq!(first.annotation(), second.annotation());
        assert_eq!(first.layer().digest, second.layer().digest);
        assert_eq!(first.manifest_digest(), second.manifest_digest());
    }

    #[test]
    fn omitted_label_yields_no_annotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_archive(dir.path(), "checkpoint.tar", b"data");

        for label in [None, Some("")] {
            let artifact = build_artifact(&path, label).unwrap();
            assert!(artifact.manifest().annotations.is_empty());
            assert_eq!(artifact.layers().len(), 1);
        }
    }

    #[test]
    fn manifest_and_config_use_oci_media_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_archive(dir.path(), "checkpoint.tar", b"data");
        let artifact = build_artifact(&path, Some("app")).unwrap();

        assert_eq!(artifact.manifest().media_type, media::OCI_MANIFEST);
        assert_eq!(artifact.config_descriptor().media_type, media::OCI_CONFIG);
        assert_eq!(artifact.layer().media_type, media::OCI_LAYER_GZIP);
        assert_eq!(artifact.manifest().schema_version, 2);

        let config: ImageConfig = serde_json::from_slice(artifact.config_bytes()).unwrap();
        assert_eq!(config.os, "linux");
        assert_eq!(config.rootfs.diff_ids, vec![artifact.diff_id().to_owned()]);
        assert_eq!(
            artifact.config_descriptor().digest,
            sha256_digest(artifact.config_bytes())
        );
    }

    #[test]
    fn layer_is_stored_without_compression() {
        let dir = tempfile::tempdir().unwrap();
        let raw = vec![b'A'; 1024 * 1024];
        let path = write_archive(dir.path(), "repetitive.tar", &raw);

        let artifact = build_artifact(&path, Some("test-container")).unwrap();
        let ratio = artifact.layer().size as f64 / raw.len() as f64;
        assert!(
            ratio >= 0.95,
            "layer {} bytes vs raw {} bytes (ratio {ratio:.4}); expected no compression",
            artifact.layer().size,
            raw.len()
        );
        assert_eq!(artifact.archive_size(), raw.len() as u64);
    }

    #[test]
    fn layer_blob_matches_descriptor_and_unpacks_to_archive() {
        let dir = tempfile::tempdir().unwrap();
        let raw: Vec<u8> = (0..20_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let path = write_archive(dir.path(), "checkpoint.tar", &raw);
        let artifact = build_artifact(&path, None).unwrap();

        let blob = read_layer(&artifact);
        assert_eq!(blob.len() as u64, artifact.layer().size);
        assert_eq!(sha256_digest(&blob), artifact.layer().digest);

        let mut unpacked = Vec::new();
        GzDecoder::new(blob.as_slice())
            .read_to_end(&mut unpacked)
            .unwrap();
        assert_eq!(unpacked, raw);
        assert_eq!(sha256_digest(&raw), artifact.diff_id());
    }

    #[test]
    fn empty_archive_still_builds() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_archive(dir.path(), "empty.tar", b"");
        let artifact = build_artifact(&path, Some("c")).unwrap();
        assert_eq!(artifact.archive_size(), 0);
        assert!(artifact.layer().size > 0, "gzip framing is always present");
    }

    #[test]
    fn missing_archive_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let err = build_artifact(&dir.path().join("nope.tar"), Some("c")).unwrap_err();
        assert!(matches!(err, ArtifactError::ArchiveUnreadable { .. }), "{err:?}");
        assert!(err.io_error().is_some());

        let err = build_artifact(dir.path(), None).unwrap_err();
        assert!(matches!(err, ArtifactError::ArchiveUnreadable { .. }));
    }
}
