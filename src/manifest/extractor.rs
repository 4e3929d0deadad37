//! File extraction from OCI artifacts into a content-addressed store.
//!
//! The extractor unpacks just enough of an OCI image to a scratch directory,
//! locates the wanted file by glob, and copies it into a per-digest store
//! directory. Re-resolving the same artifact hits the same directory, so the
//! operation is idempotent and safe to share between concurrent pipelines.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::cancel::CancelToken;
use crate::error::Error;
use crate::process::{Cmd, SharedRunner};

/// Hash component of a digest is truncated to this many characters when
/// forming a store directory name.
const MAX_HASH_LEN: usize = 64;

/// Capability for unpacking the filesystem of an OCI image.
pub trait OciUnpacker: Send + Sync {
    /// Unpack the image at `uri` into `dest`, returning the manifest digest
    /// as `<algorithm>:<hash>`.
    fn unpack(&self, cancel: &CancelToken, uri: &str, dest: &Path) -> Result<String>;
}

/// Default unpacker: `skopeo copy` into an OCI layout directory, then layer
/// extraction with tar.
pub struct SkopeoUnpacker {
    runner: SharedRunner,
    /// Use the local container storage instead of contacting a registry.
    local: bool,
}

impl SkopeoUnpacker {
    pub fn new(runner: SharedRunner, local: bool) -> Self {
        Self { runner, local }
    }
}

#[derive(serde::Deserialize)]
struct OciIndex {
    manifests: Vec<OciDescriptor>,
}

#[derive(serde::Deserialize)]
struct OciDescriptor {
    digest: String,
    #[serde(default, rename = "mediaType")]
    media_type: String,
}

#[derive(serde::Deserialize)]
struct OciManifest {
    layers: Vec<OciDescriptor>,
}

impl OciUnpacker for SkopeoUnpacker {
    fn unpack(&self, cancel: &CancelToken, uri: &str, dest: &Path) -> Result<String> {
        cancel.check()?;
        let layout = TempDir::with_prefix("unpacked-oci-")
            .context("creating oci image unpack directory")?;

        let transport = if self.local {
            format!("containers-storage:{uri}")
        } else {
            format!("docker://{uri}")
        };
        Cmd::new(self.runner.as_ref(), "skopeo")
            .args(["copy", &transport])
            .arg(format!("oci:{}:img", layout.path().display()))
            .error_msg("fetching OCI image")
            .run()?;
        cancel.check()?;

        let index_data = fs::read(layout.path().join("index.json"))
            .context("reading OCI layout index")?;
        let index: OciIndex =
            serde_json::from_slice(&index_data).context("parsing OCI layout index")?;
        let descriptor = index
            .manifests
            .first()
            .context("OCI layout carries no manifest")?;
        let digest = descriptor.digest.clone();

        let manifest_data = fs::read(blob_path(layout.path(), &digest)?)
            .context("reading OCI image manifest")?;
        let manifest: OciManifest =
            serde_json::from_slice(&manifest_data).context("parsing OCI image manifest")?;

        fs::create_dir_all(dest)
            .with_context(|| format!("creating unpack destination '{}'", dest.display()))?;
        for layer in &manifest.layers {
            cancel.check()?;
            let blob = File::open(blob_path(layout.path(), &layer.digest)?)
                .with_context(|| format!("opening layer blob '{}'", layer.digest))?;
            if layer.media_type.ends_with("tar+gzip") || layer.media_type.ends_with("tar.gzip") {
                let decoder = flate2::read::GzDecoder::new(blob);
                tar::Archive::new(decoder)
                    .unpack(dest)
                    .with_context(|| format!("unpacking layer '{}'", layer.digest))?;
            } else {
                tar::Archive::new(blob)
                    .unpack(dest)
                    .with_context(|| format!("unpacking layer '{}'", layer.digest))?;
            }
        }

        Ok(digest)
    }
}

fn blob_path(layout: &Path, digest: &str) -> Result<PathBuf> {
    let (algorithm, hash) = split_digest(digest)?;
    Ok(layout.join("blobs").join(algorithm).join(hash))
}

fn split_digest(digest: &str) -> Result<(&str, &str)> {
    match digest.split_once(':') {
        Some((algorithm, hash)) if !algorithm.is_empty() && !hash.is_empty() => {
            Ok((algorithm, hash))
        }
        _ => Err(Error::InvalidDigest(digest.to_string()).into()),
    }
}

/// Locates and extracts single files from OCI images.
pub struct OciFileExtractor {
    /// Globs to search for inside the unpacked image, e.g.
    /// `/release-manifest*.yaml`. First match wins.
    search_paths: Vec<String>,
    /// Root of the content-addressed store; each extracted file lands in a
    /// per-digest subdirectory.
    store: PathBuf,
    unpacker: Box<dyn OciUnpacker>,
    cancel: CancelToken,
}

impl OciFileExtractor {
    pub fn new(
        search_paths: Vec<String>,
        store: PathBuf,
        unpacker: Box<dyn OciUnpacker>,
        cancel: CancelToken,
    ) -> Result<Self> {
        fs::create_dir_all(&store)
            .with_context(|| format!("creating file store '{}'", store.display()))?;
        Ok(Self {
            search_paths,
            store,
            unpacker,
            cancel,
        })
    }

    /// Locate and extract the first matching file from the given OCI image.
    /// Returns the path of the copy inside the store. The unpacked image is
    /// not retained.
    pub fn extract_from(&self, uri: &str) -> Result<PathBuf> {
        let unpack_dir = TempDir::with_prefix("extracted-files-")
            .context("creating extraction scratch directory")?;

        let digest = self
            .unpacker
            .unpack(&self.cancel, uri, unpack_dir.path())
            .context("unpacking oci image")?;

        let found = self
            .find_file(unpack_dir.path())
            .context("locating file in unpacked OCI filesystem")?;

        let store_dir = self.file_store_path(&digest)?;
        fs::create_dir_all(&store_dir)
            .with_context(|| format!("creating file store directory '{}'", store_dir.display()))?;

        let _lock = lock_store_dir(&store_dir)?;
        let file_name = found
            .file_name()
            .with_context(|| format!("extracted path '{}' has no file name", found.display()))?;
        let in_store = store_dir.join(file_name);
        if !in_store.exists() {
            fs::copy(&found, &in_store).with_context(|| {
                format!("copying '{}' into the store", found.display())
            })?;
        }
        Ok(in_store)
    }

    fn find_file(&self, root: &Path) -> Result<PathBuf> {
        for pattern in &self.search_paths {
            let rooted = format!(
                "{}/{}",
                root.display(),
                pattern.trim_start_matches('/')
            );
            let matches = glob::glob(&rooted)
                .with_context(|| format!("invalid search pattern '{pattern}'"))?;
            for entry in matches.flatten() {
                if entry.is_file() {
                    return Ok(entry);
                }
            }
        }
        bail!(
            "no file matching {:?} found in unpacked image",
            self.search_paths
        )
    }

    /// `<store>/<hash[:64]>`, keyed by the digest hash alone.
    fn file_store_path(&self, digest: &str) -> Result<PathBuf> {
        let (_, hash) = split_digest(digest)?;
        let hash = &hash[..hash.len().min(MAX_HASH_LEN)];
        Ok(self.store.join(hash))
    }
}

fn lock_store_dir(dir: &Path) -> Result<File> {
    let lock_path = dir.join(".lock");
    let lock = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("creating store lock '{}'", lock_path.display()))?;
    lock.lock_exclusive()
        .with_context(|| format!("locking store directory '{}'", dir.display()))?;
    Ok(lock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeUnpacker {
        digest: String,
        files: Vec<(&'static str, &'static str)>,
        seen: Mutex<Vec<String>>,
    }

    impl OciUnpacker for FakeUnpacker {
        fn unpack(&self, _cancel: &CancelToken, uri: &str, dest: &Path) -> Result<String> {
            self.seen.lock().unwrap().push(uri.to_string());
            for (name, content) in &self.files {
                let path = dest.join(name);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, content)?;
            }
            Ok(self.digest.clone())
        }
    }

    fn extractor(tmp: &Path, digest: &str) -> OciFileExtractor {
        OciFileExtractor::new(
            vec!["release-manifest*.yaml".to_string()],
            tmp.join("store"),
            Box::new(FakeUnpacker {
                digest: digest.to_string(),
                files: vec![
                    ("release-manifest-3.1.2.yaml", "components: {}\n"),
                    ("unrelated.txt", "noise"),
                ],
                seen: Mutex::new(Vec::new()),
            }),
            CancelToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn extracts_into_digest_addressed_store() {
        let tmp = TempDir::new().unwrap();
        let extr = extractor(tmp.path(), "sha256:abcdef0123");

        let path = extr.extract_from("registry.suse.com/manifest:3.1.2").unwrap();
        assert_eq!(
            path,
            tmp.path()
                .join("store")
                .join("abcdef0123")
                .join("release-manifest-3.1.2.yaml")
        );
        assert_eq!(fs::read_to_string(&path).unwrap(), "components: {}\n");

        // Same digest resolves to the same store path.
        let again = extr.extract_from("registry.suse.com/manifest:3.1.2").unwrap();
        assert_eq!(again, path);
    }

    #[test]
    fn digest_hash_is_truncated_to_64() {
        let tmp = TempDir::new().unwrap();
        let long_hash = "a".repeat(80);
        let extr = extractor(tmp.path(), &format!("sha256:{long_hash}"));

        let path = extr.extract_from("registry.suse.com/manifest:x").unwrap();
        let dir_name = path.parent().unwrap().file_name().unwrap().to_str().unwrap();
        assert_eq!(dir_name.len(), 64);
    }

    #[test]
    fn malformed_digest_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let extr = extractor(tmp.path(), "not-a-digest");
        let err = extr.extract_from("registry.suse.com/manifest:x").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidDigest(_))
        ));
    }

    #[test]
    fn missing_file_fails() {
        let tmp = TempDir::new().unwrap();
        let extr = OciFileExtractor::new(
            vec!["/iso/*.iso".to_string()],
            tmp.path().join("store"),
            Box::new(FakeUnpacker {
                digest: "sha256:feed".to_string(),
                files: vec![],
                seen: Mutex::new(Vec::new()),
            }),
            CancelToken::new(),
        )
        .unwrap();
        let err = extr.extract_from("registry.suse.com/installer:x").unwrap_err();
        assert!(format!("{err:#}").contains("locating file"));
    }
}
