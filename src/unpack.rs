//! Unpacking of image sources onto a target tree.
//!
//! Dispatches on the [`Source`] kind: OCI images go through the unpacker
//! capability, directory and raw-image sources are rsynced, file sources are
//! copied. Overlay application uses a dedicated rsync flag set that leaves
//! ownership and permissions of pre-existing files alone.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

use crate::cancel::CancelToken;
use crate::deployment::Source;
use crate::manifest::OciUnpacker;
use crate::process::{Cmd, SharedRunner};

/// rsync flags used when applying an overlay tree onto a snapshot. They do
/// not keep permissions or ownership of pre-existing files and directories.
pub fn overlay_sync_flags() -> Vec<String> {
    [
        "--recursive",
        "--hard-links",
        "--links",
        "--info=progress2",
        "--human-readable",
        "--partial",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn archive_sync_flags() -> Vec<String> {
    vec!["--archive".to_string()]
}

pub struct Unpacker {
    runner: SharedRunner,
    oci: Box<dyn OciUnpacker>,
    rsync_flags: Vec<String>,
    cancel: CancelToken,
}

impl Unpacker {
    pub fn new(runner: SharedRunner, oci: Box<dyn OciUnpacker>, cancel: CancelToken) -> Self {
        Self {
            runner,
            oci,
            rsync_flags: archive_sync_flags(),
            cancel,
        }
    }

    pub fn with_rsync_flags(mut self, flags: Vec<String>) -> Self {
        self.rsync_flags = flags;
        self
    }

    pub fn runner(&self) -> &SharedRunner {
        &self.runner
    }

    /// Unpack `source` into `dest`. Returns the image digest for OCI
    /// sources.
    pub fn unpack(&self, source: &Source, dest: &Path) -> Result<Option<String>> {
        self.cancel.check()?;
        match source {
            Source::Oci(reference) => {
                let digest = self
                    .oci
                    .unpack(&self.cancel, reference, dest)
                    .with_context(|| format!("unpacking OCI image '{reference}'"))?;
                Ok(Some(digest))
            }
            Source::Dir(path) => {
                self.rsync_tree(path, dest)?;
                Ok(None)
            }
            Source::Raw(path) => {
                let mount = TempDir::with_prefix("elemental_raw-src")
                    .context("creating raw image mount point")?;
                Cmd::new(self.runner.as_ref(), "mount")
                    .args(["-o", "loop,ro"])
                    .arg_path(path)
                    .arg_path(mount.path())
                    .error_msg("mounting raw image source")
                    .run()?;
                let synced = self.rsync_tree(mount.path(), dest);
                let unmounted = Cmd::new(self.runner.as_ref(), "umount")
                    .arg_path(mount.path())
                    .error_msg("unmounting raw image source")
                    .run();
                synced?;
                unmounted?;
                Ok(None)
            }
            Source::File(path) => {
                let name = path
                    .file_name()
                    .with_context(|| format!("file source '{}' has no name", path.display()))?;
                fs::create_dir_all(dest).with_context(|| {
                    format!("creating unpack destination '{}'", dest.display())
                })?;
                fs::copy(path, dest.join(name)).with_context(|| {
                    format!("copying file source '{}'", path.display())
                })?;
                Ok(None)
            }
            Source::Empty => bail!("cannot unpack an empty source"),
        }
    }

    fn rsync_tree(&self, from: &Path, to: &Path) -> Result<()> {
        fs::create_dir_all(to)
            .with_context(|| format!("creating unpack destination '{}'", to.display()))?;
        Cmd::new(self.runner.as_ref(), "rsync")
            .args(self.rsync_flags.iter().cloned())
            .arg(format!("{}/", from.display()))
            .arg(format!("{}/", to.display()))
            .error_msg("syncing source tree")
            .run()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::FakeRunner;
    use std::sync::Arc;

    struct NoopOci;
    impl OciUnpacker for NoopOci {
        fn unpack(&self, _c: &CancelToken, _uri: &str, _dest: &Path) -> Result<String> {
            Ok("sha256:feed".to_string())
        }
    }

    #[test]
    fn dir_source_is_rsynced_with_flags() {
        let runner = Arc::new(FakeRunner::new());
        let tmp = tempfile::TempDir::new().unwrap();
        let unpacker = Unpacker::new(runner.clone(), Box::new(NoopOci), CancelToken::new())
            .with_rsync_flags(overlay_sync_flags());

        unpacker
            .unpack(&Source::dir("/srv/overlays"), tmp.path())
            .unwrap();

        let log = runner.argv_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0][0], "rsync");
        assert!(log[0].contains(&"--hard-links".to_string()));
        assert!(log[0].contains(&"--info=progress2".to_string()));
        assert_eq!(log[0].last().unwrap(), &format!("{}/", tmp.path().display()));
    }

    #[test]
    fn oci_source_returns_digest() {
        let runner = Arc::new(FakeRunner::new());
        let tmp = tempfile::TempDir::new().unwrap();
        let unpacker = Unpacker::new(runner, Box::new(NoopOci), CancelToken::new());
        let digest = unpacker
            .unpack(&Source::oci("registry.suse.com/base:6.2"), tmp.path())
            .unwrap();
        assert_eq!(digest.as_deref(), Some("sha256:feed"));
    }

    #[test]
    fn empty_source_is_rejected() {
        let runner = Arc::new(FakeRunner::new());
        let unpacker = Unpacker::new(runner, Box::new(NoopOci), CancelToken::new());
        assert!(unpacker.unpack(&Source::Empty, Path::new("/tmp/x")).is_err());
    }

    #[test]
    fn cancelled_token_stops_before_work() {
        let runner = Arc::new(FakeRunner::new());
        let cancel = CancelToken::new();
        cancel.cancel();
        let unpacker = Unpacker::new(runner.clone(), Box::new(NoopOci), cancel);
        assert!(unpacker
            .unpack(&Source::dir("/srv/x"), Path::new("/tmp/x"))
            .is_err());
        assert!(runner.argv_log().is_empty());
    }
}
