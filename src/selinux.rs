//! SELinux relabeling of freshly unpacked roots.

use anyhow::Result;
use std::path::Path;

use crate::cancel::CancelToken;
use crate::chroot;
use crate::process::SharedRunner;

const FILE_CONTEXTS: &str = "etc/selinux/targeted/contexts/files/file_contexts";

/// Relabel the whole tree under `root` from inside a chroot. A no-op when
/// the unpacked OS carries no SELinux policy.
pub fn chrooted_relabel(runner: &SharedRunner, cancel: &CancelToken, root: &Path) -> Result<()> {
    if !root.join(FILE_CONTEXTS).is_file() {
        tracing::debug!(
            "no SELinux file contexts under '{}', skipping relabel",
            root.display()
        );
        return Ok(());
    }

    let contexts = format!("/{FILE_CONTEXTS}");
    let (stdout, stderr) = chroot::run_chrooted(
        runner,
        cancel,
        root,
        &[],
        &[
            "setfiles", "-F", "-e", "/proc", "-e", "/sys", "-e", "/dev", &contexts, "/",
        ],
    )?;
    tracing::debug!("setfiles output:\n{stdout}{stderr}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::FakeRunner;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn skips_without_policy() {
        let runner = Arc::new(FakeRunner::new());
        let shared: SharedRunner = runner.clone();
        let tmp = TempDir::new().unwrap();
        chrooted_relabel(&shared, &CancelToken::new(), tmp.path()).unwrap();
        assert!(runner.argv_log().is_empty());
    }

    #[test]
    fn relabels_when_policy_present() {
        let runner = Arc::new(FakeRunner::new());
        let shared: SharedRunner = runner.clone();
        let tmp = TempDir::new().unwrap();
        let contexts = tmp.path().join(FILE_CONTEXTS);
        std::fs::create_dir_all(contexts.parent().unwrap()).unwrap();
        std::fs::write(&contexts, "").unwrap();

        chrooted_relabel(&shared, &CancelToken::new(), tmp.path()).unwrap();
        let log = runner.argv_log();
        let chroot_cmd = log.iter().find(|a| a[0] == "chroot").unwrap();
        assert!(chroot_cmd.contains(&"setfiles".to_string()));
    }
}
