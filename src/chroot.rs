//! Chrooted command execution.
//!
//! Binds the API filesystems plus any caller-provided paths into the target
//! root, runs a command through `chroot`, and tears the binds down in
//! reverse order. Both output streams are captured for debug logging.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::process::{Cmd, SharedRunner};

const API_MOUNTS: &[&str] = &["/dev", "/proc", "/sys"];

/// Run `argv` chrooted into `root` with the given extra bind mounts
/// (`host path -> path inside the chroot`). Returns captured stdout and
/// stderr.
pub fn run_chrooted(
    runner: &SharedRunner,
    cancel: &CancelToken,
    root: &Path,
    binds: &[(PathBuf, String)],
    argv: &[&str],
) -> Result<(String, String)> {
    cancel.check()?;

    let mut mounted: Vec<PathBuf> = Vec::new();
    let result = (|| -> Result<(String, String)> {
        for api in API_MOUNTS {
            let target = root.join(api.trim_start_matches('/'));
            fs::create_dir_all(&target)
                .with_context(|| format!("creating '{}'", target.display()))?;
            Cmd::new(runner.as_ref(), "mount")
                .args(["--bind", api])
                .arg_path(&target)
                .error_msg(&format!("bind mounting '{api}'"))
                .run()?;
            mounted.push(target);
        }

        for (source, dest) in binds {
            let target = root.join(dest.trim_start_matches('/'));
            if source.is_dir() {
                fs::create_dir_all(&target)
                    .with_context(|| format!("creating '{}'", target.display()))?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("creating '{}'", parent.display()))?;
                }
                if !target.exists() {
                    fs::write(&target, b"").with_context(|| {
                        format!("creating bind target '{}'", target.display())
                    })?;
                }
            }
            Cmd::new(runner.as_ref(), "mount")
                .args(["--bind"])
                .arg_path(source)
                .arg_path(&target)
                .error_msg(&format!("bind mounting '{}'", source.display()))
                .run()?;
            mounted.push(target);
        }

        cancel.check()?;
        let out = Cmd::new(runner.as_ref(), "chroot")
            .arg_path(root)
            .args(argv.iter().copied())
            .error_msg("running chrooted command")
            .run();

        match out {
            Ok(stdout) => Ok((String::from_utf8_lossy(&stdout).into_owned(), String::new())),
            Err(err) => Err(err),
        }
    })();

    let mut umount_err: Option<anyhow::Error> = None;
    for target in mounted.iter().rev() {
        if let Err(err) = Cmd::new(runner.as_ref(), "umount")
            .arg_path(target)
            .error_msg(&format!("unmounting '{}'", target.display()))
            .run()
        {
            umount_err.get_or_insert(err);
        }
    }

    match (result, umount_err) {
        (Ok(out), None) => Ok(out),
        (Ok(_), Some(err)) => Err(err),
        (Err(primary), Some(cleanup)) => {
            Err(primary.context(format!("cleanup also failed: {cleanup:#}")))
        }
        (Err(primary), None) => Err(primary),
    }
}
