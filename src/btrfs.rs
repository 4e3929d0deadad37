//! btrfs subvolume helpers.

use anyhow::{Context, Result};
use std::path::Path;

use crate::process::{Cmd, SharedRunner};

/// Name of the top-level subvolume holding all others.
pub const TOP_SUBVOL: &str = "@";

/// Prepare a freshly formatted btrfs partition: create the top subvolume and
/// make it the default.
pub fn set_btrfs_partition(runner: &SharedRunner, mountpoint: &Path) -> Result<()> {
    let top = mountpoint.join(TOP_SUBVOL);
    create_subvolume(runner, &top, false)?;
    let out = Cmd::new(runner.as_ref(), "btrfs")
        .args(["subvolume", "list", "-o"])
        .arg_path(mountpoint)
        .error_msg("listing btrfs subvolumes")
        .run()?;
    let id = parse_subvolume_id(&String::from_utf8_lossy(&out), TOP_SUBVOL)
        .context("locating the top subvolume id")?;
    Cmd::new(runner.as_ref(), "btrfs")
        .args(["subvolume", "set-default", &id.to_string()])
        .arg_path(mountpoint)
        .error_msg("setting the default btrfs subvolume")
        .run()?;
    Ok(())
}

/// Create a subvolume, optionally creating missing parent directories.
pub fn create_subvolume(runner: &SharedRunner, path: &Path, parents: bool) -> Result<()> {
    if parents {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating subvolume parent '{}'", parent.display()))?;
        }
    }
    Cmd::new(runner.as_ref(), "btrfs")
        .args(["subvolume", "create"])
        .arg_path(path)
        .error_msg(&format!("creating subvolume '{}'", path.display()))
        .run()?;
    Ok(())
}

/// Delete a subvolume after clearing its read-only property.
pub fn delete_subvolume(runner: &SharedRunner, path: &Path) -> Result<()> {
    Cmd::new(runner.as_ref(), "btrfs")
        .args(["property", "set"])
        .arg_path(path)
        .args(["ro", "false"])
        .error_msg("clearing read-only property")
        .run()
        .context("setting subvolume writable")?;
    Cmd::new(runner.as_ref(), "btrfs")
        .args(["subvolume", "delete", "-R"])
        .arg_path(path)
        .error_msg("deleting subvolume")
        .run()
        .context("deleting subvolume")?;
    Ok(())
}

fn parse_subvolume_id(listing: &str, name: &str) -> Option<u64> {
    // `btrfs subvolume list` lines look like:
    // ID 256 gen 10 top level 5 path @
    for line in listing.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.last() == Some(&name) && fields.first() == Some(&"ID") {
            if let Some(id) = fields.get(1).and_then(|v| v.parse().ok()) {
                return Some(id);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::{self, FakeRunner};
    use std::sync::Arc;

    #[test]
    fn parses_subvolume_listing() {
        let listing = "ID 256 gen 10 top level 5 path @\nID 257 gen 11 top level 256 path @/var\n";
        assert_eq!(parse_subvolume_id(listing, "@"), Some(256));
        assert_eq!(parse_subvolume_id(listing, "@/var"), Some(257));
        assert_eq!(parse_subvolume_id(listing, "missing"), None);
    }

    #[test]
    fn set_partition_creates_and_defaults_top_subvolume() {
        let runner = Arc::new(FakeRunner::with_side_effect(|spec| {
            if spec.args.first().map(String::as_str) == Some("subvolume")
                && spec.args.get(1).map(String::as_str) == Some("list")
            {
                return Ok(fake::ok_output("ID 256 gen 10 top level 5 path @\n"));
            }
            Ok(fake::ok_output(""))
        }));
        let shared: SharedRunner = runner.clone();

        set_btrfs_partition(&shared, Path::new("/mnt/sys")).unwrap();
        assert!(runner.cmds_match(&[
            &["btrfs", "subvolume", "create", "/mnt/sys/@"],
            &["btrfs", "subvolume", "list", "-o", "/mnt/sys"],
            &["btrfs", "subvolume", "set-default", "256", "/mnt/sys"],
        ]));
    }

    #[test]
    fn delete_clears_read_only_first() {
        let runner = Arc::new(FakeRunner::new());
        let shared: SharedRunner = runner.clone();

        delete_subvolume(&shared, Path::new("/.snapshots/2/snapshot")).unwrap();
        assert!(runner.cmds_match(&[
            &["btrfs", "property", "set", "/.snapshots/2/snapshot", "ro", "false"],
            &["btrfs", "subvolume", "delete", "-R", "/.snapshots/2/snapshot"],
        ]));
    }
}
