//! Installation pipeline.
//!
//! Drives the partitioner and the transaction engine for a sanitized
//! deployment: partition and format every disk, prepare the read-write
//! volumes, run a transaction that unpacks the OS source, apply the overlay
//! tree, run the configuration hook inside a chroot, and commit. Acquired
//! resources unwind through the clean-up stack in reverse order.

use anyhow::{Context, Result};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::cancel::CancelToken;
use crate::chroot;
use crate::cleanstack::CleanStack;
use crate::deployment::{Deployment, FileSystem, PartRole, Partition, SnapshotterKind, MiB};
use crate::error::Error;
use crate::manifest::extractor::SkopeoUnpacker;
use crate::process::{Cmd, SharedRunner};
use crate::repart;
use crate::selinux;
use crate::snapper::Snapper;
use crate::transaction::{
    BootUpdater, OverwriteTransaction, SnapperTransaction, ToolBootUpdater, Transaction,
    TransactionEngine,
};
use crate::unpack::{overlay_sync_flags, Unpacker};
use crate::{btrfs, deployment};

/// Bind target of the configuration hook inside the chroot.
const CONFIG_SCRIPT_PATH: &str = "/etc/elemental/config.sh";

/// Mount point of the live recovery media; its presence is the probe for
/// running from the recovery system.
pub const LIVE_MOUNT_POINT: &str = "/run/initramfs/live";

pub struct Installer {
    runner: SharedRunner,
    cancel: CancelToken,
    /// Use local container storage for OCI sources.
    local: bool,
}

impl Installer {
    pub fn new(runner: SharedRunner, cancel: CancelToken) -> Self {
        Self {
            runner,
            cancel,
            local: false,
        }
    }

    pub fn with_local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Install the deployment onto its target disks.
    pub fn install(&self, d: &mut Deployment) -> Result<()> {
        let mut cleanup = CleanStack::new();
        let outcome = self.run(d, &mut cleanup);
        cleanup.cleanup(outcome)
    }

    /// Re-run the install pipeline from the recovery system.
    pub fn reset(&self, d: &mut Deployment) -> Result<()> {
        if !self.is_recovery() {
            return Err(Error::NotInRecovery.into());
        }
        self.retarget_to_live_disk(d)
            .context("resolving the disk backing the recovery system")?;
        self.install(d)
    }

    /// True when the current process runs from the recovery system.
    pub fn is_recovery(&self) -> bool {
        Cmd::new(self.runner.as_ref(), "mountpoint")
            .args(["-q", LIVE_MOUNT_POINT])
            .run()
            .is_ok()
    }

    fn run(&self, d: &mut Deployment, cleanup: &mut CleanStack) -> Result<()> {
        self.cancel.check()?;

        let mut system_mount: Option<PathBuf> = None;
        for disk in &mut d.disks {
            repart::partition_and_format_device(&self.runner, disk)
                .with_context(|| format!("partitioning '{}'", disk.device))?;

            for part in &disk.partitions {
                if let Some(mount) = self.create_partition_volumes(part, cleanup)? {
                    if part.role == PartRole::System {
                        system_mount = Some(mount);
                    }
                }
            }
        }

        let root = system_mount.context("no mounted system partition")?;
        let engine = Rc::new(RefCell::new(self.transaction_engine(d, &root)));

        engine.borrow_mut().init(d).context("initializing the snapshotter")?;
        self.cancel.check()?;

        let trans = engine.borrow_mut().start().context("starting the transaction")?;
        {
            let engine = Rc::clone(&engine);
            let trans = trans.clone();
            cleanup.push_error_only(move || engine.borrow_mut().rollback(trans));
        }

        self.apply_transaction(d, engine.as_ref(), &trans)?;

        engine
            .borrow_mut()
            .commit(trans)
            .context("committing the transaction")?;
        Ok(())
    }

    fn apply_transaction(
        &self,
        d: &Deployment,
        engine: &RefCell<Box<dyn TransactionEngine>>,
        trans: &Transaction,
    ) -> Result<()> {
        let hook_runner = self.runner.clone();
        let hook_cancel = self.cancel.clone();
        let hook_deployment = d.clone();
        let hook = move |root: &Path| -> Result<()> {
            selinux::chrooted_relabel(&hook_runner, &hook_cancel, root)
                .context("relabelling the snapshot")?;
            hook_deployment
                .write_deployment_file(root)
                .context("writing the deployment file")?;
            Ok(())
        };

        engine
            .borrow_mut()
            .update(trans, &d.source_os, &hook)
            .context("updating the transaction")?;

        if let Some(overlay) = &d.overlay_tree {
            if !overlay.is_empty().context("probing the overlay tree")? {
                self.unpacker()
                    .with_rsync_flags(overlay_sync_flags())
                    .unpack(overlay, &trans.path)
                    .context("unpacking the overlay tree")?;
            }
        }

        if !d.cfg_script.is_empty() {
            self.config_hook(&d.cfg_script, &trans.path)
                .context("running the configuration hook")?;
        }
        Ok(())
    }

    /// Mount a partition that needs preparation and create its
    /// non-snapshotted subvolumes under the top subvolume.
    fn create_partition_volumes(
        &self,
        part: &Partition,
        cleanup: &mut CleanStack,
    ) -> Result<Option<PathBuf>> {
        if part.rw_volumes.is_empty() && part.role != PartRole::System {
            return Ok(None);
        }

        let mount = tempfile::Builder::new()
            .prefix(&format!("elemental_{}", part.role))
            .tempdir()
            .context("creating a scratch mount directory")?
            .keep();
        {
            let path = mount.clone();
            cleanup.push_success_only(move || {
                std::fs::remove_dir_all(&path)
                    .with_context(|| format!("removing '{}'", path.display()))
            });
        }

        Cmd::new(self.runner.as_ref(), "mount")
            .args(["-U", &part.uuid])
            .arg_path(&mount)
            .error_msg(&format!("mounting partition '{}'", part.label))
            .run()?;
        {
            let runner = self.runner.clone();
            let path = mount.clone();
            cleanup.push(move || {
                Cmd::new(runner.as_ref(), "umount")
                    .arg_path(&path)
                    .error_msg(&format!("unmounting '{}'", path.display()))
                    .run()
                    .map(|_| ())
            });
        }

        if part.file_system == FileSystem::Btrfs {
            btrfs::set_btrfs_partition(&self.runner, &mount)
                .context("preparing the btrfs volume layout")?;

            for volume in part.rw_volumes.iter().filter(|v| !v.snapshotted) {
                let subvolume = mount
                    .join(btrfs::TOP_SUBVOL)
                    .join(volume.path.display().to_string().trim_start_matches('/'));
                btrfs::create_subvolume(&self.runner, &subvolume, true)
                    .with_context(|| format!("creating subvolume '{}'", subvolume.display()))?;
            }
        }

        Ok(Some(mount))
    }

    fn transaction_engine(&self, d: &Deployment, root: &Path) -> Box<dyn TransactionEngine> {
        let boot: Box<dyn BootUpdater> = Box::new(ToolBootUpdater::new(
            self.runner.clone(),
            d.boot_config.bootloader,
        ));
        match d.snapshotter.name {
            SnapshotterKind::Snapper => Box::new(SnapperTransaction::new(
                Snapper::new(self.runner.clone()),
                self.unpacker(),
                boot,
                self.cancel.clone(),
                root.to_path_buf(),
            )),
            SnapshotterKind::Overwrite => Box::new(OverwriteTransaction::new(
                self.unpacker(),
                boot,
                self.cancel.clone(),
                root.to_path_buf(),
            )),
        }
    }

    fn unpacker(&self) -> Unpacker {
        Unpacker::new(
            self.runner.clone(),
            Box::new(SkopeoUnpacker::new(self.runner.clone(), self.local)),
            self.cancel.clone(),
        )
    }

    fn config_hook(&self, script: &str, root: &Path) -> Result<()> {
        tracing::info!("Running configuration hook");
        let binds = vec![(PathBuf::from(script), CONFIG_SCRIPT_PATH.to_string())];
        let (stdout, stderr) =
            chroot::run_chrooted(&self.runner, &self.cancel, root, &binds, &[CONFIG_SCRIPT_PATH])?;
        tracing::debug!(
            "config hook output:\n------- stdout -------\n{stdout}\
             ------- stderr -------\n{stderr}----------------------"
        );
        Ok(())
    }

    /// Point the system disk at the disk backing the live mount point.
    fn retarget_to_live_disk(&self, d: &mut Deployment) -> Result<()> {
        let out = Cmd::new(self.runner.as_ref(), "findmnt")
            .args(["-no", "SOURCE", LIVE_MOUNT_POINT])
            .error_msg("locating the live mount point source")
            .run()?;
        let source = String::from_utf8_lossy(&out).trim().to_string();

        let out = Cmd::new(self.runner.as_ref(), "lsblk")
            .args(["-no", "PKNAME", &source])
            .error_msg("locating the parent disk of the live partition")
            .run()?;
        let parent = String::from_utf8_lossy(&out).trim().to_string();
        if parent.is_empty() {
            anyhow::bail!("no parent disk found for '{source}'");
        }

        let disk = d
            .system_disk_mut()
            .context("no system partition found in deployment")?;
        disk.device = format!("/dev/{parent}");
        Ok(())
    }
}

/// Size of a directory tree in mebibytes, rounded up.
pub fn dir_size_mib(path: &Path) -> Result<MiB> {
    let mut bytes: u64 = 0;
    for entry in walkdir::WalkDir::new(path) {
        let entry = entry.with_context(|| format!("walking '{}'", path.display()))?;
        if entry.file_type().is_file() {
            bytes += entry
                .metadata()
                .with_context(|| format!("reading metadata of '{}'", entry.path().display()))?
                .len();
        }
    }
    Ok(deployment::MiB(bytes.div_ceil(1024 * 1024)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::Source;
    use crate::process::fake::{self, FakeRunner};
    use std::sync::Arc;
    use tempfile::TempDir;

    const SNAPPER_LIST: &str =
        r#"{"root": [{"number": 1, "default": true, "active": true, "userdata": null}]}"#;

    fn install_runner() -> Arc<FakeRunner> {
        Arc::new(FakeRunner::with_side_effect(|spec| {
            Ok(match spec.program.as_str() {
                "lsblk" if spec.args.contains(&"LOG-SEC".to_string()) => fake::ok_output("512\n"),
                "systemd-repart" => fake::ok_output(
                    r#"[{"uuid": "u0", "partno": 0}, {"uuid": "u1", "partno": 1}, {"uuid": "u2", "partno": 2}]"#,
                ),
                "env" => fake::ok_output("2"),
                "snapper" if spec.args.iter().any(|a| a == "list") => {
                    fake::ok_output(SNAPPER_LIST)
                }
                "btrfs" if spec.args.get(1).map(String::as_str) == Some("list") => {
                    fake::ok_output("ID 256 gen 5 top level 5 path @\n")
                }
                _ => fake::ok_output(""),
            })
        }))
    }

    fn deployment_with_overlay(base: &Path) -> Deployment {
        let mut d = Deployment::new();
        d.disks[0].device = "/dev/vda".to_string();

        let os_tree = base.join("os-tree");
        std::fs::create_dir_all(&os_tree).unwrap();
        std::fs::write(os_tree.join("marker"), b"x").unwrap();
        d.source_os = Source::dir(os_tree);

        let overlay = base.join("overlays");
        std::fs::create_dir_all(&overlay).unwrap();
        std::fs::write(overlay.join("marker"), b"x").unwrap();
        d.overlay_tree = Some(Source::dir(overlay));
        d
    }

    #[test]
    fn install_partitions_snapshots_and_commits() {
        let tmp = TempDir::new().unwrap();
        let runner = install_runner();
        let shared: SharedRunner = runner.clone();
        let mut d = deployment_with_overlay(tmp.path());
        d.sanitize().unwrap();

        let installer = Installer::new(shared, CancelToken::new());
        installer.install(&mut d).unwrap();

        // UUIDs were backfilled by the partitioner.
        assert_eq!(d.disks[0].partitions[0].uuid, "u0");
        assert_eq!(d.disks[0].partitions[2].uuid, "u2");

        let log = runner.argv_log();
        let programs: Vec<&str> = log.iter().map(|a| a[0].as_str()).collect();
        assert!(programs.contains(&"systemd-repart"));
        assert!(programs.contains(&"mount"));
        // Subvolumes for the non-snapshotted RW volumes were created.
        assert!(log.iter().any(|a| {
            a[0] == "btrfs"
                && a.get(1).map(String::as_str) == Some("subvolume")
                && a.iter().any(|s| s.ends_with("@/var"))
        }));
        // Snapshot flip happened on commit.
        assert!(log.iter().any(|a| a.contains(&"--default".to_string())));
        // The overlay rsync used the non-destructive flag set.
        let rsync = log.iter().find(|a| a[0] == "rsync").unwrap();
        assert!(rsync.contains(&"--hard-links".to_string()));
        // Every mount got unmounted.
        let mounts = log
            .iter()
            .filter(|a| a[0] == "mount" && a.get(1).map(String::as_str) == Some("-U"))
            .count();
        let umounts = log.iter().filter(|a| a[0] == "umount").count();
        assert!(umounts >= mounts);
    }

    #[test]
    fn update_failure_triggers_rollback() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::with_side_effect(|spec| {
            Ok(match spec.program.as_str() {
                "lsblk" if spec.args.contains(&"LOG-SEC".to_string()) => fake::ok_output("512\n"),
                "systemd-repart" => fake::ok_output(
                    r#"[{"uuid": "u0", "partno": 0}, {"uuid": "u1", "partno": 1}, {"uuid": "u2", "partno": 2}]"#,
                ),
                "env" => fake::ok_output("2"),
                "snapper" if spec.args.iter().any(|a| a == "list") => {
                    fake::ok_output(SNAPPER_LIST)
                }
                "btrfs" if spec.args.get(1).map(String::as_str) == Some("list") => {
                    fake::ok_output("ID 256 gen 5 top level 5 path @\n")
                }
                "rsync" if spec.args.iter().any(|a| a.contains("overlays")) => {
                    fake::failed_output("", "rsync exploded")
                }
                _ => fake::ok_output(""),
            })
        }));
        let shared: SharedRunner = runner.clone();
        let mut d = deployment_with_overlay(tmp.path());
        d.sanitize().unwrap();

        let installer = Installer::new(shared, CancelToken::new());
        let err = installer.install(&mut d).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("unpacking the overlay tree"), "got: {msg}");

        // The started snapshot was rolled back: its subvolume got deleted.
        let log = runner.argv_log();
        assert!(log.iter().any(|a| {
            a[0] == "btrfs"
                && a.contains(&"delete".to_string())
                && a.iter().any(|s| s.contains(".snapshots/2/snapshot"))
        }));
    }

    #[test]
    fn reset_outside_recovery_is_refused() {
        let runner = Arc::new(FakeRunner::with_side_effect(|spec| {
            Ok(match spec.program.as_str() {
                "mountpoint" => fake::failed_output("", ""),
                _ => fake::ok_output(""),
            })
        }));
        let shared: SharedRunner = runner;
        let mut d = Deployment::new();
        d.source_os = Source::oci("registry.suse.com/base:6.2");

        let installer = Installer::new(shared, CancelToken::new());
        let err = installer.reset(&mut d).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::NotInRecovery)
        ));
    }

    #[test]
    fn dir_size_rounds_up_to_mib() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("small"), vec![0u8; 100]).unwrap();
        assert_eq!(dir_size_mib(tmp.path()).unwrap(), MiB(1));

        std::fs::write(tmp.path().join("big"), vec![0u8; 2 * 1024 * 1024]).unwrap();
        assert_eq!(dir_size_mib(tmp.path()).unwrap(), MiB(3));
    }
}
