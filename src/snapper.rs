//! snapper command wrapper.
//!
//! Thin argv-level wrapper over the `snapper` CLI and the snapper
//! installation helper, plus the root configuration file management the
//! snapshotter needs. All invocations go through the shared runner so tests
//! can assert exact command sequences.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::btrfs;
use crate::process::{Cmd, SharedRunner};

/// snapper installation helper used to seed the first snapshot.
pub const INSTALLER: &str = "/usr/lib/snapper/installation-helper";

/// Id of the first root snapshot created at install time.
pub const FIRST_SNAPSHOT_ID: u64 = 1;

/// Default cap on the total number of snapshots kept after commit.
pub const DEFAULT_MAX_SNAPSHOTS: usize = 4;

pub type Userdata = BTreeMap<String, String>;

#[derive(Debug, Clone, Deserialize)]
pub struct Snapshot {
    pub number: u64,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub userdata: Option<Userdata>,
}

#[derive(Debug, Clone, Default)]
pub struct Snapshots(pub Vec<Snapshot>);

impl Snapshots {
    pub fn get_default(&self) -> Option<u64> {
        self.0.iter().find(|s| s.default).map(|s| s.number)
    }

    pub fn get_active(&self) -> Option<u64> {
        self.0.iter().find(|s| s.active).map(|s| s.number)
    }

    pub fn get_with_userdata(&self, key: &str, value: &str) -> Vec<u64> {
        self.0
            .iter()
            .filter(|s| {
                s.userdata
                    .as_ref()
                    .and_then(|u| u.get(key))
                    .is_some_and(|v| v == value)
            })
            .map(|s| s.number)
            .collect()
    }
}

pub struct Snapper {
    runner: SharedRunner,
}

impl Snapper {
    pub fn new(runner: SharedRunner) -> Self {
        Self { runner }
    }

    /// Seed the first root snapshot (id 1) through the installation helper.
    pub fn first_root_snapshot(&self, root: &Path, userdata: &Userdata) -> Result<u64> {
        let mut cmd = Cmd::new(self.runner.as_ref(), INSTALLER)
            .args(["--root-prefix"])
            .arg_path(root)
            .args(["--step", "config"]);
        if !userdata.is_empty() {
            cmd = cmd.args(["--userdata", &userdata_flag(userdata)]);
        }
        cmd.run().context("creating initial snapshot")?;
        Ok(FIRST_SNAPSHOT_ID)
    }

    /// Initialize the btrfs subvolume layout the snapshotter expects.
    pub fn init_root_volumes(&self, root: &Path) -> Result<()> {
        Cmd::new(self.runner.as_ref(), INSTALLER)
            .args(["--root-prefix"])
            .arg_path(root)
            .args(["--step", "filesystem"])
            .run()
            .context("initiating btrfs subvolumes")?;
        Ok(())
    }

    /// Create a snapper configuration for an arbitrary subvolume path, e.g.
    /// `/etc` on the snapshotted system.
    pub fn create_config(&self, root: &Path, volume_path: &str) -> Result<()> {
        let name = config_name(volume_path);
        Cmd::new(self.runner.as_ref(), "snapper")
            .args(["--no-dbus", "--root"])
            .arg_path(root)
            .args(["-c", &name, "create-config", "--fstype", "btrfs", volume_path])
            .run()
            .context("creating snapper configuration")?;
        Ok(())
    }

    /// Create a new snapshot, optionally read-write and based on another
    /// one, and return its number.
    pub fn create_snapshot(
        &self,
        root: &Path,
        config: &str,
        base_id: u64,
        read_write: bool,
        description: &str,
        userdata: &Userdata,
    ) -> Result<u64> {
        let config = if config.is_empty() { "root" } else { config };
        let mut cmd = Cmd::new(self.runner.as_ref(), "env")
            .args(["LC_ALL=C", "snapper", "--no-dbus"]);
        if !root.as_os_str().is_empty() {
            cmd = cmd.arg("--root").arg_path(root);
        }
        cmd = cmd
            .args(["-c", config, "create", "--print-number", "-c", "number"]);
        if !userdata.is_empty() {
            cmd = cmd.args(["--userdata", &userdata_flag(userdata)]);
        }
        if !description.is_empty() {
            cmd = cmd.args(["--description", description]);
        }
        if read_write {
            cmd = cmd.arg("--read-write");
        }
        if base_id > 0 {
            cmd = cmd.args(["--from", &base_id.to_string()]);
        }

        let out = cmd.run().context("creating a new snapshot")?;
        String::from_utf8_lossy(&out)
            .trim()
            .parse::<u64>()
            .context("parsing the created snapshot number")
    }

    /// Mark a snapshot as the new default.
    pub fn set_default(&self, root: &Path, id: u64, userdata: &Userdata) -> Result<()> {
        let mut cmd = Cmd::new(self.runner.as_ref(), "snapper")
            .args(["--no-dbus", "--root"])
            .arg_path(root)
            .args(["modify", "--default"]);
        if !userdata.is_empty() {
            cmd = cmd.args(["--userdata", &userdata_flag(userdata)]);
        }
        cmd.arg(id.to_string()).run()?;
        Ok(())
    }

    /// Toggle a snapshot between read-write and read-only.
    pub fn set_permissions(&self, root: &Path, id: u64, read_write: bool) -> Result<()> {
        let flag = if read_write {
            "--read-write"
        } else {
            "--read-only"
        };
        Cmd::new(self.runner.as_ref(), "snapper")
            .args(["--no-dbus", "--root"])
            .arg_path(root)
            .args(["modify", flag, &id.to_string()])
            .run()?;
        Ok(())
    }

    /// Run `snapper status` between two snapshots, writing to a file.
    pub fn status(
        &self,
        root: &Path,
        config: &str,
        output_file: &Path,
        from: u64,
        to: u64,
    ) -> Result<()> {
        let config = if config.is_empty() { "root" } else { config };
        let mut cmd = Cmd::new(self.runner.as_ref(), "env")
            .args(["LC_ALL=C", "snapper", "--no-dbus"]);
        if !root.as_os_str().is_empty() {
            cmd = cmd.arg("--root").arg_path(root);
        }
        cmd.args(["-c", config, "status", "--output"])
            .arg_path(output_file)
            .arg(format!("{from}..{to}"))
            .run()?;
        Ok(())
    }

    /// List the snapshots of a configuration.
    pub fn list_snapshots(&self, root: &Path, config: &str) -> Result<Snapshots> {
        let out = Cmd::new(self.runner.as_ref(), "snapper")
            .args(["--no-dbus", "--root"])
            .arg_path(root)
            .args([
                "-c",
                config,
                "--jsonout",
                "list",
                "--columns",
                "number,default,active,userdata",
            ])
            .run()
            .context("collecting snapshots")?;

        let mut parsed: BTreeMap<String, Vec<Snapshot>> = serde_json::from_slice(&out)
            .context("unmarshalling snapshots")?;
        match parsed.remove(config) {
            Some(snapshots) => Ok(Snapshots(snapshots)),
            None => Err(anyhow::anyhow!(
                "invalid json object, no '{config}' key found"
            ))
            .context("unmarshalling snapshots"),
        }
    }

    /// Remove oldest non-default, non-active snapshots until the total count
    /// is not above `max_snapshots`.
    pub fn cleanup(&self, root: &Path, max_snapshots: usize) -> Result<()> {
        let snapshots = self
            .list_snapshots(root, "root")
            .context("listing snapshots")?;
        let total = snapshots.0.len();
        if total <= max_snapshots {
            return Ok(());
        }

        let mut deletable: Vec<u64> = snapshots
            .0
            .iter()
            .filter(|s| !s.default && !s.active && s.number != 0)
            .map(|s| s.number)
            .collect();
        deletable.sort_unstable();

        let excess = total - max_snapshots;
        for number in deletable.into_iter().take(excess) {
            let path = snapshot_path(root, number);
            btrfs::delete_subvolume(&self.runner, &path)
                .with_context(|| format!("cleaning up snapshot {number}"))?;
        }
        Ok(())
    }

    /// Write the snapper root configuration: no timeline snapshots and a
    /// number-cleanup limit of `1-<max>`.
    pub fn configure_root(&self, root: &Path, max_snapshots: usize) -> Result<()> {
        let template = root.join("usr/share/snapper/config-templates/default");
        let config_dir = root.join("etc/snapper/configs");
        let config = config_dir.join("root");
        if !config_dir.is_dir() {
            bail!(
                "snapper configs directory '{}' does not exist",
                config_dir.display()
            );
        }

        let mut content = fs::read_to_string(&template)
            .with_context(|| format!("reading snapper template '{}'", template.display()))?;
        content = override_env_var(&content, "TIMELINE_CREATE", "no");
        content = override_env_var(&content, "NUMBER_LIMIT", &format!("1-{max_snapshots}"));
        fs::write(&config, content)
            .with_context(|| format!("writing snapper config '{}'", config.display()))?;

        let sysconfig = root.join("etc/sysconfig/snapper");
        let current = fs::read_to_string(&sysconfig)
            .with_context(|| format!("reading '{}'", sysconfig.display()))?;
        let updated = override_env_var(&current, "SNAPPER_CONFIGS", "\"root\"");
        fs::write(&sysconfig, updated)
            .with_context(|| format!("writing '{}'", sysconfig.display()))?;
        Ok(())
    }
}

/// `<root>/.snapshots/<number>/snapshot`
pub fn snapshot_path(root: &Path, number: u64) -> PathBuf {
    root.join(".snapshots").join(number.to_string()).join("snapshot")
}

fn config_name(volume_path: &str) -> String {
    volume_path.trim_matches('/').replace('/', "_")
}

fn userdata_flag(userdata: &Userdata) -> String {
    userdata
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Replace or append a `KEY=value` line in an env-style file.
fn override_env_var(content: &str, key: &str, value: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut replaced = false;
    for line in content.lines() {
        if line.trim_start().starts_with(&format!("{key}=")) {
            lines.push(format!("{key}={value}"));
            replaced = true;
        } else {
            lines.push(line.to_string());
        }
    }
    if !replaced {
        lines.push(format!("{key}={value}"));
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::{self, FakeRunner};
    use std::sync::Arc;

    const SNAPPER_LIST: &str = r#"{
  "root": [
    {"number": 0, "default": false, "active": false, "userdata": null},
    {"number": 192, "default": true, "active": true, "userdata": null},
    {"number": 336, "default": false, "active": false, "userdata": {"important": "no"}},
    {"number": 337, "default": false, "active": false, "userdata": {"important": "yes"}},
    {"number": 338, "default": false, "active": false, "userdata": {"important": "yes"}}
  ]
}"#;

    fn snapper_with(runner: Arc<FakeRunner>) -> Snapper {
        Snapper::new(runner)
    }

    #[test]
    fn configures_first_root_snapshot() {
        let runner = Arc::new(FakeRunner::new());
        let snap = snapper_with(runner.clone());
        let id = snap
            .first_root_snapshot(Path::new("/some/root"), &Userdata::new())
            .unwrap();
        assert_eq!(id, FIRST_SNAPSHOT_ID);
        assert!(runner.cmds_match(&[&[
            INSTALLER,
            "--root-prefix",
            "/some/root",
            "--step",
            "config"
        ]]));
    }

    #[test]
    fn first_snapshot_failure_carries_output() {
        let runner = Arc::new(FakeRunner::with_side_effect(|_| {
            Ok(fake::failed_output("<creation-output>", ""))
        }));
        let snap = snapper_with(runner);
        let err = snap
            .first_root_snapshot(Path::new("/some/root"), &Userdata::new())
            .unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("creating initial snapshot"), "got: {msg}");
        assert!(msg.contains("<creation-output>"), "got: {msg}");
    }

    #[test]
    fn initiates_root_volumes() {
        let runner = Arc::new(FakeRunner::new());
        let snap = snapper_with(runner.clone());
        snap.init_root_volumes(Path::new("/some/root")).unwrap();
        assert!(runner.cmds_match(&[&[
            INSTALLER,
            "--root-prefix",
            "/some/root",
            "--step",
            "filesystem"
        ]]));
    }

    #[test]
    fn creates_a_new_configuration() {
        let runner = Arc::new(FakeRunner::new());
        let snap = snapper_with(runner.clone());
        snap.create_config(Path::new("/some/root"), "/etc/systemd/")
            .unwrap();
        assert!(runner.cmds_match(&[&[
            "snapper",
            "--no-dbus",
            "--root",
            "/some/root",
            "-c",
            "etc_systemd",
            "create-config",
            "--fstype",
            "btrfs",
            "/etc/systemd/",
        ]]));
    }

    #[test]
    fn creates_a_new_snapshot() {
        let runner = Arc::new(FakeRunner::with_side_effect(|_| Ok(fake::ok_output("4"))));
        let snap = snapper_with(runner.clone());
        let mut userdata = Userdata::new();
        userdata.insert("key".to_string(), "value".to_string());

        let id = snap
            .create_snapshot(Path::new("/some/root"), "", 3, true, "description", &userdata)
            .unwrap();
        assert_eq!(id, 4);
        assert!(runner.cmds_match(&[&[
            "env",
            "LC_ALL=C",
            "snapper",
            "--no-dbus",
            "--root",
            "/some/root",
            "-c",
            "root",
            "create",
            "--print-number",
            "-c",
            "number",
            "--userdata",
            "key=value",
            "--description",
            "description",
            "--read-write",
            "--from",
            "3",
        ]]));
    }

    #[test]
    fn snapshot_number_must_parse() {
        let runner = Arc::new(FakeRunner::with_side_effect(|_| {
            Ok(fake::ok_output("wrong"))
        }));
        let snap = snapper_with(runner);
        assert!(snap
            .create_snapshot(Path::new("/some/root"), "", 3, true, "d", &Userdata::new())
            .is_err());
    }

    #[test]
    fn sets_default_snapshot() {
        let runner = Arc::new(FakeRunner::new());
        let snap = snapper_with(runner.clone());
        snap.set_default(Path::new("/some/root"), 3, &Userdata::new())
            .unwrap();
        assert!(runner.cmds_match(&[&[
            "snapper",
            "--no-dbus",
            "--root",
            "/some/root",
            "modify",
            "--default",
            "3",
        ]]));
    }

    #[test]
    fn sets_snapshot_permissions() {
        let runner = Arc::new(FakeRunner::new());
        let snap = snapper_with(runner.clone());
        snap.set_permissions(Path::new("/some/root"), 3, true).unwrap();
        snap.set_permissions(Path::new("/some/root"), 3, false).unwrap();
        assert!(runner.cmds_match(&[
            &["snapper", "--no-dbus", "--root", "/some/root", "modify", "--read-write", "3"],
            &["snapper", "--no-dbus", "--root", "/some/root", "modify", "--read-only", "3"],
        ]));
    }

    #[test]
    fn status_writes_to_file() {
        let runner = Arc::new(FakeRunner::new());
        let snap = snapper_with(runner.clone());
        snap.status(Path::new("/some/root"), "", Path::new("/status_file"), 3, 4)
            .unwrap();
        snap.status(Path::new(""), "etc", Path::new("/status_file"), 3, 4)
            .unwrap();
        assert!(runner.cmds_match(&[
            &[
                "env", "LC_ALL=C", "snapper", "--no-dbus", "--root", "/some/root",
                "-c", "root", "status", "--output", "/status_file", "3..4",
            ],
            &[
                "env", "LC_ALL=C", "snapper", "--no-dbus", "-c", "etc", "status",
                "--output", "/status_file", "3..4",
            ],
        ]));
    }

    #[test]
    fn lists_snapshots() {
        let runner = Arc::new(FakeRunner::with_side_effect(|_| {
            Ok(fake::ok_output(SNAPPER_LIST))
        }));
        let snap = snapper_with(runner);
        let snaps = snap.list_snapshots(Path::new("/some/root"), "root").unwrap();
        assert_eq!(snaps.get_active(), Some(192));
        assert_eq!(snaps.get_default(), Some(192));
        assert_eq!(snaps.get_with_userdata("important", "no"), vec![336]);
    }

    #[test]
    fn listing_unknown_config_fails() {
        let runner = Arc::new(FakeRunner::with_side_effect(|_| {
            Ok(fake::ok_output(SNAPPER_LIST))
        }));
        let snap = snapper_with(runner);
        let err = snap
            .list_snapshots(Path::new("/some/root"), "wrong")
            .unwrap_err();
        assert!(format!("{err:#}")
            .contains("unmarshalling snapshots: invalid json object, no 'wrong' key found"));
    }

    #[test]
    fn listing_bad_json_fails() {
        let runner = Arc::new(FakeRunner::with_side_effect(|_| {
            Ok(fake::ok_output("this is not a json"))
        }));
        let snap = snapper_with(runner);
        let err = snap.list_snapshots(Path::new("/some/root"), "root").unwrap_err();
        assert!(format!("{err:#}").contains("unmarshalling snapshots"));
    }

    #[test]
    fn cleanup_below_cap_deletes_nothing() {
        let runner = Arc::new(FakeRunner::with_side_effect(|_| {
            Ok(fake::ok_output(SNAPPER_LIST))
        }));
        let snap = snapper_with(runner.clone());
        snap.cleanup(Path::new("/some/root"), 5).unwrap();
        assert_eq!(runner.argv_log().len(), 1);
    }

    #[test]
    fn cleanup_deletes_oldest_until_cap() {
        let runner = Arc::new(FakeRunner::with_side_effect(|spec| {
            Ok(match spec.program.as_str() {
                "snapper" => fake::ok_output(SNAPPER_LIST),
                _ => fake::ok_output(""),
            })
        }));
        let snap = snapper_with(runner.clone());
        // Five snapshots, cap of 3: the two oldest deletable ones go.
        snap.cleanup(Path::new("/some/root"), 3).unwrap();
        assert!(runner.cmds_match(&[
            &["snapper"],
            &["btrfs", "property", "set", "/some/root/.snapshots/336/snapshot"],
            &["btrfs", "subvolume", "delete"],
            &["btrfs", "property", "set", "/some/root/.snapshots/337/snapshot"],
            &["btrfs", "subvolume", "delete"],
        ]));
    }

    #[test]
    fn cleanup_delete_failure_is_labelled() {
        let runner = Arc::new(FakeRunner::with_side_effect(|spec| {
            Ok(match spec.program.as_str() {
                "snapper" => fake::ok_output(SNAPPER_LIST),
                "btrfs" if spec.args.first().map(String::as_str) == Some("subvolume") => {
                    fake::failed_output("", "delete failed")
                }
                _ => fake::ok_output(""),
            })
        }));
        let snap = snapper_with(runner);
        let err = snap.cleanup(Path::new("/some/root"), 2).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("cleaning up snapshot"), "got: {msg}");
        assert!(msg.contains("deleting subvolume"), "got: {msg}");
    }

    #[test]
    fn configures_root_with_limits() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("etc/snapper/configs")).unwrap();
        fs::create_dir_all(root.join("etc/sysconfig")).unwrap();
        fs::create_dir_all(root.join("usr/share/snapper/config-templates")).unwrap();
        fs::write(
            root.join("usr/share/snapper/config-templates/default"),
            "TIMELINE_CREATE=yes\nNUMBER_CLEANUP=yes\n",
        )
        .unwrap();
        fs::write(root.join("etc/sysconfig/snapper"), "SNAPPER_CONFIGS=\"\"\n").unwrap();

        let runner = Arc::new(FakeRunner::new());
        let snap = snapper_with(runner);
        snap.configure_root(root, 4).unwrap();

        let config = fs::read_to_string(root.join("etc/snapper/configs/root")).unwrap();
        assert!(config.contains("TIMELINE_CREATE=no"));
        assert!(config.contains("NUMBER_LIMIT=1-4"));
        let sysconfig = fs::read_to_string(root.join("etc/sysconfig/snapper")).unwrap();
        assert!(sysconfig.contains("SNAPPER_CONFIGS=\"root\""));
    }
}
