//! Typed description of what will be written to disk.
//!
//! A [`Deployment`] aggregates disks, partitions, read-write volumes, the OS
//! source, boot configuration and security policy. It is composed from
//! defaults plus overrides, mutated by the partitioner (assigned UUIDs) and
//! the transaction engine (committed snapshot id), and finally serialized to
//! `/etc/elemental/deployment.yaml` on the target rootfs where it becomes the
//! single source of truth for later upgrades and resets.

pub mod merge;
pub mod source;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Error;
pub use source::Source;

pub const EFI_LABEL: &str = "EFI";
pub const RECOVERY_LABEL: &str = "RECOVERY";
pub const SYSTEM_LABEL: &str = "SYSTEM";
pub const CONFIG_LABEL: &str = "CONFIG";

pub const EFI_MNT: &str = "/boot/efi";
pub const SYSTEM_MNT: &str = "/";
/// Mount point of the first-boot configuration partition.
pub const CONFIG_MNT: &str = "/run/elemental/config";

pub const EFI_SIZE: MiB = MiB(1024);
pub const RECOVERY_SIZE: MiB = MiB(2048);
/// Size 0 marks the all-remaining partition; it must be last on its disk.
pub const ALL_AVAILABLE_SIZE: MiB = MiB(0);
/// Minimum size of an injected first-boot configuration partition.
pub const CONFIG_PART_SIZE: MiB = MiB(256);

/// Directory on the target rootfs holding the deployment state.
pub const DEPLOYMENT_DIR: &str = "etc/elemental";
pub const DEPLOYMENT_FILE: &str = "deployment.yaml";

/// Kernel cmdline argument enforced under the FIPS crypto policy.
pub const FIPS_CMDLINE: &str = "fips=1";

/// Partition size in mebibytes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MiB(pub u64);

impl MiB {
    pub fn as_bytes(self) -> u64 {
        self.0 * 1024 * 1024
    }
}

impl fmt::Display for MiB {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartRole {
    Efi,
    Recovery,
    System,
    Data,
    Config,
    #[default]
    Unknown,
}

impl fmt::Display for PartRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartRole::Efi => "efi",
            PartRole::Recovery => "recovery",
            PartRole::System => "system",
            PartRole::Data => "data",
            PartRole::Config => "config",
            PartRole::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileSystem {
    VFat,
    Btrfs,
    Ext4,
    #[default]
    Unknown,
}

impl fmt::Display for FileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileSystem::VFat => "vfat",
            FileSystem::Btrfs => "btrfs",
            FileSystem::Ext4 => "ext4",
            FileSystem::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Bootloader {
    Grub,
    SystemdBoot,
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptoPolicy {
    #[default]
    Default,
    Fips,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotterKind {
    #[default]
    Snapper,
    /// Debug path: formats the system partition and unpacks in place,
    /// ignoring snapshot semantics entirely.
    Overwrite,
}

/// A directory under the system partition that stays writable while the root
/// is read-only. Snapshotted volumes are managed by the snapshotter instead
/// of being created eagerly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RWVolume {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "is_false")]
    pub no_copy_on_write: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub snapshotted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_opts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Partition {
    #[serde(default, skip_serializing_if = "is_default_role")]
    pub role: PartRole,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    #[serde(default, skip_serializing_if = "is_default_fs")]
    pub file_system: FileSystem,
    #[serde(default, skip_serializing_if = "is_zero_size")]
    pub size: MiB,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mount_point: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_opts: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub hidden: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rw_volumes: Vec<RWVolume>,
}

impl Partition {
    /// True when every field holds its default value. Zero-valued partitions
    /// act as "keep" sentinels during merge.
    pub fn is_zero(&self) -> bool {
        self == &Partition::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Disk {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device: String,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub start_sector: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BootConfig {
    #[serde(default)]
    pub bootloader: Bootloader,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kernel_cmdline: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Security {
    #[serde(default)]
    pub crypto_policy: CryptoPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Snapshotter {
    #[serde(default)]
    pub name: SnapshotterKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Deployment {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<Disk>,
    #[serde(default, rename = "sourceOS", skip_serializing_if = "Source::is_unset")]
    pub source_os: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay_tree: Option<Source>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cfg_script: String,
    #[serde(default)]
    pub boot_config: BootConfig,
    #[serde(default)]
    pub security: Security,
    #[serde(default)]
    pub snapshotter: Snapshotter,
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_size(s: &MiB) -> bool {
    *s == ALL_AVAILABLE_SIZE
}

fn is_default_role(r: &PartRole) -> bool {
    *r == PartRole::Unknown
}

fn is_default_fs(f: &FileSystem) -> bool {
    *f == FileSystem::Unknown
}

fn default_efi_partition() -> Partition {
    Partition {
        role: PartRole::Efi,
        label: EFI_LABEL.to_string(),
        file_system: FileSystem::VFat,
        size: EFI_SIZE,
        mount_point: EFI_MNT.to_string(),
        mount_opts: vec!["defaults".to_string(), "x-systemd.automount".to_string()],
        ..Default::default()
    }
}

fn default_recovery_partition() -> Partition {
    Partition {
        role: PartRole::Recovery,
        label: RECOVERY_LABEL.to_string(),
        file_system: FileSystem::Btrfs,
        size: RECOVERY_SIZE,
        hidden: true,
        ..Default::default()
    }
}

fn default_system_partition() -> Partition {
    let initrd = vec!["x-initrd.mount".to_string()];
    Partition {
        role: PartRole::System,
        label: SYSTEM_LABEL.to_string(),
        file_system: FileSystem::Btrfs,
        size: ALL_AVAILABLE_SIZE,
        mount_point: SYSTEM_MNT.to_string(),
        mount_opts: vec!["ro=vfs".to_string()],
        rw_volumes: vec![
            RWVolume {
                path: PathBuf::from("/var"),
                no_copy_on_write: true,
                mount_opts: initrd.clone(),
                ..Default::default()
            },
            RWVolume {
                path: PathBuf::from("/root"),
                mount_opts: initrd.clone(),
                ..Default::default()
            },
            RWVolume {
                path: PathBuf::from("/etc"),
                snapshotted: true,
                mount_opts: initrd,
                ..Default::default()
            },
            RWVolume {
                path: PathBuf::from("/opt"),
                ..Default::default()
            },
            RWVolume {
                path: PathBuf::from("/srv"),
                ..Default::default()
            },
            RWVolume {
                path: PathBuf::from("/home"),
                ..Default::default()
            },
            RWVolume {
                path: PathBuf::from("/usr/local"),
                ..Default::default()
            },
        ],
        ..Default::default()
    }
}

/// The partition injected when first-boot configuration data exists. Hidden
/// so the running system does not mount it by default.
pub fn config_partition(size: MiB) -> Partition {
    Partition {
        role: PartRole::Data,
        label: CONFIG_LABEL.to_string(),
        file_system: FileSystem::Btrfs,
        size: size.max(CONFIG_PART_SIZE),
        mount_point: CONFIG_MNT.to_string(),
        hidden: true,
        ..Default::default()
    }
}

impl Deployment {
    /// Canonical single-disk layout: EFI, RECOVERY, SYSTEM (all-remaining).
    pub fn new() -> Self {
        Deployment {
            disks: vec![Disk {
                partitions: vec![
                    default_efi_partition(),
                    default_recovery_partition(),
                    default_system_partition(),
                ],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    /// Insert partitions on the system disk immediately before the System
    /// partition, so the all-remaining partition stays last.
    pub fn insert_partitions_before_system(&mut self, parts: Vec<Partition>) {
        if let Some(disk) = self.disks.first_mut() {
            let at = disk
                .partitions
                .iter()
                .position(|p| p.role == PartRole::System)
                .unwrap_or(disk.partitions.len());
            for (i, part) in parts.into_iter().enumerate() {
                disk.partitions.insert(at + i, part);
            }
        }
    }

    /// Add the first-boot configuration partition sized for the given
    /// payload.
    pub fn with_config_partition(&mut self, size: MiB) {
        self.insert_partitions_before_system(vec![config_partition(size)]);
    }

    /// The disk carrying the System partition.
    pub fn system_disk(&self) -> Option<&Disk> {
        self.disks
            .iter()
            .find(|d| d.partitions.iter().any(|p| p.role == PartRole::System))
    }

    pub fn system_disk_mut(&mut self) -> Option<&mut Disk> {
        self.disks
            .iter_mut()
            .find(|d| d.partitions.iter().any(|p| p.role == PartRole::System))
    }

    pub fn system_partition(&self) -> Option<&Partition> {
        self.disks
            .iter()
            .flat_map(|d| d.partitions.iter())
            .find(|p| p.role == PartRole::System)
    }

    pub fn system_partition_mut(&mut self) -> Option<&mut Partition> {
        self.disks
            .iter_mut()
            .flat_map(|d| d.partitions.iter_mut())
            .find(|p| p.role == PartRole::System)
    }

    pub fn is_fips_enabled(&self) -> bool {
        self.security.crypto_policy == CryptoPolicy::Fips
    }

    /// Restore structural invariants, mutating where the invariant defines a
    /// repair (FIPS cmdline, overwrite snapshotter constraints) and failing
    /// where it does not.
    pub fn sanitize(&mut self) -> Result<()> {
        if self.snapshotter.name == SnapshotterKind::Overwrite {
            if let Some(sys) = self.system_partition_mut() {
                sys.file_system = FileSystem::Ext4;
                sys.rw_volumes.clear();
            }
        }

        let all: Vec<&Partition> = self
            .disks
            .iter()
            .flat_map(|d| d.partitions.iter())
            .collect();

        let systems = all.iter().filter(|p| p.role == PartRole::System).count();
        if systems != 1 {
            return Err(Error::DeploymentInvariant(format!(
                "expected exactly one system partition, found {systems}"
            ))
            .into());
        }

        let efis = all.iter().filter(|p| p.role == PartRole::Efi).count();
        if efis != 1 {
            return Err(Error::DeploymentInvariant(format!(
                "expected exactly one EFI partition, found {efis}"
            ))
            .into());
        }

        let mut labels = HashSet::new();
        for part in &all {
            if part.label.is_empty() {
                continue;
            }
            if !labels.insert(part.label.as_str()) {
                return Err(Error::DeploymentInvariant(format!(
                    "duplicated partition label '{}'",
                    part.label
                ))
                .into());
            }
        }

        for disk in &self.disks {
            let expandables: Vec<usize> = disk
                .partitions
                .iter()
                .enumerate()
                .filter(|(_, p)| p.size == ALL_AVAILABLE_SIZE)
                .map(|(i, _)| i)
                .collect();
            if expandables.len() > 1 {
                return Err(Error::DeploymentInvariant(
                    "only one partition per disk may claim all remaining space".to_string(),
                )
                .into());
            }
            if let Some(&idx) = expandables.first() {
                if idx != disk.partitions.len() - 1 {
                    return Err(Error::DeploymentInvariant(
                        "the all-remaining partition must be the last one on its disk"
                            .to_string(),
                    )
                    .into());
                }
            }
        }

        if self.is_fips_enabled() {
            let cmdline = &mut self.boot_config.kernel_cmdline;
            if !cmdline.split_whitespace().any(|a| a == FIPS_CMDLINE) {
                if cmdline.is_empty() {
                    *cmdline = FIPS_CMDLINE.to_string();
                } else {
                    cmdline.push(' ');
                    cmdline.push_str(FIPS_CMDLINE);
                }
            }
        }

        if self.source_os.is_unset() {
            return Err(Error::DeploymentInvariant(
                "deployment requires an OS source".to_string(),
            )
            .into());
        }

        if let Some(overlay) = &self.overlay_tree {
            overlay
                .is_empty()
                .context("probing the overlay tree source")?;
        }

        Ok(())
    }

    /// Serialize the deployment under `<root>/etc/elemental/deployment.yaml`.
    pub fn write_deployment_file(&self, root: &Path) -> Result<()> {
        let dir = root.join(DEPLOYMENT_DIR);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating deployment directory '{}'", dir.display()))?;
        let path = dir.join(DEPLOYMENT_FILE);
        let data = serde_yaml::to_string(self).context("serializing deployment")?;
        fs::write(&path, data)
            .with_context(|| format!("writing deployment file '{}'", path.display()))?;
        Ok(())
    }

    /// Read a deployment description, rejecting unknown fields.
    pub fn parse_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading deployment file '{}'", path.display()))?;
        Self::parse(&data).with_context(|| format!("parsing deployment file '{}'", path.display()))
    }

    pub fn parse(data: &str) -> Result<Self> {
        serde_yaml::from_str(data)
            .map_err(|e| anyhow::Error::new(Error::Schema(e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_efi_recovery_system() {
        let d = Deployment::new();
        assert_eq!(d.disks.len(), 1);
        let roles: Vec<PartRole> = d.disks[0].partitions.iter().map(|p| p.role).collect();
        assert_eq!(
            roles,
            vec![PartRole::Efi, PartRole::Recovery, PartRole::System]
        );
        let sys = d.system_partition().unwrap();
        assert_eq!(sys.size, ALL_AVAILABLE_SIZE);
        assert_eq!(sys.rw_volumes.len(), 7);
        assert!(sys
            .rw_volumes
            .iter()
            .any(|v| v.path == PathBuf::from("/etc") && v.snapshotted));
        assert!(sys
            .rw_volumes
            .iter()
            .any(|v| v.path == PathBuf::from("/var") && v.no_copy_on_write));
    }

    #[test]
    fn config_partition_injected_before_system() {
        let mut d = Deployment::new();
        d.with_config_partition(MiB(80));
        let labels: Vec<&str> = d.disks[0]
            .partitions
            .iter()
            .map(|p| p.label.as_str())
            .collect();
        assert_eq!(labels, vec!["EFI", "RECOVERY", "CONFIG", "SYSTEM"]);
        // Sizes below the minimum round up to 256 MiB.
        assert_eq!(d.disks[0].partitions[2].size, CONFIG_PART_SIZE);
        assert!(d.disks[0].partitions[2].hidden);
    }

    #[test]
    fn sanitize_appends_fips_cmdline() {
        let mut d = Deployment::new();
        d.source_os = Source::oci("registry.suse.com/base:latest");
        d.boot_config.kernel_cmdline = "console=ttyS0".to_string();
        d.security.crypto_policy = CryptoPolicy::Fips;
        d.sanitize().unwrap();
        assert_eq!(d.boot_config.kernel_cmdline, "console=ttyS0 fips=1");

        // Sanitize is idempotent.
        d.sanitize().unwrap();
        assert_eq!(d.boot_config.kernel_cmdline, "console=ttyS0 fips=1");
    }

    #[test]
    fn sanitize_rejects_duplicate_labels() {
        let mut d = Deployment::new();
        d.source_os = Source::oci("registry.suse.com/base:latest");
        d.disks[0].partitions[1].label = SYSTEM_LABEL.to_string();
        let err = d.sanitize().unwrap_err();
        assert!(format!("{err:#}").contains("duplicated partition label"));
    }

    #[test]
    fn sanitize_rejects_missing_system_partition() {
        let mut d = Deployment::new();
        d.source_os = Source::oci("registry.suse.com/base:latest");
        d.disks[0].partitions.retain(|p| p.role != PartRole::System);
        assert!(d.sanitize().is_err());
    }

    #[test]
    fn sanitize_rejects_expandable_partition_not_last() {
        let mut d = Deployment::new();
        d.source_os = Source::oci("registry.suse.com/base:latest");
        d.disks[0].partitions.push(Partition {
            role: PartRole::Data,
            label: "DATA".to_string(),
            file_system: FileSystem::Ext4,
            size: MiB(512),
            ..Default::default()
        });
        let err = d.sanitize().unwrap_err();
        assert!(format!("{err:#}").contains("must be the last one"));
    }

    #[test]
    fn sanitize_overwrite_forces_ext4_without_volumes() {
        let mut d = Deployment::new();
        d.source_os = Source::oci("registry.suse.com/base:latest");
        d.snapshotter.name = SnapshotterKind::Overwrite;
        d.sanitize().unwrap();
        let sys = d.system_partition().unwrap();
        assert_eq!(sys.file_system, FileSystem::Ext4);
        assert!(sys.rw_volumes.is_empty());
    }

    #[test]
    fn deployment_yaml_roundtrip() {
        let mut d = Deployment::new();
        d.disks[0].device = "/dev/vda".to_string();
        d.source_os = Source::oci("registry.suse.com/base:latest");
        d.overlay_tree = Some(Source::dir("/tmp/overlays"));
        d.boot_config.bootloader = Bootloader::Grub;
        d.boot_config.kernel_cmdline = "console=ttyS0".to_string();

        let text = serde_yaml::to_string(&d).unwrap();
        let parsed = Deployment::parse(&text).unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn parse_rejects_unknown_fields() {
        let err = Deployment::parse("disks: []\nbogusField: 1\n").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Schema(_))));
    }

    #[test]
    fn parse_installer_media_description() {
        let text = r#"
disks:
  - partitions:
    - label: EFI
      fileSystem: vfat
      size: 1024
      role: efi
      mountPoint: /boot
      mountOpts:
        - defaults
        - x-systemd.automount
    - label: RECOVERY
      fileSystem: btrfs
      size: 1280
      role: recovery
      hidden: true
    - label: SYSTEM
      fileSystem: btrfs
      role: system
      mountPoint: /
      mountOpts:
        - ro=vfs
      rwVolumes:
        - path: /var
          noCopyOnWrite: true
          mountOpts:
            - x-initrd.mount
        - path: /etc
          snapshotted: true
"#;
        let d = Deployment::parse(text).unwrap();
        assert_eq!(d.disks[0].partitions.len(), 3);
        assert_eq!(d.disks[0].partitions[1].size, MiB(1280));
        assert!(d.disks[0].partitions[1].hidden);
        assert_eq!(d.disks[0].partitions[2].size, ALL_AVAILABLE_SIZE);
    }
}
