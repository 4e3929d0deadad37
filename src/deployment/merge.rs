//! Position-indexed structural merge.
//!
//! Installer media carry a skeleton deployment that local customization
//! overrides. The merge source walks the destination by index with three
//! explicit cases per entry: `Keep` (zero value, inherit), `Remove`
//! (serialized as null) and `Set` (field-wise override; zero-valued fields
//! inherit). Entries beyond the destination length append. Disks follow the
//! same rule as partitions.

use anyhow::Result;
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

use super::{
    BootConfig, Bootloader, CryptoPolicy, Deployment, Disk, FileSystem, PartRole, Partition,
    Security, Snapshotter, SnapshotterKind, Source, ALL_AVAILABLE_SIZE,
};

/// One merge-source entry at a partition index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PartitionSlot {
    /// Leave the destination entry untouched.
    #[default]
    Keep,
    /// Remove the destination entry at this index.
    Remove,
    /// Override set fields of the destination entry, or append past the end.
    Set(Partition),
}

impl PartitionSlot {
    fn from_option(part: Option<Partition>) -> Self {
        match part {
            None => PartitionSlot::Remove,
            Some(p) if p.is_zero() => PartitionSlot::Keep,
            Some(p) => PartitionSlot::Set(p),
        }
    }
}

impl Serialize for PartitionSlot {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            PartitionSlot::Keep => Partition::default().serialize(serializer),
            PartitionSlot::Remove => serializer.serialize_none(),
            PartitionSlot::Set(p) => p.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for PartitionSlot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let part = Option::<Partition>::deserialize(deserializer)?;
        Ok(PartitionSlot::from_option(part))
    }
}

/// Disk-level merge source: device and start sector override when set,
/// partitions merge slot-wise.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DiskPatch {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device: String,
    #[serde(default, skip_serializing_if = "super::is_zero_u64")]
    pub start_sector: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partitions: Vec<PartitionSlot>,
}

/// One merge-source entry at a disk index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DiskSlot {
    #[default]
    Keep,
    Remove,
    Set(DiskPatch),
}

impl Serialize for DiskSlot {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            DiskSlot::Keep => DiskPatch::default().serialize(serializer),
            DiskSlot::Remove => serializer.serialize_none(),
            DiskSlot::Set(d) => d.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for DiskSlot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let disk = Option::<DiskPatch>::deserialize(deserializer)?;
        Ok(match disk {
            None => DiskSlot::Remove,
            Some(d) if d == DiskPatch::default() => DiskSlot::Keep,
            Some(d) => DiskSlot::Set(d),
        })
    }
}

/// Merge source for a whole deployment. Top-level scalars follow the
/// zero-keeps rule; the source fields use their emptiness probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeploymentPatch {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskSlot>,
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

/// Merge `src` onto `dst` in place.
pub fn merge(dst: &mut Deployment, src: &DeploymentPatch) -> Result<()> {
    merge_disks(&mut dst.disks, &src.disks);

    if !src.source_os.is_empty()? {
        dst.source_os = src.source_os.clone();
    }
    if let Some(overlay) = &src.overlay_tree {
        if !overlay.is_empty()? {
            dst.overlay_tree = Some(overlay.clone());
        }
    }
    if !src.cfg_script.is_empty() {
        dst.cfg_script = src.cfg_script.clone();
    }
    if src.boot_config.bootloader != Bootloader::None {
        dst.boot_config.bootloader = src.boot_config.bootloader;
    }
    if !src.boot_config.kernel_cmdline.is_empty() {
        dst.boot_config.kernel_cmdline = src.boot_config.kernel_cmdline.clone();
    }
    if src.security.crypto_policy != CryptoPolicy::Default {
        dst.security.crypto_policy = src.security.crypto_policy;
    }
    if src.snapshotter.name != SnapshotterKind::Snapper {
        dst.snapshotter.name = src.snapshotter.name;
    }
    Ok(())
}

fn merge_disks(dst: &mut Vec<Disk>, src: &[DiskSlot]) {
    let mut idx = 0usize;
    for slot in src {
        match slot {
            DiskSlot::Keep => idx += 1,
            DiskSlot::Remove => {
                if idx < dst.len() {
                    dst.remove(idx);
                }
            }
            DiskSlot::Set(patch) => {
                if idx < dst.len() {
                    merge_disk(&mut dst[idx], patch);
                } else {
                    dst.push(materialize_disk(patch));
                }
                idx += 1;
            }
        }
    }
}

fn merge_disk(dst: &mut Disk, src: &DiskPatch) {
    if !src.device.is_empty() {
        dst.device = src.device.clone();
    }
    if src.start_sector != 0 {
        dst.start_sector = src.start_sector;
    }
    merge_partitions(&mut dst.partitions, &src.partitions);
}

fn merge_partitions(dst: &mut Vec<Partition>, src: &[PartitionSlot]) {
    let mut idx = 0usize;
    for slot in src {
        match slot {
            PartitionSlot::Keep => idx += 1,
            PartitionSlot::Remove => {
                if idx < dst.len() {
                    dst.remove(idx);
                }
            }
            PartitionSlot::Set(part) => {
                if idx < dst.len() {
                    merge_partition(&mut dst[idx], part);
                } else {
                    dst.push(part.clone());
                }
                idx += 1;
            }
        }
    }
}

fn merge_partition(dst: &mut Partition, src: &Partition) {
    if src.role != PartRole::Unknown {
        dst.role = src.role;
    }
    if !src.label.is_empty() {
        dst.label = src.label.clone();
    }
    if src.file_system != FileSystem::Unknown {
        dst.file_system = src.file_system;
    }
    if src.size != ALL_AVAILABLE_SIZE {
        dst.size = src.size;
    }
    if !src.mount_point.is_empty() {
        dst.mount_point = src.mount_point.clone();
    }
    if !src.mount_opts.is_empty() {
        dst.mount_opts = src.mount_opts.clone();
    }
    if src.hidden {
        dst.hidden = true;
    }
    if !src.uuid.is_empty() {
        dst.uuid = src.uuid.clone();
    }
    if !src.rw_volumes.is_empty() {
        dst.rw_volumes = src.rw_volumes.clone();
    }
}

/// Turn an appended disk patch into a concrete disk. `Keep` slots become
/// zero partitions, `Remove` slots vanish.
fn materialize_disk(patch: &DiskPatch) -> Disk {
    Disk {
        device: patch.device.clone(),
        start_sector: patch.start_sector,
        partitions: patch
            .partitions
            .iter()
            .filter_map(|slot| match slot {
                PartitionSlot::Keep => Some(Partition::default()),
                PartitionSlot::Remove => None,
                PartitionSlot::Set(p) => Some(p.clone()),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::{MiB, CONFIG_LABEL, CONFIG_MNT};

    fn base() -> Deployment {
        Deployment::new()
    }

    fn patch_with_partitions(slots: Vec<PartitionSlot>) -> DeploymentPatch {
        DeploymentPatch {
            disks: vec![DiskSlot::Set(DiskPatch {
                partitions: slots,
                ..Default::default()
            })],
            ..Default::default()
        }
    }

    #[test]
    fn merges_a_new_partition_into_dst() {
        let mut dst = base();
        let new_partition = Partition {
            label: CONFIG_LABEL.to_string(),
            mount_point: CONFIG_MNT.to_string(),
            role: PartRole::Data,
            file_system: FileSystem::Btrfs,
            size: MiB(1024),
            hidden: true,
            ..Default::default()
        };
        let system = dst.disks[0].partitions[2].clone();

        let src = patch_with_partitions(vec![
            PartitionSlot::Keep,
            PartitionSlot::Keep,
            PartitionSlot::Remove,
            PartitionSlot::Set(new_partition.clone()),
            PartitionSlot::Set(system.clone()),
        ]);

        merge(&mut dst, &src).unwrap();
        let parts = &dst.disks[0].partitions;
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].role, PartRole::Efi);
        assert_eq!(parts[1].role, PartRole::Recovery);
        assert_eq!(parts[2], new_partition);
        assert_eq!(parts[3], system);
    }

    #[test]
    fn merges_fields_onto_existing_partition() {
        let mut dst = base();
        let src = patch_with_partitions(vec![
            PartitionSlot::Keep,
            PartitionSlot::Set(Partition {
                label: "MERGED-RECOVERY".to_string(),
                size: MiB(4096),
                ..Default::default()
            }),
        ]);

        merge(&mut dst, &src).unwrap();
        let parts = &dst.disks[0].partitions;
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].label, "MERGED-RECOVERY");
        assert_eq!(parts[1].size, MiB(4096));
        // Unset fields inherit.
        assert_eq!(parts[1].role, PartRole::Recovery);
        assert_eq!(parts[1].file_system, FileSystem::Btrfs);
    }

    #[test]
    fn removes_all_and_appends_new() {
        let mut dst = base();
        let new1 = Partition {
            label: "NEW-PART-1".to_string(),
            size: MiB(4096),
            ..Default::default()
        };
        let new2 = Partition {
            size: MiB(2048),
            mount_point: "/new-part".to_string(),
            hidden: true,
            ..Default::default()
        };
        let src = patch_with_partitions(vec![
            PartitionSlot::Remove,
            PartitionSlot::Remove,
            PartitionSlot::Remove,
            PartitionSlot::Set(new1.clone()),
            PartitionSlot::Set(new2.clone()),
        ]);

        merge(&mut dst, &src).unwrap();
        assert_eq!(dst.disks[0].partitions, vec![new1, new2]);
    }

    #[test]
    fn appends_past_the_end() {
        let mut dst = base();
        let new1 = Partition {
            label: "NEW-PART-1".to_string(),
            size: MiB(4096),
            ..Default::default()
        };
        let src = patch_with_partitions(vec![
            PartitionSlot::Keep,
            PartitionSlot::Keep,
            PartitionSlot::Keep,
            PartitionSlot::Set(new1.clone()),
        ]);

        merge(&mut dst, &src).unwrap();
        assert_eq!(dst.disks[0].partitions.len(), 4);
        assert_eq!(dst.disks[0].partitions[3], new1);
    }

    #[test]
    fn short_source_keeps_remaining_destination() {
        let mut dst = base();
        let src = patch_with_partitions(vec![
            PartitionSlot::Set(Partition {
                mount_point: "/boot-foo".to_string(),
                ..Default::default()
            }),
            PartitionSlot::Remove,
        ]);

        merge(&mut dst, &src).unwrap();
        let parts = &dst.disks[0].partitions;
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].mount_point, "/boot-foo");
        assert_eq!(parts[0].role, PartRole::Efi);
        assert_eq!(parts[1].role, PartRole::System);
    }

    #[test]
    fn merges_full_deployments_with_extra_disk() {
        let mut dst = base();
        dst.source_os = Source::Empty;
        let recovery = dst.disks[0].partitions[1].clone();
        let system = dst.disks[0].partitions[2].clone();

        let new1 = Partition {
            label: "NEW-PART-1".to_string(),
            mount_point: "/foo/bar".to_string(),
            mount_opts: vec!["defaults".into(), "x-systemd.automount".into()],
            ..Default::default()
        };
        let new2 = Partition {
            label: "NEW-PART-2".to_string(),
            mount_point: "/boot/part-2".to_string(),
            mount_opts: vec!["defaults".into(), "x-systemd.automount".into()],
            ..Default::default()
        };

        let src = DeploymentPatch {
            source_os: Source::oci("domain.org/image/repo:tag"),
            disks: vec![
                DiskSlot::Set(DiskPatch {
                    device: "/dev/sda".to_string(),
                    partitions: vec![
                        PartitionSlot::Set(Partition {
                            mount_point: "/boot/efi/foo".to_string(),
                            ..Default::default()
                        }),
                        PartitionSlot::Remove,
                        PartitionSlot::Remove,
                        PartitionSlot::Set(new1.clone()),
                        PartitionSlot::Set(new2.clone()),
                        PartitionSlot::Set(recovery.clone()),
                        PartitionSlot::Set(system.clone()),
                    ],
                    ..Default::default()
                }),
                DiskSlot::Set(DiskPatch {
                    device: "/dev/device".to_string(),
                    partitions: vec![PartitionSlot::Set(Partition {
                        label: "foo".to_string(),
                        ..Default::default()
                    })],
                    ..Default::default()
                }),
            ],
            cfg_script: "script".to_string(),
            boot_config: BootConfig {
                kernel_cmdline: "new cmdline".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };

        merge(&mut dst, &src).unwrap();

        assert_eq!(dst.source_os.to_string(), "oci://domain.org/image/repo:tag");
        assert_eq!(dst.disks.len(), 2);

        let parts = &dst.disks[0].partitions;
        assert_eq!(dst.disks[0].device, "/dev/sda");
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0].mount_point, "/boot/efi/foo");
        assert_eq!(parts[0].role, PartRole::Efi);
        assert_eq!(parts[1], new1);
        assert_eq!(parts[2], new2);
        assert_eq!(parts[3], recovery);
        assert_eq!(parts[4], system);

        assert_eq!(dst.disks[1].device, "/dev/device");
        assert_eq!(dst.disks[1].partitions.len(), 1);
        assert_eq!(dst.disks[1].partitions[0].label, "foo");

        assert_eq!(dst.cfg_script, "script");
        assert_eq!(dst.boot_config.bootloader, Bootloader::None);
        assert_eq!(dst.boot_config.kernel_cmdline, "new cmdline");
    }

    #[test]
    fn slot_serde_roundtrip() {
        let yaml = "- {}\n- null\n- label: CONFIG\n  size: 256\n";
        let slots: Vec<PartitionSlot> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(slots[0], PartitionSlot::Keep);
        assert_eq!(slots[1], PartitionSlot::Remove);
        assert!(matches!(&slots[2], PartitionSlot::Set(p) if p.label == "CONFIG"));

        let text = serde_yaml::to_string(&slots).unwrap();
        let again: Vec<PartitionSlot> = serde_yaml::from_str(&text).unwrap();
        assert_eq!(again, slots);
    }
}
