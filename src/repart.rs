//! Declarative partitioning driven by systemd-repart.
//!
//! For each disk one configuration fragment per partition is generated into
//! a scratch `elemental-repart.d` directory, systemd-repart is invoked with
//! `--json=pretty`, and the UUIDs it assigned are written back into the
//! matching partition records.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

use crate::deployment::{Disk, FileSystem, MiB, PartRole, Partition};
use crate::error::Error;
use crate::process::{Cmd, SharedRunner};

const ROOT_TYPE: &str = "root";
const DATA_TYPE: &str = "linux-generic";
const ESP_TYPE: &str = "esp";

/// A partition plus the repart-specific copy directives.
#[derive(Debug, Clone, Default)]
pub struct RepartPartition {
    pub partition: Partition,
    /// Paths to copy into the partition, `CopyFiles=` syntax as defined in
    /// repart.d(5). Source paths must be absolute.
    pub copy_files: Vec<String>,
    /// Paths excluded from copying, `ExcludeFiles=` syntax.
    pub excludes: Vec<String>,
}

impl RepartPartition {
    pub fn from_partition(partition: &Partition) -> Self {
        Self {
            partition: partition.clone(),
            ..Default::default()
        }
    }
}

/// Create a new empty partition table on the target disk and apply the
/// configured layout, creating and formatting all partitions. Destroys any
/// existing table.
pub fn partition_and_format_device(runner: &SharedRunner, disk: &mut Disk) -> Result<()> {
    repart_disk(runner, disk, "force").context("creating the new partition table")?;
    notify_kernel(runner, &disk.device);
    Ok(())
}

/// Match the configured layout against the current device, extending an
/// existing partition table or creating one if none exists. Pre-existing
/// partitions are never removed.
pub fn reconcile_device_partitions(runner: &SharedRunner, disk: &mut Disk) -> Result<()> {
    repart_disk(runner, disk, "allow").context("updating the current partition table")?;
    notify_kernel(runner, &disk.device);
    Ok(())
}

/// Create and partition a disk image file of the given size.
pub fn create_disk_image(
    runner: &SharedRunner,
    filename: &Path,
    size: MiB,
    partitions: &mut [RepartPartition],
) -> Result<()> {
    tracing::info!("Partitioning image '{}'", filename.display());
    let size_flag = if size == MiB(0) {
        "--size=auto".to_string()
    } else {
        format!("--size={size}M")
    };
    run_systemd_repart(
        runner,
        &filename.display().to_string(),
        partitions,
        &["--empty=create".to_string(), size_flag],
    )
}

/// Render the repart.d configuration fragment for one partition.
pub fn partition_conf(part: &RepartPartition) -> Result<String> {
    let ptype = role_to_type(part.partition.role);
    if ptype.is_empty() {
        bail!("invalid partition role: {}", part.partition.role);
    }

    for copy in &part.copy_files {
        let source = copy.split(':').next().unwrap_or_default();
        if !source.is_empty() && !Path::new(source).is_absolute() {
            return Err(Error::InvalidCopyPath(copy.clone()).into());
        }
    }

    let mut conf = String::from("[Partition]\n");
    writeln!(conf, "Type={ptype}")?;
    let format = file_system_to_format(part.partition.file_system);
    if !format.is_empty() {
        writeln!(conf, "Format={format}")?;
    }
    if part.partition.size != MiB(0) {
        writeln!(conf, "SizeMinBytes={}", part.partition.size.as_bytes())?;
        writeln!(conf, "SizeMaxBytes={}", part.partition.size.as_bytes())?;
    }
    if !part.partition.label.is_empty() {
        writeln!(conf, "Label={}", part.partition.label)?;
    }
    if !part.partition.uuid.is_empty() {
        writeln!(conf, "UUID={}", part.partition.uuid)?;
    }
    for copy in &part.copy_files {
        writeln!(conf, "CopyFiles={copy}")?;
    }
    for exclude in &part.excludes {
        writeln!(conf, "ExcludeFiles={exclude}")?;
    }
    if read_only_part(&part.partition) {
        writeln!(conf, "ReadOnly=on")?;
    }
    Ok(conf)
}

/// Best-effort request for the kernel to reread the partition table. Recent
/// systemd-repart versions do this themselves, but older hosts still need
/// the nudge.
fn notify_kernel(runner: &SharedRunner, device: &str) {
    Cmd::new(runner.as_ref(), "partx")
        .args(["-u", device])
        .run_best_effort();
    Cmd::new(runner.as_ref(), "udevadm")
        .arg("settle")
        .run_best_effort();
}

fn repart_disk(runner: &SharedRunner, disk: &mut Disk, empty: &str) -> Result<()> {
    let sector_size = device_sector_size(runner, &disk.device)?;
    let mut parts: Vec<RepartPartition> = disk
        .partitions
        .iter()
        .map(RepartPartition::from_partition)
        .collect();

    let flags = [
        format!("--empty={empty}"),
        format!("--sector-size={sector_size}"),
    ];
    run_systemd_repart(runner, &disk.device.clone(), &mut parts, &flags)?;

    for (dst, src) in disk.partitions.iter_mut().zip(parts.iter()) {
        dst.uuid = src.partition.uuid.clone();
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct RepartEntry {
    #[serde(default)]
    uuid: String,
    #[serde(default)]
    partno: usize,
}

fn run_systemd_repart(
    runner: &SharedRunner,
    target: &str,
    parts: &mut [RepartPartition],
    flags: &[String],
) -> Result<()> {
    let dir = TempDir::with_prefix("elemental-repart.d")
        .context("creating a temporary directory for systemd-repart configuration")?;

    for (i, part) in parts.iter().enumerate() {
        let name = format!("{:02}-{}.conf", i, part.partition.role);
        let conf = partition_conf(part)
            .with_context(|| format!("generating systemd-repart configuration '{name}'"))?;
        fs::write(dir.path().join(&name), conf)
            .with_context(|| format!("writing systemd-repart configuration '{name}'"))?;
    }

    for flag in flags {
        if flag.starts_with("--json") || flag.starts_with("--definitions") || flag.starts_with("--dry-run")
        {
            bail!("json, definitions and dry-run flags are not configurable");
        }
    }

    let out = Cmd::new(runner.as_ref(), "systemd-repart")
        .arg("--json=pretty")
        .arg(format!("--definitions={}", dir.path().display()))
        .arg("--dry-run=no")
        .args(flags.iter().cloned())
        .arg(target)
        .env("PATH", "/sbin:/usr/sbin:/usr/bin:/bin")
        .error_msg(&format!("partitioning disk '{target}' with systemd-repart"))
        .run()?;

    let entries: Vec<RepartEntry> =
        serde_json::from_slice(&out).context("parsing systemd-repart JSON output")?;
    if entries.len() != parts.len() {
        return Err(Error::PartitionerMismatch(
            String::from_utf8_lossy(&out).into_owned(),
        )
        .into());
    }

    for entry in entries {
        let Some(part) = parts.get_mut(entry.partno) else {
            return Err(Error::PartitionerMismatch(format!(
                "unexpected partition number {}",
                entry.partno
            ))
            .into());
        };
        part.partition.uuid = entry.uuid;
    }
    Ok(())
}

fn device_sector_size(runner: &SharedRunner, device: &str) -> Result<u64> {
    let out = Cmd::new(runner.as_ref(), "lsblk")
        .args(["-nd", "-o", "LOG-SEC"])
        .arg(device)
        .error_msg(&format!("reading sector size of '{device}'"))
        .run()?;
    String::from_utf8_lossy(&out)
        .trim()
        .parse::<u64>()
        .with_context(|| format!("parsing sector size of '{device}'"))
}

fn role_to_type(role: PartRole) -> &'static str {
    match role {
        PartRole::Data | PartRole::Recovery | PartRole::Config => DATA_TYPE,
        PartRole::Efi => ESP_TYPE,
        PartRole::System => ROOT_TYPE,
        PartRole::Unknown => "",
    }
}

fn file_system_to_format(fs: FileSystem) -> &'static str {
    match fs {
        FileSystem::Unknown => "",
        FileSystem::VFat => "vfat",
        FileSystem::Btrfs => "btrfs",
        FileSystem::Ext4 => "ext4",
    }
}

fn read_only_part(part: &Partition) -> bool {
    part.mount_opts.iter().any(|opt| opt.starts_with("ro"))
}
