//! Installer media handling.
//!
//! Reads the deployment description embedded in vendor installer ISOs,
//! writes customized descriptions and first-boot payloads back, and
//! re-truncates RAW media. All media manipulation happens through external
//! tools (`xorriso`, `truncate`) behind the shared runner.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::DiskSize;
use crate::deployment::Deployment;
use crate::error::Error;
use crate::process::{Cmd, SharedRunner};

/// Path of the installer description inside the media.
pub const INSTALL_DESCRIPTION: &str = "/install.yaml";
/// Path of the first-boot payload tree inside the media.
const FIRSTBOOT_PAYLOAD: &str = "/firstboot-config";

/// Default size of a built RAW disk image.
pub const DEFAULT_DISK_SIZE: &str = "10G";

/// Extract and parse the deployment description embedded in an ISO.
pub fn read_iso_description(
    runner: &SharedRunner,
    iso: &Path,
    workdir: &Path,
) -> Result<Deployment> {
    let extract_dir = workdir.join("iso-desc-install");
    fs::create_dir_all(&extract_dir)
        .with_context(|| format!("creating '{}'", extract_dir.display()))?;
    let target = extract_dir.join("install.yaml");

    Cmd::new(runner.as_ref(), "xorriso")
        .args(["-osirrox", "on", "-indev"])
        .arg_path(iso)
        .args(["-extract", INSTALL_DESCRIPTION])
        .arg_path(&target)
        .error_msg(&format!("'{}'", iso.display()))
        .run()
        .with_context(|| format!("reading installer description from '{}'", iso.display()))?;

    Deployment::parse_file(&target)
}

/// Truncate an image file to the given size. An empty size falls back to
/// the default; malformed sizes are rejected before any side effect.
pub fn truncate_image(runner: &SharedRunner, image: &Path, size: &DiskSize) -> Result<()> {
    let size = if size.0.is_empty() {
        DiskSize(DEFAULT_DISK_SIZE.to_string())
    } else if !size.is_valid() {
        return Err(Error::InvalidDiskSize(size.0.clone()).into());
    } else {
        size.clone()
    };

    Cmd::new(runner.as_ref(), "truncate")
        .args(["-s", &size.0])
        .arg_path(image)
        .error_msg(&format!("truncating '{}'", image.display()))
        .run()?;
    Ok(())
}

/// Attach an image file to a free loop device, returning the device path.
pub fn attach_device(runner: &SharedRunner, image: &Path) -> Result<String> {
    let out = Cmd::new(runner.as_ref(), "losetup")
        .args(["-f", "--show"])
        .arg_path(image)
        .error_msg("attaching loop device")
        .run()?;
    Ok(String::from_utf8_lossy(&out).trim().to_string())
}

pub fn detach_device(runner: &SharedRunner, device: &str) -> Result<()> {
    Cmd::new(runner.as_ref(), "losetup")
        .args(["-d", device])
        .error_msg("detaching loop device")
        .run()?;
    Ok(())
}

/// Media-specific re-packaging of a customized deployment.
pub trait InstallerMedia {
    fn customize(&self, source_media: &Path, d: &Deployment) -> Result<()>;
}

/// ISO media: rewrite the embedded description and map the first-boot
/// payload into the image.
pub struct IsoMedia {
    runner: SharedRunner,
    output: PathBuf,
    /// First-boot payload candidate; mapped into the media only when the
    /// directory exists by the time the media is written.
    firstboot_dir: PathBuf,
    workdir: PathBuf,
}

impl IsoMedia {
    pub fn new(
        runner: SharedRunner,
        output: PathBuf,
        firstboot_dir: PathBuf,
        workdir: PathBuf,
    ) -> Self {
        Self {
            runner,
            output,
            firstboot_dir,
            workdir,
        }
    }
}

impl InstallerMedia for IsoMedia {
    fn customize(&self, source_media: &Path, d: &Deployment) -> Result<()> {
        let description = self.workdir.join("install.yaml");
        let data = serde_yaml::to_string(d).context("serializing installer description")?;
        fs::write(&description, data)
            .with_context(|| format!("writing '{}'", description.display()))?;

        let mut cmd = Cmd::new(self.runner.as_ref(), "xorriso")
            .arg("-indev")
            .arg_path(source_media)
            .arg("-outdev")
            .arg_path(&self.output)
            .args(["-boot_image", "any", "replay"])
            .arg("-map")
            .arg_path(&description)
            .arg(INSTALL_DESCRIPTION);
        if self.firstboot_dir.is_dir() {
            cmd = cmd
                .arg("-map")
                .arg_path(&self.firstboot_dir)
                .arg(FIRSTBOOT_PAYLOAD);
        }
        cmd.error_msg("repacking installer media").run()?;
        Ok(())
    }
}

/// RAW media: write the description next to the image and size the image
/// for the configured installation.
pub struct RawMedia {
    runner: SharedRunner,
    output: PathBuf,
    disk_size: DiskSize,
}

impl RawMedia {
    pub fn new(runner: SharedRunner, output: PathBuf, disk_size: DiskSize) -> Self {
        Self {
            runner,
            output,
            disk_size,
        }
    }
}

impl InstallerMedia for RawMedia {
    fn customize(&self, source_media: &Path, d: &Deployment) -> Result<()> {
        if source_media != self.output && source_media.exists() {
            fs::copy(source_media, &self.output).with_context(|| {
                format!("copying source media to '{}'", self.output.display())
            })?;
        }
        truncate_image(&self.runner, &self.output, &self.disk_size)?;

        let description = self.output.with_extension("install.yaml");
        let data = serde_yaml::to_string(d).context("serializing installer description")?;
        fs::write(&description, data)
            .with_context(|| format!("writing '{}'", description.display()))?;
        Ok(())
    }
}
