//! Installer media customization pipeline.
//!
//! Fetches the vendor installer media referenced by the release manifest,
//! reads its embedded deployment description, builds a local override from
//! the configuration directory (without installing anything), merges
//! baseline and override by position, and re-packages the media.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use crate::build::ConfigManager;
use crate::cancel::CancelToken;
use crate::config::{Definition, MediaType, OutputDir};
use crate::deployment::merge::{merge, DeploymentPatch, DiskPatch, DiskSlot, PartitionSlot};
use crate::deployment::{config_partition, Deployment, Source, CONFIG_PART_SIZE, EFI_LABEL};
use crate::error::Error;
use crate::manifest::OciFileExtractor;
use crate::media::{read_iso_description, InstallerMedia, IsoMedia, RawMedia};
use crate::process::SharedRunner;

/// Glob locating the installer ISO inside the vendor OCI artifact.
pub const ISO_SEARCH_GLOB: &str = "/iso/*-iso*.iso";

/// Name of the generated unattended-install hook shipped on the media.
pub const AUTO_INSTALLER: &str = "auto_installer.sh";

pub trait FileExtractor {
    fn extract_from(&self, uri: &str) -> Result<PathBuf>;
}

impl FileExtractor for OciFileExtractor {
    fn extract_from(&self, uri: &str) -> Result<PathBuf> {
        OciFileExtractor::extract_from(self, uri)
    }
}

pub struct CustomizeRunner {
    pub runner: SharedRunner,
    pub cancel: CancelToken,
    pub config_manager: Box<dyn ConfigManager>,
    pub extractor: Box<dyn FileExtractor>,
}

impl CustomizeRunner {
    /// Customize the vendor media with the default media handler for the
    /// requested type.
    pub fn run(&self, def: &Definition, output: &OutputDir) -> Result<()> {
        let media: Box<dyn InstallerMedia> = match def.media_type {
            MediaType::Iso => Box::new(IsoMedia::new(
                self.runner.clone(),
                def.output_image_name.clone(),
                output.firstboot_config_dir(),
                output.0.clone(),
            )),
            MediaType::Raw => Box::new(RawMedia::new(
                self.runner.clone(),
                def.output_image_name.clone(),
                def.configuration.installation.raw.disk_size.clone(),
            )),
        };
        self.run_with_media(def, output, media.as_ref())
    }

    pub fn run_with_media(
        &self,
        def: &Definition,
        output: &OutputDir,
        media: &dyn InstallerMedia,
    ) -> Result<()> {
        let rm = self
            .config_manager
            .configure_components(&def.configuration, output)?;
        self.cancel.check()?;
        let iso_uri = rm
            .installer_iso_image()
            .context("release manifest carries no installer ISO image")?;

        let iso_path = self.extractor.extract_from(iso_uri)?;

        let mut baseline = read_iso_description(&self.runner, &iso_path, &output.0)?;

        let patch = self.local_patch(def, output, &baseline)?;
        merge(&mut baseline, &patch).context("merging the local customization")?;

        media.customize(&iso_path, &baseline)
    }

    /// The local override merged onto the media's baseline description.
    fn local_patch(
        &self,
        def: &Definition,
        output: &OutputDir,
        baseline: &Deployment,
    ) -> Result<DeploymentPatch> {
        let installation = &def.configuration.installation;

        let mut cmdline = installation.kernel_cmdline.clone();
        let mut push_arg = |arg: &str| {
            if !cmdline.is_empty() {
                cmdline.push(' ');
            }
            cmdline.push_str(arg);
        };
        if installation.crypto_policy == crate::deployment::CryptoPolicy::Fips {
            push_arg(crate::deployment::FIPS_CMDLINE);
        }
        push_arg(&format!("boot=LABEL={EFI_LABEL}"));

        let mut patch = DeploymentPatch {
            overlay_tree: Some(Source::dir(output.overlays_dir())),
            cfg_script: self
                .write_auto_installer(output)
                .context("writing the auto installer script")?,
            ..Default::default()
        };
        patch.boot_config.bootloader = installation.bootloader;
        patch.boot_config.kernel_cmdline = cmdline;
        patch.security.crypto_policy = installation.crypto_policy;

        match def.media_type {
            MediaType::Iso => {
                if installation.iso.device.is_empty() {
                    return Err(Error::MissingISODevice.into());
                }
                let mut disk = DiskPatch {
                    device: installation.iso.device.clone(),
                    ..Default::default()
                };
                // First-boot payload needs its own partition in front of the
                // all-remaining system partition, which moves one slot back.
                if output.firstboot_config_dir().is_dir() {
                    let system = baseline
                        .system_partition()
                        .context("installer description carries no system partition")?
                        .clone();
                    disk.partitions = vec![
                        PartitionSlot::Keep,
                        PartitionSlot::Keep,
                        PartitionSlot::Remove,
                        PartitionSlot::Set(config_partition(CONFIG_PART_SIZE)),
                        PartitionSlot::Set(system),
                    ];
                }
                patch.disks = vec![DiskSlot::Set(disk)];
            }
            MediaType::Raw => {}
        }

        Ok(patch)
    }

    fn write_auto_installer(&self, output: &OutputDir) -> Result<String> {
        let path = output.0.join(AUTO_INSTALLER);
        let script = "#!/bin/sh\n\
                      set -eu\n\
                      \n\
                      exec elemental-builder install --description /run/initramfs/live/install.yaml\n";
        fs::write(&path, script)
            .with_context(|| format!("writing '{}'", path.display()))?;
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(0o744);
        fs::set_permissions(&path, perms)?;
        Ok(path.display().to_string())
    }
}
