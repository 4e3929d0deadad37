//! RAW image build pipeline.
//!
//! Top-level orchestration for `build`: configure all components into the
//! output directory, create and attach a sparse RAW image, synthesize a
//! deployment from the resolved manifest plus the installation parameters,
//! sanitize it and hand it to the installer. The loop device is always
//! detached, whatever the outcome.

use anyhow::{Context, Result};

use crate::cancel::CancelToken;
use crate::config::{Configuration, Definition, OutputDir};
use crate::deployment::{Deployment, Source};
use crate::error::Error;
use crate::install::{dir_size_mib, Installer};
use crate::manifest::ResolvedManifest;
use crate::media;
use crate::process::SharedRunner;

pub trait ConfigManager {
    fn configure_components(
        &self,
        conf: &Configuration,
        output: &OutputDir,
    ) -> Result<ResolvedManifest>;
}

impl ConfigManager for crate::config::manager::Manager {
    fn configure_components(
        &self,
        conf: &Configuration,
        output: &OutputDir,
    ) -> Result<ResolvedManifest> {
        crate::config::manager::Manager::configure_components(self, conf, output)
    }
}

pub struct Builder {
    runner: SharedRunner,
    cancel: CancelToken,
    config_manager: Box<dyn ConfigManager>,
    local: bool,
}

impl Builder {
    pub fn new(
        runner: SharedRunner,
        cancel: CancelToken,
        config_manager: Box<dyn ConfigManager>,
        local: bool,
    ) -> Self {
        Self {
            runner,
            cancel,
            config_manager,
            local,
        }
    }

    pub fn run(&self, def: &Definition, output: &OutputDir) -> Result<()> {
        tracing::info!("Configuring image components");
        let rm = self
            .config_manager
            .configure_components(&def.configuration, output)?;

        tracing::info!("Creating RAW disk image");
        media::truncate_image(
            &self.runner,
            &def.output_image_name,
            &def.configuration.installation.raw.disk_size,
        )
        .context("creating the RAW disk image")?;
        self.cancel.check()?;

        tracing::info!("Attaching loop device to RAW disk image");
        let device = media::attach_device(&self.runner, &def.output_image_name)
            .context("attaching the RAW disk image")?;

        let outcome = self.install_to_device(def, output, &rm, &device);

        match (outcome, media::detach_device(&self.runner, &device)) {
            (outcome, Ok(())) => outcome,
            (Ok(()), Err(detach_err)) => {
                Err(detach_err).context("detaching the loop device")
            }
            (Err(primary), Err(detach_err)) => {
                tracing::error!("Detaching loop device failed: {detach_err:#}");
                Err(primary.context(format!("detaching the loop device also failed: {detach_err:#}")))
            }
        }
    }

    fn install_to_device(
        &self,
        def: &Definition,
        output: &OutputDir,
        rm: &ResolvedManifest,
        device: &str,
    ) -> Result<()> {
        std::fs::create_dir_all(output.overlays_dir())
            .context("creating the overlay directory")?;

        tracing::info!("Preparing installation setup");
        let mut dep = new_deployment(def, output, rm, device)
            .context("preparing installation setup")?;

        tracing::info!("Installing OS");
        Installer::new(self.runner.clone(), self.cancel.clone())
            .with_local(self.local)
            .install(&mut dep)
            .context("installing the OS")?;

        tracing::info!("Installation complete");
        Ok(())
    }
}

/// Synthesize the deployment for a build: default layout, optional
/// first-boot configuration partition, OS source from the resolved
/// manifest, overlays from the output directory.
pub fn new_deployment(
    def: &Definition,
    output: &OutputDir,
    rm: &ResolvedManifest,
    device: &str,
) -> Result<Deployment> {
    let mut d = Deployment::new();

    let firstboot = output.firstboot_config_dir();
    if firstboot.is_dir() {
        let size = dir_size_mib(&firstboot).context("computing configuration partition size")?;
        d.with_config_partition(size);
    }

    d.disks[0].device = device.to_string();
    let installation = &def.configuration.installation;
    d.boot_config.bootloader = installation.bootloader;
    d.boot_config.kernel_cmdline = installation.kernel_cmdline.clone();
    d.security.crypto_policy = installation.crypto_policy;

    let os_image = rm
        .os_base_image()
        .context("release manifest carries no base OS image")?;
    d.source_os = Source::oci(os_image);
    d.overlay_tree = Some(Source::dir(output.overlays_dir()));

    d.sanitize().context("sanitizing deployment")?;
    Ok(d)
}

/// Validate build inputs before any side effect.
pub fn validate_definition(def: &Definition) -> Result<()> {
    let size = &def.configuration.installation.raw.disk_size;
    if !size.0.is_empty() && !size.is_valid() {
        return Err(Error::InvalidDiskSize(size.0.clone()).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiskSize, Installation, MediaType};
    use crate::deployment::{Bootloader, CryptoPolicy, PartRole, ALL_AVAILABLE_SIZE};
    use crate::manifest::api::{CoreComponents, CoreReleaseManifest, Image, OperatingSystem};
    use tempfile::TempDir;

    fn manifest() -> ResolvedManifest {
        ResolvedManifest {
            core_platform: CoreReleaseManifest {
                components: CoreComponents {
                    operating_system: Some(OperatingSystem {
                        image: Image {
                            base: "registry.suse.com/os-base:6.2".to_string(),
                            ..Default::default()
                        },
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            },
            product_extension: None,
        }
    }

    fn definition(disk_size: &str) -> Definition {
        Definition {
            media_type: MediaType::Raw,
            output_image_name: "image.raw".into(),
            configuration: Configuration {
                installation: Installation {
                    bootloader: Bootloader::Grub,
                    kernel_cmdline: "console=ttyS0".to_string(),
                    crypto_policy: CryptoPolicy::Default,
                    raw: crate::config::RawMedia {
                        disk_size: DiskSize(disk_size.to_string()),
                    },
                    ..Default::default()
                },
                ..Default::default()
            },
        }
    }

    #[test]
    fn deployment_synthesis_minimal() {
        let tmp = TempDir::new().unwrap();
        let output = OutputDir::new(tmp.path());
        std::fs::create_dir_all(output.overlays_dir()).unwrap();

        let d = new_deployment(&definition("35G"), &output, &manifest(), "/dev/loop0").unwrap();
        assert_eq!(d.disks[0].device, "/dev/loop0");
        assert_eq!(d.boot_config.bootloader, Bootloader::Grub);
        assert_eq!(d.boot_config.kernel_cmdline, "console=ttyS0");
        assert_eq!(
            d.source_os.to_string(),
            "oci://registry.suse.com/os-base:6.2"
        );
        let roles: Vec<PartRole> = d.disks[0].partitions.iter().map(|p| p.role).collect();
        assert_eq!(
            roles,
            vec![PartRole::Efi, PartRole::Recovery, PartRole::System]
        );
        assert_eq!(d.disks[0].partitions.last().unwrap().size, ALL_AVAILABLE_SIZE);
    }

    #[test]
    fn fips_policy_propagates_to_cmdline() {
        let tmp = TempDir::new().unwrap();
        let output = OutputDir::new(tmp.path());
        std::fs::create_dir_all(output.overlays_dir()).unwrap();
        let mut def = definition("35G");
        def.configuration.installation.crypto_policy = CryptoPolicy::Fips;

        let d = new_deployment(&def, &output, &manifest(), "/dev/loop0").unwrap();
        assert_eq!(d.boot_config.kernel_cmdline, "console=ttyS0 fips=1");
    }

    #[test]
    fn firstboot_payload_adds_config_partition() {
        let tmp = TempDir::new().unwrap();
        let output = OutputDir::new(tmp.path());
        std::fs::create_dir_all(output.firstboot_config_dir()).unwrap();
        std::fs::write(output.firstboot_config_dir().join("ignition.ign"), "{}").unwrap();

        let d = new_deployment(&definition("35G"), &output, &manifest(), "/dev/loop0").unwrap();
        let labels: Vec<&str> = d.disks[0]
            .partitions
            .iter()
            .map(|p| p.label.as_str())
            .collect();
        assert_eq!(labels, vec!["EFI", "RECOVERY", "CONFIG", "SYSTEM"]);
    }

    #[test]
    fn missing_os_image_fails() {
        let tmp = TempDir::new().unwrap();
        let output = OutputDir::new(tmp.path());
        std::fs::create_dir_all(output.overlays_dir()).unwrap();

        let err = new_deployment(
            &definition("35G"),
            &output,
            &ResolvedManifest::default(),
            "/dev/loop0",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("no base OS image"));
    }

    #[test]
    fn invalid_disk_size_is_rejected_upfront() {
        let err = validate_definition(&definition("-8M")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidDiskSize(_))
        ));
        assert!(validate_definition(&definition("")).is_ok());
    }
}
