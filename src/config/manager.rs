//! Component configuration orchestration.
//!
//! `configure_components` walks the configuration in a fixed order, each
//! step short-circuiting on failure: resolve the release manifest, populate
//! the network overlay, stage custom scripts, configure Kubernetes
//! resources, filter and download systemd extensions, and assemble the
//! first-boot Ignition file. All outputs land in the overlay tree that the
//! installer later rsyncs onto the new rootfs.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use super::ignition::{configure_ignition, ButaneTranslator};
use super::kubernetes::{configure_kubernetes, HelmConfigurator};
use super::network::configure_network;
use super::{Configuration, OutputDir};
use crate::cancel::CancelToken;
use crate::error::Error;
use crate::http::Downloader;
use crate::manifest::{ResolvedManifest, Resolver, SystemdExtension};

pub trait ReleaseManifestResolver: Send + Sync {
    fn resolve(&self, uri: &str) -> Result<ResolvedManifest>;
}

impl ReleaseManifestResolver for Resolver {
    fn resolve(&self, uri: &str) -> Result<ResolvedManifest> {
        Resolver::resolve(self, uri)
    }
}

pub struct Manager {
    resolver: Box<dyn ReleaseManifestResolver>,
    downloader: Box<dyn Downloader>,
    helm: Option<Box<dyn HelmConfigurator>>,
    translator: Box<dyn ButaneTranslator>,
    cancel: CancelToken,
}

impl Manager {
    pub fn new(
        resolver: Box<dyn ReleaseManifestResolver>,
        downloader: Box<dyn Downloader>,
        helm: Option<Box<dyn HelmConfigurator>>,
        translator: Box<dyn ButaneTranslator>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            resolver,
            downloader,
            helm,
            translator,
            cancel,
        }
    }

    /// Configure every component described by `conf` into `output`.
    pub fn configure_components(
        &self,
        conf: &Configuration,
        output: &OutputDir,
    ) -> Result<ResolvedManifest> {
        self.cancel.check()?;
        let uri = &conf.release.manifest_uri;
        let rm = self
            .resolver
            .resolve(uri)
            .with_context(|| format!("resolving release manifest at uri '{uri}'"))?;

        fs::create_dir_all(output.overlays_dir()).with_context(|| {
            format!("creating overlay directory '{}'", output.overlays_dir().display())
        })?;

        configure_network(&conf.network, output).context("configuring network")?;

        self.configure_custom_scripts(conf, output)
            .context("configuring custom scripts")?;

        self.cancel.check()?;
        let (k8s_script, k8s_conf_script) = configure_kubernetes(
            conf,
            &rm,
            output,
            self.helm.as_deref(),
            self.downloader.as_ref(),
            &self.cancel,
        )
        .context("configuring kubernetes")?;

        let enabled = filter_enabled_extensions(conf, &rm)
            .context("filtering enabled systemd extensions")?;
        self.download_extensions(&enabled, output)
            .context("configuring system extensions")?;

        configure_ignition(
            conf,
            output,
            &k8s_script,
            &k8s_conf_script,
            &enabled,
            self.translator.as_ref(),
        )
        .context("configuring ignition")?;

        Ok(rm)
    }

    /// Stage user hook scripts and payload files into the catalyst overlay,
    /// plus a generated runner executing the hooks in sorted order.
    fn configure_custom_scripts(&self, conf: &Configuration, output: &OutputDir) -> Result<()> {
        let Some(scripts_dir) = &conf.custom.scripts_dir else {
            tracing::info!("Custom configuration scripts not provided, skipping.");
            return Ok(());
        };

        let catalyst_dir = output.catalyst_config_dir();
        fs::create_dir_all(&catalyst_dir).with_context(|| {
            format!("creating catalyst directory '{}'", catalyst_dir.display())
        })?;

        let mut scripts = Vec::new();
        for entry in fs::read_dir(scripts_dir)
            .with_context(|| format!("reading scripts directory '{}'", scripts_dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let dest = catalyst_dir.join(entry.file_name());
            fs::copy(&path, &dest)
                .with_context(|| format!("copying script '{}'", path.display()))?;
            let mut perms = fs::metadata(&dest)?.permissions();
            perms.set_mode(0o744);
            fs::set_permissions(&dest, perms).with_context(|| {
                format!("setting executable permissions on '{}'", dest.display())
            })?;
            scripts.push(entry.file_name().to_string_lossy().into_owned());
        }

        if let Some(files_dir) = &conf.custom.files_dir {
            copy_tree(files_dir, &catalyst_dir).context("copying custom files")?;
        }

        scripts.sort();
        let mut runner = String::from("#!/bin/sh\nset -eu\n\ncd \"$(dirname \"$0\")\"\n");
        for script in &scripts {
            runner.push_str(&format!("./{script}\n"));
        }
        let runner_path = catalyst_dir.join("script");
        fs::write(&runner_path, runner)
            .with_context(|| format!("writing script '{}'", runner_path.display()))?;
        let mut perms = fs::metadata(&runner_path)?.permissions();
        perms.set_mode(0o744);
        fs::set_permissions(&runner_path, perms)?;

        tracing::info!("Catalyst script written");
        Ok(())
    }

    fn download_extensions(
        &self,
        extensions: &[SystemdExtension],
        output: &OutputDir,
    ) -> Result<()> {
        for ext in extensions {
            self.cancel.check()?;
            let name = ext.image.rsplit('/').next().unwrap_or(ext.image.as_str());
            let dest = output.extensions_dir().join(name);
            self.downloader
                .download(&self.cancel, &ext.image, &dest)
                .with_context(|| {
                    format!("downloading systemd extension '{}' from '{}'", ext.name, ext.image)
                })?;
        }
        Ok(())
    }
}

/// The enabled extension set: the intersection of requested names and
/// manifest-defined extensions. Requesting an undefined name is an error.
pub fn filter_enabled_extensions(
    conf: &Configuration,
    rm: &ResolvedManifest,
) -> Result<Vec<SystemdExtension>> {
    let defined = &rm.core_platform.components.systemd.extensions;
    let mut enabled = Vec::new();
    let mut missing = Vec::new();

    for requested in &conf.release.components.systemd_extensions {
        match defined.iter().find(|d| d.name == requested.name) {
            Some(ext) => enabled.push(ext.clone()),
            None => missing.push(requested.name.clone()),
        }
    }

    if !missing.is_empty() {
        return Err(Error::UnknownExtension(missing).into());
    }
    Ok(enabled)
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(from) {
        let entry = entry.with_context(|| format!("walking '{}'", from.display()))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .expect("walkdir yields children of its root");
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)
                .with_context(|| format!("creating '{}'", dest.display()))?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &dest)
                .with_context(|| format!("copying '{}'", entry.path().display()))?;
        }
    }
    Ok(())
}
