//! First-boot Ignition configuration.
//!
//! Assembles a Butane document out of the user-provided Butane config, the
//! generated Kubernetes scripts and the enabled systemd extensions, then
//! translates it to Ignition JSON on the first-boot configuration partition.
//! The translation itself is a collaborator; the default implementation
//! drives the `butane` binary.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;

use super::{Configuration, OutputDir, IGNITION_FILE};
use crate::error::Error;
use crate::manifest::SystemdExtension;
use crate::process::{CmdOutput, CmdSpec, Runner, SharedRunner};

const BUTANE_VARIANT: &str = "fcos";
const BUTANE_VERSION: &str = "1.6.0";

/// Manifest of enabled extensions written onto the target system.
pub const EXTENSIONS_MANIFEST: &str = "/etc/elemental/extensions.yaml";

/// Result of a Butane to Ignition translation. Warnings are non-fatal
/// entries reported by the translator, e.g. ignored unknown keys.
pub struct Translation {
    pub ignition: String,
    pub warnings: Vec<String>,
}

pub trait ButaneTranslator: Send + Sync {
    fn translate(&self, butane_yaml: &str) -> Result<Translation>;
}

/// Default translator invoking the `butane` binary.
pub struct BinaryTranslator {
    runner: SharedRunner,
}

impl BinaryTranslator {
    pub fn new(runner: SharedRunner) -> Self {
        Self { runner }
    }
}

impl ButaneTranslator for BinaryTranslator {
    fn translate(&self, butane_yaml: &str) -> Result<Translation> {
        let input = tempfile::NamedTempFile::with_prefix("butane-")
            .context("creating butane input file")?;
        fs::write(input.path(), butane_yaml).context("writing butane input file")?;

        let mut spec = CmdSpec::new("butane");
        spec.args = vec![
            "--pretty".to_string(),
            "--strict=false".to_string(),
            input.path().display().to_string(),
        ];
        let out: CmdOutput = self
            .runner
            .run(&spec)
            .context("running the butane translator")?;

        let warnings: Vec<String> = out
            .stderr_string()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(String::from)
            .collect();

        if !out.success {
            return Err(Error::ButaneTranslation(warnings.join("; ")).into());
        }
        Ok(Translation {
            ignition: out.stdout_string(),
            warnings,
        })
    }
}

#[derive(Debug, Default, Serialize)]
struct ButaneDoc {
    variant: &'static str,
    version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ignition: Option<IgnitionSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    storage: Option<StorageSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    systemd: Option<SystemdSection>,
}

#[derive(Debug, Default, Serialize)]
struct IgnitionSection {
    config: IgnitionConfig,
}

#[derive(Debug, Default, Serialize)]
struct IgnitionConfig {
    merge: Vec<InlineSource>,
}

#[derive(Debug, Default, Serialize)]
struct InlineSource {
    inline: String,
}

#[derive(Debug, Default, Serialize)]
struct StorageSection {
    files: Vec<FileEntry>,
}

#[derive(Debug, Serialize)]
struct FileEntry {
    path: String,
    mode: u32,
    contents: InlineSource,
}

#[derive(Debug, Default, Serialize)]
struct SystemdSection {
    units: Vec<UnitEntry>,
}

#[derive(Debug, Serialize)]
struct UnitEntry {
    name: String,
    enabled: bool,
    contents: String,
}

fn firstboot_unit(name: &str, description: &str, exec_start: &str, after: &str) -> UnitEntry {
    UnitEntry {
        name: name.to_string(),
        enabled: true,
        contents: format!(
            "[Unit]\n\
             Description={description}\n\
             ConditionFirstBoot=true\n\
             After={after}\n\
             \n\
             [Service]\n\
             Type=oneshot\n\
             RemainAfterExit=yes\n\
             ExecStart={exec_start}\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n"
        ),
    }
}

/// Assemble and translate the first-boot configuration. A no-op when there
/// is no user Butane config, no Kubernetes script and no enabled extension.
pub fn configure_ignition(
    conf: &Configuration,
    output: &OutputDir,
    k8s_script: &str,
    k8s_conf_script: &str,
    extensions: &[SystemdExtension],
    translator: &dyn ButaneTranslator,
) -> Result<()> {
    let have_butane = conf.butane_config.is_some();
    if !have_butane && k8s_script.is_empty() && k8s_conf_script.is_empty() && extensions.is_empty()
    {
        tracing::info!("First-boot configuration data not provided, skipping.");
        return Ok(());
    }

    let mut doc = ButaneDoc {
        variant: BUTANE_VARIANT,
        version: BUTANE_VERSION,
        ..Default::default()
    };

    if let Some(user_butane) = &conf.butane_config {
        let user_yaml =
            serde_yaml::to_string(user_butane).context("serializing user Butane config")?;
        let translation = translator
            .translate(&user_yaml)
            .context("translating user Butane config")?;
        log_warnings(&translation.warnings);
        doc.ignition = Some(IgnitionSection {
            config: IgnitionConfig {
                merge: vec![InlineSource {
                    inline: translation.ignition,
                }],
            },
        });
    }

    let mut units = Vec::new();
    if !k8s_conf_script.is_empty() {
        units.push(firstboot_unit(
            "k8s-config-install.service",
            "Kubernetes Config Installer",
            k8s_conf_script,
            "network-online.target",
        ));
    }
    if !k8s_script.is_empty() {
        units.push(firstboot_unit(
            "k8s-resources-install.service",
            "Kubernetes Resources Installer",
            k8s_script,
            "k8s-config-install.service",
        ));
    }

    if !extensions.is_empty() {
        let manifest =
            serde_yaml::to_string(extensions).context("serializing extensions manifest")?;
        doc.storage = Some(StorageSection {
            files: vec![FileEntry {
                path: EXTENSIONS_MANIFEST.to_string(),
                mode: 0o644,
                contents: InlineSource { inline: manifest },
            }],
        });
        units.push(firstboot_unit(
            "sysext-reload.service",
            "Reload systemd units",
            "/usr/bin/systemctl daemon-reload",
            "systemd-sysext.service",
        ));
        units.push(firstboot_unit(
            "kernel-modules-reload.service",
            "Reload kernel modules",
            "/usr/sbin/systemd-modules-load",
            "sysext-reload.service",
        ));
    }
    if !units.is_empty() {
        doc.systemd = Some(SystemdSection { units });
    }

    let doc_yaml = serde_yaml::to_string(&doc).context("serializing assembled Butane doc")?;
    let translation = translator
        .translate(&doc_yaml)
        .context("translating assembled Butane doc")?;
    log_warnings(&translation.warnings);

    let ignition_path = output.firstboot_config_dir().join(IGNITION_FILE);
    write_ignition(&ignition_path, &translation.ignition)
}

fn write_ignition(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating '{}'", parent.display()))?;
    }
    fs::write(path, content)
        .with_context(|| format!("writing ignition file '{}'", path.display()))
}

fn log_warnings(warnings: &[String]) {
    if !warnings.is_empty() {
        tracing::warn!(
            "translating Butane to Ignition reported non fatal entries:\n{}",
            warnings.join("\n")
        );
    }
}
