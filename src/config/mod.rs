//! Declarative configuration directory.
//!
//! A configuration directory carries the installation parameters, a release
//! reference, optional Kubernetes/Helm definitions, first-boot Butane
//! configuration, network configuration and custom scripts. Parsing is
//! strict-field so typos fail instead of being silently ignored.

pub mod ignition;
pub mod kubernetes;
pub mod manager;
pub mod network;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::deployment::{Bootloader, CryptoPolicy, CONFIG_MNT};
use crate::error::Error;

pub const NETWORK_CUSTOM_SCRIPT: &str = "configure-network.sh";

/// Overlay paths on the target rootfs.
pub const HELM_PATH: &str = "var/lib/elemental/kubernetes/helm";
pub const K8S_MANIFESTS_PATH: &str = "var/lib/elemental/kubernetes/manifests";
pub const EXTENSIONS_PATH: &str = "var/lib/elemental/extensions";
pub const IGNITION_FILE: &str = "ignition.ign";

/// Configuration directory layout.
#[derive(Debug, Clone)]
pub struct ConfigDir(pub PathBuf);

impl ConfigDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn install_file(&self) -> PathBuf {
        self.0.join("install.yaml")
    }

    pub fn release_file(&self) -> PathBuf {
        self.0.join("release.yaml")
    }

    pub fn kubernetes_file(&self) -> PathBuf {
        self.0.join("kubernetes.yaml")
    }

    pub fn butane_file(&self) -> PathBuf {
        self.0.join("butane.yaml")
    }

    pub fn kubernetes_config_dir(&self) -> PathBuf {
        self.0.join("kubernetes/config")
    }

    pub fn kubernetes_manifests_dir(&self) -> PathBuf {
        self.0.join("kubernetes/manifests")
    }

    pub fn helm_values_dir(&self) -> PathBuf {
        self.0.join("kubernetes/helm/values")
    }

    pub fn network_dir(&self) -> PathBuf {
        self.0.join("network")
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.0.join("scripts")
    }

    pub fn files_dir(&self) -> PathBuf {
        self.0.join("files")
    }
}

/// Output directory layout for one build or customize run.
#[derive(Debug, Clone)]
pub struct OutputDir(pub PathBuf);

impl OutputDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Tree rsynced onto the new rootfs.
    pub fn overlays_dir(&self) -> PathBuf {
        self.0.join("overlays")
    }

    /// First-boot configuration partition content inside the overlay.
    pub fn firstboot_config_dir(&self) -> PathBuf {
        self.overlays_dir()
            .join(CONFIG_MNT.trim_start_matches('/'))
    }

    pub fn catalyst_config_dir(&self) -> PathBuf {
        self.firstboot_config_dir().join("catalyst")
    }

    pub fn helm_dir(&self) -> PathBuf {
        self.overlays_dir().join(HELM_PATH)
    }

    pub fn k8s_manifests_dir(&self) -> PathBuf {
        self.overlays_dir().join(K8S_MANIFESTS_PATH)
    }

    pub fn extensions_dir(&self) -> PathBuf {
        self.overlays_dir().join(EXTENSIONS_PATH)
    }

    /// Content-addressed store for OCI-extracted release manifests.
    pub fn release_manifests_store_dir(&self) -> PathBuf {
        self.0.join("store/release-manifests")
    }

    pub fn iso_store_dir(&self) -> PathBuf {
        self.0.join("store/iso")
    }
}

/// Create a timestamped run directory under `base`.
pub fn create_output_dir(base: &Path, name: &str) -> Result<OutputDir> {
    let dir = base.join(name);
    fs::create_dir_all(&dir)
        .with_context(|| format!("creating output directory '{}'", dir.display()))?;
    Ok(OutputDir::new(dir))
}

/// Free-form disk size such as `35G`. Validated at the boundary and passed
/// verbatim to `truncate`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiskSize(pub String);

impl DiskSize {
    pub fn is_valid(&self) -> bool {
        let s = self.0.as_str();
        if s.is_empty() {
            return false;
        }
        let digits = s.strip_suffix(['K', 'M', 'G', 'T']).unwrap_or(s);
        !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawMedia {
    #[serde(default, skip_serializing_if = "disk_size_is_empty")]
    pub disk_size: DiskSize,
}

fn disk_size_is_empty(v: &DiskSize) -> bool {
    v.0.is_empty()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IsoMedia {
    /// Target installation device the installer writes to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device: String,
}

/// `install.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Installation {
    #[serde(default)]
    pub bootloader: Bootloader,
    #[serde(default, rename = "kernelCmdLine", skip_serializing_if = "String::is_empty")]
    pub kernel_cmdline: String,
    #[serde(default)]
    pub crypto_policy: CryptoPolicy,
    #[serde(default, rename = "raw")]
    pub raw: RawMedia,
    #[serde(default, rename = "iso")]
    pub iso: IsoMedia,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReleaseSystemdExtension {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReleaseHelmChart {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReleaseComponents {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub systemd_extensions: Vec<ReleaseSystemdExtension>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub helm_charts: Vec<ReleaseHelmChart>,
}

/// `release.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Release {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "manifestURI")]
    pub manifest_uri: String,
    #[serde(default)]
    pub components: ReleaseComponents,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KubernetesNetwork {
    #[serde(default, rename = "apiVIP", skip_serializing_if = "String::is_empty")]
    pub api_vip4: String,
    #[serde(default, rename = "apiVIP6", skip_serializing_if = "String::is_empty")]
    pub api_vip6: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KubernetesNode {
    pub hostname: String,
    #[serde(rename = "type")]
    pub node_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserHelmChart {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HelmRepository {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserHelm {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub charts: Vec<UserHelmChart>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<HelmRepository>,
}

/// Paths to optional Kubernetes distribution config files found in the
/// configuration directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KubernetesConfigFiles {
    pub server: Option<PathBuf>,
    pub agent: Option<PathBuf>,
}

/// `kubernetes.yaml` plus data discovered under `kubernetes/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Kubernetes {
    #[serde(default)]
    pub network: KubernetesNetwork,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<KubernetesNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<UserHelm>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remote_manifests: Vec<String>,
    #[serde(skip)]
    pub local_manifests: Vec<PathBuf>,
    #[serde(skip)]
    pub config: KubernetesConfigFiles,
}

/// Network configuration discovered under `network/`: either exactly one
/// custom script or a flat directory of nmstate files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Network {
    pub custom_script: Option<PathBuf>,
    pub config_dir: Option<PathBuf>,
}

/// Custom first-boot scripts and payload files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Custom {
    pub scripts_dir: Option<PathBuf>,
    pub files_dir: Option<PathBuf>,
}

/// Fully-parsed configuration directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    pub installation: Installation,
    pub release: Release,
    pub kubernetes: Kubernetes,
    pub network: Network,
    pub custom: Custom,
    pub butane_config: Option<serde_yaml::Value>,
}

/// The requested artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MediaType {
    #[default]
    Raw,
    Iso,
}

impl MediaType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(MediaType::Raw),
            "iso" => Ok(MediaType::Iso),
            other => bail!("unsupported media type {other}"),
        }
    }
}

/// Image definition digested from CLI flags plus the configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Definition {
    pub media_type: MediaType,
    pub output_image_name: PathBuf,
    pub configuration: Configuration,
}

fn parse_strict<T: serde::de::DeserializeOwned>(data: &str, path: &Path) -> Result<T> {
    serde_yaml::from_str(data)
        .map_err(|e| anyhow::Error::new(Error::Schema(e.to_string())))
        .with_context(|| format!("parsing config file '{}'", path.display()))
}

/// Parse a configuration directory.
pub fn parse(config_dir: &ConfigDir) -> Result<Configuration> {
    let mut conf = Configuration::default();

    let install_path = config_dir.install_file();
    let data = fs::read_to_string(&install_path)
        .with_context(|| format!("reading config file '{}'", install_path.display()))?;
    conf.installation = parse_strict(&data, &install_path)?;

    let release_path = config_dir.release_file();
    let data = fs::read_to_string(&release_path)
        .with_context(|| format!("reading config file '{}'", release_path.display()))?;
    conf.release = parse_strict(&data, &release_path)?;
    sanitize_manifest_uri(&mut conf.release, &config_dir.0)
        .context("updating manifest URI")?;

    parse_kubernetes(config_dir, &mut conf.kubernetes, &mut conf.release)
        .context("parsing kubernetes configuration")?;

    conf.network =
        network::parse_network_dir(config_dir).context("parsing network directory")?;

    conf.custom = parse_custom_dirs(config_dir);

    let butane_path = config_dir.butane_file();
    match fs::read_to_string(&butane_path) {
        Ok(data) => {
            let value: serde_yaml::Value = serde_yaml::from_str(&data)
                .map_err(|e| anyhow::Error::new(Error::Schema(e.to_string())))
                .with_context(|| format!("parsing config file '{}'", butane_path.display()))?;
            conf.butane_config = Some(value);
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| {
                format!("reading config file '{}'", butane_path.display())
            });
        }
    }

    Ok(conf)
}

/// Rewrite a relative `file://` manifest URI against the absolute
/// configuration directory, so later stages can resolve it from anywhere.
fn sanitize_manifest_uri(release: &mut Release, config_dir: &Path) -> Result<()> {
    const FILE_PREFIX: &str = "file://";

    let Some(rest) = release.manifest_uri.strip_prefix(FILE_PREFIX) else {
        return Ok(());
    };
    let rest = rest.strip_prefix("./").unwrap_or(rest);
    if Path::new(rest).is_absolute() {
        return Ok(());
    }

    let abs = config_dir
        .canonicalize()
        .or_else(|_| {
            std::env::current_dir().map(|cwd| cwd.join(config_dir))
        })
        .context("calculating absolute configuration directory")?;
    release.manifest_uri = format!("{FILE_PREFIX}{}", abs.join(rest).display());
    Ok(())
}

fn parse_kubernetes(
    config_dir: &ConfigDir,
    k8s: &mut Kubernetes,
    release: &mut Release,
) -> Result<()> {
    const METALLB: &str = "metallb";
    const ENDPOINT_COPIER_OPERATOR: &str = "endpoint-copier-operator";

    let path = config_dir.kubernetes_file();
    match fs::read_to_string(&path) {
        Ok(data) => *k8s = parse_strict(&data, &path)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("reading config file '{}'", path.display()));
        }
    }

    // An API VIP needs MetalLB plus the endpoint copier; request them unless
    // the user already did.
    if !k8s.network.api_vip4.is_empty() || !k8s.network.api_vip6.is_empty() {
        for name in [METALLB, ENDPOINT_COPIER_OPERATOR] {
            if !release.components.helm_charts.iter().any(|c| c.name == name) {
                release.components.helm_charts.push(ReleaseHelmChart {
                    name: name.to_string(),
                });
            }
        }
    }

    let manifests_dir = config_dir.kubernetes_manifests_dir();
    match fs::read_dir(&manifests_dir) {
        Ok(entries) => {
            let mut paths: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .collect();
            paths.sort();
            k8s.local_manifests = paths;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("reading '{}'", manifests_dir.display()));
        }
    }

    let server = config_dir.kubernetes_config_dir().join("server.yaml");
    if server.is_file() {
        k8s.config.server = Some(server);
    }
    let agent = config_dir.kubernetes_config_dir().join("agent.yaml");
    if agent.is_file() {
        k8s.config.agent = Some(agent);
    }

    Ok(())
}

fn parse_custom_dirs(config_dir: &ConfigDir) -> Custom {
    let scripts = config_dir.scripts_dir();
    let files = config_dir.files_dir();
    Custom {
        scripts_dir: scripts.is_dir().then_some(scripts),
        files_dir: files.is_dir().then_some(files),
    }
}
