//! Kubernetes resource configuration.
//!
//! Emits HelmChart CRDs, collects local and remote manifests into the
//! overlay, and generates the first-boot scripts that apply them: a resource
//! deployment script (`k8s_res_deploy.sh`) and a companion configuration
//! installer. Returned paths are rooted at the target rootfs so they can be
//! referenced from systemd units.

use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use super::{Configuration, OutputDir, HELM_PATH, K8S_MANIFESTS_PATH};
use crate::cancel::CancelToken;
use crate::helm::{write_chart_crds, ChartSpec, ValuesResolver};
use crate::http::Downloader;
use crate::manifest::ResolvedManifest;

/// Path of the resource deployment script on the target rootfs.
pub const K8S_RES_DEPLOY_SCRIPT: &str = "/var/lib/elemental/kubernetes/k8s_res_deploy.sh";
/// Path of the configuration installer script on the target rootfs.
pub const K8S_CONFIG_INSTALL_SCRIPT: &str = "/var/lib/elemental/kubernetes/k8s_config_install.sh";

const K8S_CONFIG_PATH: &str = "var/lib/elemental/kubernetes/config";

/// Capability emitting HelmChart CRDs for the requested charts. Returns the
/// written file names, relative to the helm overlay directory.
pub trait HelmConfigurator: Send + Sync {
    fn configure(&self, conf: &Configuration, rm: &ResolvedManifest) -> Result<Vec<String>>;
}

/// Default configurator merging user charts and release-manifest charts.
pub struct Helm {
    output: OutputDir,
    values: ValuesResolver,
}

impl Helm {
    pub fn new(output: OutputDir, values: ValuesResolver) -> Self {
        Self { output, values }
    }
}

impl HelmConfigurator for Helm {
    fn configure(&self, conf: &Configuration, rm: &ResolvedManifest) -> Result<Vec<String>> {
        let mut charts: Vec<ChartSpec> = Vec::new();

        if let Some(user_helm) = &conf.kubernetes.helm {
            for chart in &user_helm.charts {
                let repository = match user_helm
                    .repositories
                    .iter()
                    .find(|r| r.name == chart.repository_name)
                {
                    Some(repo) => repo.url.clone(),
                    None => bail!(
                        "helm chart '{}' references unknown repository '{}'",
                        chart.name,
                        chart.repository_name
                    ),
                };
                charts.push(ChartSpec {
                    name: chart.name.clone(),
                    version: chart.version.clone(),
                    repository,
                    namespace: chart.target_namespace.clone(),
                    ..Default::default()
                });
            }
        }

        for requested in &conf.release.components.helm_charts {
            let Some(def) = rm
                .product_helm_charts()
                .iter()
                .find(|c| c.name == requested.name)
            else {
                bail!(
                    "helm chart '{}' not defined by the release manifest",
                    requested.name
                );
            };
            charts.push(ChartSpec {
                name: def.name.clone(),
                chart: def.chart.clone(),
                version: def.version.clone(),
                repository: def.repository.clone(),
                namespace: def.namespace.clone(),
            });
        }

        write_chart_crds(&self.output.helm_dir(), &charts, &self.values)
    }
}

pub fn needs_manifests_setup(conf: &Configuration) -> bool {
    !conf.kubernetes.local_manifests.is_empty() || !conf.kubernetes.remote_manifests.is_empty()
}

pub fn needs_helm_charts_setup(conf: &Configuration) -> bool {
    conf.kubernetes
        .helm
        .as_ref()
        .is_some_and(|h| !h.charts.is_empty())
        || !conf.release.components.helm_charts.is_empty()
}

fn needs_config_setup(conf: &Configuration) -> bool {
    conf.kubernetes.config.server.is_some()
        || conf.kubernetes.config.agent.is_some()
        || !conf.kubernetes.nodes.is_empty()
        || conf
            .release
            .components
            .systemd_extensions
            .iter()
            .any(|e| e.name == "rke2" || e.name == "k3s")
        || needs_manifests_setup(conf)
        || needs_helm_charts_setup(conf)
}

/// Configure Kubernetes resources into the overlay. Returns the rootfs
/// paths of the deployment script and the configuration installer script;
/// either may be empty when the corresponding step has nothing to do.
pub fn configure_kubernetes(
    conf: &Configuration,
    rm: &ResolvedManifest,
    output: &OutputDir,
    helm: Option<&dyn HelmConfigurator>,
    downloader: &dyn Downloader,
    cancel: &CancelToken,
) -> Result<(String, String)> {
    let mut chart_files = Vec::new();
    if needs_helm_charts_setup(conf) {
        let configurator =
            helm.context("helm charts requested but no helm configurator is set up")?;
        chart_files = configurator
            .configure(conf, rm)
            .context("configuring helm charts")?;
    }

    let mut have_manifests = false;
    if needs_manifests_setup(conf) {
        setup_manifests(conf, output, downloader, cancel)?;
        have_manifests = true;
    }

    let mut deploy_script = String::new();
    if have_manifests || !chart_files.is_empty() {
        write_resource_script(output, have_manifests, &chart_files)?;
        deploy_script = K8S_RES_DEPLOY_SCRIPT.to_string();
    }

    let mut config_script = String::new();
    if needs_config_setup(conf) {
        write_config_installer(conf, output)?;
        config_script = K8S_CONFIG_INSTALL_SCRIPT.to_string();
    }

    Ok((deploy_script, config_script))
}

fn setup_manifests(
    conf: &Configuration,
    output: &OutputDir,
    downloader: &dyn Downloader,
    cancel: &CancelToken,
) -> Result<()> {
    let dest = output.k8s_manifests_dir();
    fs::create_dir_all(&dest)
        .with_context(|| format!("creating manifests directory '{}'", dest.display()))?;

    for url in &conf.kubernetes.remote_manifests {
        let name = url.rsplit('/').next().unwrap_or(url.as_str());
        downloader
            .download(cancel, url, &dest.join(name))
            .with_context(|| format!("downloading remote Kubernetes manifest '{url}'"))?;
    }

    for local in &conf.kubernetes.local_manifests {
        let name = local
            .file_name()
            .with_context(|| format!("manifest '{}' has no file name", local.display()))?;
        fs::copy(local, dest.join(name))
            .with_context(|| format!("copying local Kubernetes manifest '{}'", local.display()))?;
    }
    Ok(())
}

fn write_executable(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating '{}'", parent.display()))?;
    }
    fs::write(path, content)
        .with_context(|| format!("writing script '{}'", path.display()))?;
    let mut perms = fs::metadata(path)
        .with_context(|| format!("reading metadata of '{}'", path.display()))?
        .permissions();
    perms.set_mode(0o744);
    fs::set_permissions(path, perms)
        .with_context(|| format!("setting permissions on '{}'", path.display()))?;
    Ok(())
}

/// Applies manifests first, then charts, in declaration order.
fn write_resource_script(
    output: &OutputDir,
    have_manifests: bool,
    chart_files: &[String],
) -> Result<()> {
    let mut script = String::from(
        "#!/bin/sh\n\
         set -eu\n\
         \n\
         export KUBECONFIG=/etc/rancher/rke2/rke2.yaml\n\
         KUBECTL=/var/lib/rancher/rke2/bin/kubectl\n\
         \n\
         deployManifests() {\n\
         \tfor manifest in /",
    );
    script.push_str(K8S_MANIFESTS_PATH);
    script.push_str(
        "/*.yaml; do\n\
         \t\t[ -e \"$manifest\" ] || continue\n\
         \t\t\"$KUBECTL\" apply -f \"$manifest\"\n\
         \tdone\n\
         }\n\
         \n\
         deployHelmCharts() {\n",
    );
    for chart in chart_files {
        script.push_str(&format!("\t\"$KUBECTL\" apply -f \"/{HELM_PATH}/{chart}\"\n"));
    }
    script.push_str("}\n\n");
    if have_manifests {
        script.push_str("deployManifests\n");
    }
    if !chart_files.is_empty() {
        script.push_str("deployHelmCharts\n");
    }

    let path = output
        .overlays_dir()
        .join(K8S_RES_DEPLOY_SCRIPT.trim_start_matches('/'));
    write_executable(&path, &script)
}

fn write_config_installer(conf: &Configuration, output: &OutputDir) -> Result<()> {
    let config_dir = output.overlays_dir().join(K8S_CONFIG_PATH);
    fs::create_dir_all(&config_dir)
        .with_context(|| format!("creating '{}'", config_dir.display()))?;

    for (role, path) in [
        ("server", &conf.kubernetes.config.server),
        ("agent", &conf.kubernetes.config.agent),
    ] {
        if let Some(src) = path {
            fs::copy(src, config_dir.join(format!("{role}.yaml"))).with_context(|| {
                format!("copying kubernetes {role} config '{}'", src.display())
            })?;
        }
    }

    let mut script = String::from(
        "#!/bin/sh\n\
         set -eu\n\
         \n\
         CONFIG_SRC=/",
    );
    script.push_str(K8S_CONFIG_PATH);
    script.push_str(
        "\nCONFIG_DST=/etc/rancher/rke2\n\
         \n\
         mkdir -p \"$CONFIG_DST\"\n\
         ROLE=server\n",
    );
    if !conf.kubernetes.nodes.is_empty() {
        script.push_str("case \"$(hostname)\" in\n");
        for node in &conf.kubernetes.nodes {
            script.push_str(&format!(
                "\t{})\n\t\tROLE={}\n\t\t;;\n",
                node.hostname, node.node_type
            ));
        }
        script.push_str("esac\n");
    }
    script.push_str(
        "if [ -f \"$CONFIG_SRC/$ROLE.yaml\" ]; then\n\
         \tcp \"$CONFIG_SRC/$ROLE.yaml\" \"$CONFIG_DST/config.yaml\"\n\
         fi\n",
    );

    let path = output
        .overlays_dir()
        .join(K8S_CONFIG_INSTALL_SCRIPT.trim_start_matches('/'));
    write_executable(&path, &script)
}
