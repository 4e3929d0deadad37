//! HelmChart custom resource emission.
//!
//! Charts requested by the user configuration or carried by the product
//! release manifest are rendered as `helm.cattle.io/v1` HelmChart resources
//! that the node's bootstrap Kubernetes applies on first boot. Values files
//! are resolved from the configuration directory.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const HELM_CHART_API_VERSION: &str = "helm.cattle.io/v1";
const HELM_CHART_KIND: &str = "HelmChart";
const HELM_BACKOFF_LIMIT: u32 = 20;
const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Crd {
    pub api_version: String,
    pub kind: String,
    pub metadata: CrdMetadata,
    pub spec: CrdSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdSpec {
    pub chart: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub values_content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_namespace: String,
    pub create_namespace: bool,
    pub back_off_limit: u32,
}

impl Crd {
    pub fn new(
        namespace: &str,
        chart: &str,
        version: &str,
        values_content: &str,
        repository: &str,
    ) -> Self {
        let name = chart.to_string();
        let (chart, repository) = if repository.starts_with("oci") {
            // An OCI registry is addressed through the chart identifier; the
            // repo field is only valid for HTTP(S) repositories.
            (format!("{repository}/{name}"), String::new())
        } else {
            (name.clone(), repository.to_string())
        };

        Crd {
            api_version: HELM_CHART_API_VERSION.to_string(),
            kind: HELM_CHART_KIND.to_string(),
            metadata: CrdMetadata {
                name,
                namespace: KUBE_SYSTEM_NAMESPACE.to_string(),
            },
            spec: CrdSpec {
                chart,
                version: version.to_string(),
                repo: repository,
                values_content: values_content.to_string(),
                target_namespace: namespace.to_string(),
                create_namespace: true,
                back_off_limit: HELM_BACKOFF_LIMIT,
            },
        }
    }
}

/// Reads per-chart values files from `<config-dir>/kubernetes/helm/values`.
pub struct ValuesResolver {
    pub values_dir: PathBuf,
}

impl ValuesResolver {
    /// The values content for a chart, empty when no file exists.
    pub fn resolve(&self, chart_name: &str) -> Result<String> {
        for ext in ["yaml", "yml"] {
            let path = self.values_dir.join(format!("{chart_name}.{ext}"));
            if path.is_file() {
                return fs::read_to_string(&path)
                    .with_context(|| format!("reading helm values '{}'", path.display()));
            }
        }
        Ok(String::new())
    }
}

/// A chart merged from user configuration and release manifest data, ready
/// to render.
#[derive(Debug, Clone, Default)]
pub struct ChartSpec {
    pub name: String,
    pub chart: String,
    pub version: String,
    pub repository: String,
    pub namespace: String,
}

/// Render chart CRDs into `dest_dir`, returning the written file names.
pub fn write_chart_crds(
    dest_dir: &PathBuf,
    charts: &[ChartSpec],
    values: &ValuesResolver,
) -> Result<Vec<String>> {
    fs::create_dir_all(dest_dir)
        .with_context(|| format!("creating helm chart directory '{}'", dest_dir.display()))?;

    let mut files = Vec::with_capacity(charts.len());
    for chart in charts {
        if chart.name.is_empty() {
            bail!("helm chart without a name");
        }
        let chart_id = if chart.chart.is_empty() {
            &chart.name
        } else {
            &chart.chart
        };
        let values_content = values
            .resolve(&chart.name)
            .with_context(|| format!("resolving values for chart '{}'", chart.name))?;
        let crd = Crd::new(
            &chart.namespace,
            chart_id,
            &chart.version,
            &values_content,
            &chart.repository,
        );
        let file_name = format!("{}.yaml", chart.name);
        let data = serde_yaml::to_string(&crd)
            .with_context(|| format!("serializing chart '{}'", chart.name))?;
        fs::write(dest_dir.join(&file_name), data)
            .with_context(|| format!("writing chart '{}'", file_name))?;
        files.push(file_name);
    }
    Ok(files)
}
