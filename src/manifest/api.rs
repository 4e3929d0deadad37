//! Release-manifest schema.
//!
//! Two documents: the core platform manifest (operating system image,
//! systemd extensions, optional reference to a product extension) and the
//! product extension manifest (Helm charts). Parsing is strict so schema
//! typos fail loudly instead of silently dropping components.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub creation_date: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Image {
    /// Base OS image unpacked onto the system partition.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base: String,
    /// Installer ISO carrying the vendor deployment skeleton.
    #[serde(default, rename = "iso", skip_serializing_if = "String::is_empty")]
    pub iso: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OperatingSystem {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default)]
    pub image: Image,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SystemdExtension {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Systemd {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<SystemdExtension>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CoreComponents {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operating_system: Option<OperatingSystem>,
    #[serde(default)]
    pub systemd: Systemd,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CoreReleaseManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub components: CoreComponents,
    /// URI of the product extension manifest, dereferenced identically to
    /// the core one.
    #[serde(default, rename = "productExtension", skip_serializing_if = "String::is_empty")]
    pub product_extension: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ManifestHelmChart {
    pub name: String,
    /// Chart identifier inside the repository; defaults to the name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chart: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Helm {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub charts: Vec<ManifestHelmChart>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProductComponents {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<Helm>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProductReleaseManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub components: ProductComponents,
}

/// The pair of manifests a release URI resolves to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedManifest {
    pub core_platform: CoreReleaseManifest,
    pub product_extension: Option<ProductReleaseManifest>,
}

impl ResolvedManifest {
    /// The base OS image reference, when the core manifest defines one.
    pub fn os_base_image(&self) -> Option<&str> {
        self.core_platform
            .components
            .operating_system
            .as_ref()
            .map(|os| os.image.base.as_str())
            .filter(|s| !s.is_empty())
    }

    /// The installer ISO image reference, when the core manifest defines one.
    pub fn installer_iso_image(&self) -> Option<&str> {
        self.core_platform
            .components
            .operating_system
            .as_ref()
            .map(|os| os.image.iso.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Helm charts carried by the product extension, empty when absent.
    pub fn product_helm_charts(&self) -> &[ManifestHelmChart] {
        self.product_extension
            .as_ref()
            .and_then(|p| p.components.helm.as_ref())
            .map(|h| h.charts.as_slice())
            .unwrap_or(&[])
    }
}

pub fn parse_core_manifest(data: &str) -> Result<CoreReleaseManifest> {
    serde_yaml::from_str(data).map_err(|e| anyhow::Error::new(Error::Schema(e.to_string())))
}

pub fn parse_product_manifest(data: &str) -> Result<ProductReleaseManifest> {
    serde_yaml::from_str(data).map_err(|e| anyhow::Error::new(Error::Schema(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CORE: &str = r#"
metadata:
  name: unified-core
  version: "3.1.2"
components:
  operatingSystem:
    version: "6.2"
    image:
      base: registry.suse.com/elemental/os-base:6.2
      iso: registry.suse.com/elemental/os-installer-iso:6.2
  systemd:
    extensions:
      - name: rke2
        image: registry.suse.com/elemental/rke2-sysext:1.31
productExtension: oci://registry.suse.com/elemental/product-manifest:3.1.2
"#;

    #[test]
    fn parses_core_manifest() {
        let m = parse_core_manifest(CORE).unwrap();
        assert_eq!(
            m.components.operating_system.as_ref().unwrap().image.base,
            "registry.suse.com/elemental/os-base:6.2"
        );
        assert_eq!(m.components.systemd.extensions[0].name, "rke2");
        assert!(m.product_extension.starts_with("oci://"));
    }

    #[test]
    fn strict_fields_reject_typos() {
        let err = parse_core_manifest("components:\n  operatingSistem: {}\n").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Schema(_))));
    }

    #[test]
    fn resolved_accessors() {
        let rm = ResolvedManifest {
            core_platform: parse_core_manifest(CORE).unwrap(),
            product_extension: Some(ProductReleaseManifest {
                components: ProductComponents {
                    helm: Some(Helm {
                        charts: vec![ManifestHelmChart {
                            name: "rancher".to_string(),
                            ..Default::default()
                        }],
                    }),
                },
                ..Default::default()
            }),
        };
        assert_eq!(
            rm.os_base_image(),
            Some("registry.suse.com/elemental/os-base:6.2")
        );
        assert_eq!(rm.product_helm_charts().len(), 1);

        let empty = ResolvedManifest::default();
        assert_eq!(empty.os_base_image(), None);
        assert!(empty.product_helm_charts().is_empty());
    }
}
