//! Resolution of release-manifest URIs.
//!
//! `oci://` references are unpacked through the extractor into the
//! content-addressed store; `file://` references are read directly. The core
//! manifest may reference a product extension manifest, which is
//! dereferenced the same way.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use super::api::{self, ResolvedManifest};
use super::extractor::OciFileExtractor;
use crate::deployment::Source;
use crate::error::Error;

/// Glob used to locate a release manifest inside an unpacked artifact.
pub const MANIFEST_GLOB: &str = "release-manifest*.yaml";

pub struct Resolver {
    extractor: OciFileExtractor,
}

impl Resolver {
    pub fn new(extractor: OciFileExtractor) -> Self {
        Self { extractor }
    }

    /// Resolve a manifest URI to the `{core, product}` manifest pair.
    pub fn resolve(&self, uri: &str) -> Result<ResolvedManifest> {
        let core_path = self
            .materialize(uri)
            .with_context(|| format!("materializing release manifest '{uri}'"))?;
        let data = fs::read_to_string(&core_path)
            .with_context(|| format!("reading release manifest '{}'", core_path.display()))?;
        let core = api::parse_core_manifest(&data)
            .with_context(|| format!("parsing release manifest '{}'", core_path.display()))?;

        let product = if core.product_extension.is_empty() {
            None
        } else {
            let uri = core.product_extension.clone();
            let path = self
                .materialize(&uri)
                .with_context(|| format!("materializing product extension manifest '{uri}'"))?;
            let data = fs::read_to_string(&path).with_context(|| {
                format!("reading product extension manifest '{}'", path.display())
            })?;
            Some(api::parse_product_manifest(&data).with_context(|| {
                format!("parsing product extension manifest '{}'", path.display())
            })?)
        };

        Ok(ResolvedManifest {
            core_platform: core,
            product_extension: product,
        })
    }

    /// Fetch the manifest file behind a URI into the local filesystem.
    fn materialize(&self, uri: &str) -> Result<PathBuf> {
        match Source::from_uri(uri)? {
            Source::Oci(reference) => self.extractor.extract_from(&reference),
            Source::File(path) => Ok(path),
            other => Err(Error::InvalidSource(other.to_string()).into()),
        }
    }
}
