//! Remote file download.
//!
//! Used for remote Kubernetes manifests and systemd extension images. The
//! capability is a trait so the configuration pipeline can run fully offline
//! in tests.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::path::Path;
use std::time::Duration;

use crate::cancel::CancelToken;

pub trait Downloader: Send + Sync {
    /// Download `url` to the file at `dest`.
    fn download(&self, cancel: &CancelToken, url: &str, dest: &Path) -> Result<()>;
}

pub struct HttpDownloader {
    client: reqwest::blocking::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("building HTTP client")?;
        Ok(Self { client })
    }
}

impl Downloader for HttpDownloader {
    fn download(&self, cancel: &CancelToken, url: &str, dest: &Path) -> Result<()> {
        cancel.check()?;
        let mut response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("requesting '{url}'"))?;
        if !response.status().is_success() {
            bail!("requesting '{}': server returned {}", url, response.status());
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating '{}'", parent.display()))?;
        }
        let mut file = File::create(dest)
            .with_context(|| format!("creating download target '{}'", dest.display()))?;
        response
            .copy_to(&mut file)
            .with_context(|| format!("writing '{}'", dest.display()))?;
        cancel.check()?;
        Ok(())
    }
}
