//! Network configuration overlay.
//!
//! The `network/` directory of the configuration holds either exactly one
//! `configure-network.sh` custom script or a flat set of nmstate files.
//! Whatever is present lands under `catalyst/network/` inside the first-boot
//! configuration partition.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

use super::{ConfigDir, Network, OutputDir, NETWORK_CUSTOM_SCRIPT};
use crate::error::Error;

/// Classify the contents of the configuration's network directory.
pub fn parse_network_dir(config_dir: &ConfigDir) -> Result<Network> {
    let dir = config_dir.network_dir();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries.collect::<std::io::Result<Vec<_>>>().with_context(|| {
            format!("reading network directory '{}'", dir.display())
        })?,
        // Not configured.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Network::default())
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("reading network directory '{}'", dir.display()))
        }
    };

    match entries.as_slice() {
        [] => bail!("network directory '{}' is empty", dir.display()),
        [single] if single.file_name() == NETWORK_CUSTOM_SCRIPT => Ok(Network {
            custom_script: Some(single.path()),
            config_dir: None,
        }),
        _ => Ok(Network {
            custom_script: None,
            config_dir: Some(dir),
        }),
    }
}

/// Copy the network configuration into the first-boot overlay. A no-op when
/// nothing was configured.
pub fn configure_network(network: &Network, output: &OutputDir) -> Result<()> {
    if network.custom_script.is_none() && network.config_dir.is_none() {
        tracing::info!("Network configuration not provided, skipping.");
        return Ok(());
    }

    let net_dir = output.catalyst_config_dir().join("network");
    fs::create_dir_all(&net_dir)
        .with_context(|| format!("creating network directory '{}'", net_dir.display()))?;

    if let Some(script) = &network.custom_script {
        let name = script
            .file_name()
            .with_context(|| format!("script '{}' has no file name", script.display()))?;
        fs::copy(script, net_dir.join(name))
            .with_context(|| format!("copying custom network script '{}'", script.display()))?;
        return Ok(());
    }

    if let Some(config_dir) = &network.config_dir {
        copy_flat_dir(config_dir, &net_dir)
            .context("copying network config")?;
    }
    Ok(())
}

/// Copy the files of `from` into `to`. Subdirectories are rejected; the
/// network configuration is flat by contract.
fn copy_flat_dir(from: &Path, to: &Path) -> Result<()> {
    let entries = fs::read_dir(from)
        .with_context(|| format!("reading '{}'", from.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("reading '{}'", from.display()))?;
        let path = entry.path();
        if path.is_dir() {
            return Err(Error::DirectoriesNotSupported(path).into());
        }
        let name = entry.file_name();
        fs::copy(&path, to.join(&name))
            .with_context(|| format!("copying '{}'", path.display()))?;
    }
    Ok(())
}
