//! Typed error kinds shared across the build and install pipelines.
//!
//! Most call sites propagate `anyhow::Error` with phase-label contexts; this
//! enum exists so callers and tests can match on the failure class with
//! `err.downcast_ref::<Error>()` instead of scraping message strings.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A YAML document contained unknown or malformed fields.
    #[error("schema error: {0}")]
    Schema(String),

    /// A source URI could not be parsed into a supported scheme.
    #[error("invalid source URI '{0}'")]
    InvalidSource(String),

    /// An OCI digest did not match the `<algorithm>:<hash>` form.
    #[error("invalid digest format '{0}', expected '<algorithm>:<hash>'")]
    InvalidDigest(String),

    /// A free-form disk size string failed validation.
    #[error("invalid disk size definition '{0}'")]
    InvalidDiskSize(String),

    /// A partition CopyFiles entry used a relative source path.
    #[error("requires an absolute path to copy files from, given path is '{0}'")]
    InvalidCopyPath(String),

    /// The network configuration directory contained subdirectories.
    #[error("directories are not supported in '{0}'")]
    DirectoriesNotSupported(PathBuf),

    /// Requested systemd extensions are missing from the release manifest.
    #[error("requested systemd extension(s) not found: {0:?}")]
    UnknownExtension(Vec<String>),

    /// The Butane to Ignition translation rejected the document.
    #[error("failed translating Butane config: {0}")]
    ButaneTranslation(String),

    /// systemd-repart reported a different partition count than configured.
    #[error("partitions mismatch between deployment and systemd-repart JSON output: {0}")]
    PartitionerMismatch(String),

    /// A second transaction was started before commit or rollback.
    #[error("a transaction is already in progress")]
    TransactionAlreadyOpen,

    /// Reset was invoked outside of the recovery system.
    #[error("reset requires booting from the recovery system")]
    NotInRecovery,

    /// ISO installer media requires an explicit installation device.
    #[error("missing device configuration for ISO image type")]
    MissingISODevice,

    /// A source emptiness probe could not reach the filesystem.
    #[error("filesystem unavailable probing '{0}'")]
    FSUnavailable(PathBuf),

    /// A deployment violated a structural invariant.
    #[error("inconsistent deployment: {0}")]
    DeploymentInvariant(String),

    /// An external tool exited with failure; captured output included.
    #[error("{tool} failed: {message}")]
    ExternalTool { tool: String, message: String },

    /// The pipeline was cancelled by signal or explicit request.
    #[error("operation cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_extension_message_lists_names() {
        let err = Error::UnknownExtension(vec!["missing".to_string()]);
        assert_eq!(
            err.to_string(),
            "requested systemd extension(s) not found: [\"missing\"]"
        );
    }

    #[test]
    fn disk_size_message_shape() {
        let err = Error::InvalidDiskSize("35Invalid".to_string());
        assert_eq!(err.to_string(), "invalid disk size definition '35Invalid'");
    }
}
