//! Image source URIs.
//!
//! A [`Source`] names where content comes from: an OCI reference, a local
//! directory, a plain file, a raw disk image, or nothing at all. The string
//! form is `scheme://location` and round-trips through serde.

use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::Error;

pub const OCI_SCHEME: &str = "oci";
pub const DIR_SCHEME: &str = "dir";
pub const FILE_SCHEME: &str = "file";
pub const RAW_SCHEME: &str = "raw";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Source {
    /// OCI image reference (tag or digest).
    Oci(String),
    /// Local directory tree; the path must be absolute.
    Dir(PathBuf),
    /// Single local file.
    File(PathBuf),
    /// Raw filesystem image applied block-wise.
    Raw(PathBuf),
    #[default]
    Empty,
}

impl Source {
    pub fn oci(reference: &str) -> Self {
        Source::Oci(reference.to_string())
    }

    pub fn dir(path: impl Into<PathBuf>) -> Self {
        Source::Dir(path.into())
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Source::File(path.into())
    }

    pub fn raw(path: impl Into<PathBuf>) -> Self {
        Source::Raw(path.into())
    }

    /// Parse a `scheme://location` URI.
    pub fn from_uri(uri: &str) -> Result<Self> {
        if uri.is_empty() {
            return Ok(Source::Empty);
        }
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| Error::InvalidSource(uri.to_string()))?;
        match scheme {
            OCI_SCHEME => {
                if rest.is_empty() {
                    return Err(Error::InvalidSource(uri.to_string()).into());
                }
                Ok(Source::Oci(rest.to_string()))
            }
            DIR_SCHEME => {
                let path = Path::new(rest);
                if !path.is_absolute() {
                    return Err(Error::InvalidSource(uri.to_string()).into());
                }
                Ok(Source::Dir(path.to_path_buf()))
            }
            FILE_SCHEME => Ok(Source::File(PathBuf::from(rest))),
            RAW_SCHEME => Ok(Source::Raw(PathBuf::from(rest))),
            _ => Err(Error::InvalidSource(uri.to_string()).into()),
        }
    }

    /// True for the `Empty` variant, without touching the filesystem.
    pub fn is_unset(&self) -> bool {
        matches!(self, Source::Empty)
    }

    /// Probe whether the source carries any content. `Empty` always does
    /// not; a directory is empty when missing or without entries; a file
    /// source is empty when the file is missing. Probe failures other than
    /// absence surface as [`Error::FSUnavailable`].
    pub fn is_empty(&self) -> Result<bool> {
        match self {
            Source::Empty => Ok(true),
            Source::Oci(reference) => Ok(reference.is_empty()),
            Source::Dir(path) => match fs::read_dir(path) {
                Ok(mut entries) => Ok(entries.next().is_none()),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(true),
                Err(_) => Err(Error::FSUnavailable(path.clone()).into()),
            },
            Source::File(path) | Source::Raw(path) => match fs::metadata(path) {
                Ok(_) => Ok(false),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(true),
                Err(_) => Err(Error::FSUnavailable(path.clone()).into()),
            },
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Oci(reference) => write!(f, "{OCI_SCHEME}://{reference}"),
            Source::Dir(path) => write!(f, "{DIR_SCHEME}://{}", path.display()),
            Source::File(path) => write!(f, "{FILE_SCHEME}://{}", path.display()),
            Source::Raw(path) => write!(f, "{RAW_SCHEME}://{}", path.display()),
            Source::Empty => Ok(()),
        }
    }
}

impl Serialize for Source {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Source {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Source::from_uri(&s).map_err(serde::de::Error::custom)
    }
}
