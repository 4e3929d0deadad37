//! Build infrastructure for an immutable, transactionally-updated Linux
//! distribution.
//!
//! This crate builds bootable RAW disk images and customizes installer
//! media from a directory of declarative configuration. The pipeline
//! resolves a release manifest, composes a deployment description (disks,
//! partitions, read-write volumes, sources, boot and security policy), and
//! applies it atomically to a block device or image file through a
//! transactional snapshot layer.
//!
//! # Architecture
//!
//! ```text
//! build / customize (pipeline)
//!     │
//!     ├── config      - declarative inputs, overlays, first-boot artifacts
//!     ├── manifest    - release-manifest resolution via OCI artifacts
//!     ├── deployment  - typed disk/partition model, merge, sanitize
//!     ├── repart      - declarative partitioning (systemd-repart)
//!     ├── transaction - snapshotted (snapper) or overwrite engines
//!     └── install     - partition, snapshot, unpack, hook, commit
//! ```
//!
//! External tools (`systemd-repart`, `snapper`, `btrfs`, `rsync`,
//! `xorriso`, `losetup`, `skopeo`, ...) are driven through the [`process`]
//! runner capability so every pipeline can be exercised against a fake.

pub mod btrfs;
pub mod build;
pub mod cancel;
pub mod chroot;
pub mod cleanstack;
pub mod config;
pub mod customize;
pub mod deployment;
pub mod error;
pub mod helm;
pub mod http;
pub mod install;
pub mod manifest;
pub mod media;
pub mod process;
pub mod repart;
pub mod selinux;
pub mod snapper;
pub mod transaction;
pub mod unpack;

pub use cancel::CancelToken;
pub use deployment::Deployment;
pub use error::Error;
