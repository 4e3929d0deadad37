//! Transactional snapshot layer.
//!
//! A transaction takes a read-write snapshot of the system volume, applies
//! the OS source plus an update hook inside it, and either commits the
//! snapshot as the new default or rolls it back. One transaction may be in
//! flight per deployment; starting a second before commit or rollback is
//! refused.

pub mod overwrite;
pub mod snapper;

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::deployment::{Bootloader, Deployment, Source};
use crate::process::{Cmd, SharedRunner};

pub use overwrite::OverwriteTransaction;
pub use snapper::SnapperTransaction;

/// A started transaction: the snapshot id and its mounted read-write path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: u64,
    pub path: PathBuf,
}

/// Hook executed inside `update` with the snapshot root, after the OS
/// source was unpacked.
pub type UpdateHook<'a> = &'a dyn Fn(&Path) -> Result<()>;

/// Lifecycle of one transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum State {
    #[default]
    None,
    Initialized,
    Started,
    Updating,
    Committed,
    RolledBack,
}

pub trait TransactionEngine {
    /// Prepare the snapshotter for the given deployment.
    fn init(&mut self, d: &Deployment) -> Result<()>;

    /// Open a new read-write snapshot.
    fn start(&mut self) -> Result<Transaction>;

    /// Unpack the OS source into the snapshot and run the hook.
    fn update(&mut self, trans: &Transaction, source: &Source, hook: UpdateHook) -> Result<()>;

    /// Make the snapshot the new default and enforce the snapshot cap.
    fn commit(&mut self, trans: Transaction) -> Result<()>;

    /// Discard the snapshot and restore the previous default.
    fn rollback(&mut self, trans: Transaction) -> Result<()>;
}

/// Bootloader refresh triggered on commit. The actual EFI and loader
/// manipulation is owned by the host tools; this only dispatches on the
/// configured bootloader.
pub trait BootUpdater: Send + Sync {
    fn update(&self, root: &Path) -> Result<()>;
}

pub struct ToolBootUpdater {
    runner: SharedRunner,
    bootloader: Bootloader,
}

impl ToolBootUpdater {
    pub fn new(runner: SharedRunner, bootloader: Bootloader) -> Self {
        Self { runner, bootloader }
    }
}

impl BootUpdater for ToolBootUpdater {
    fn update(&self, root: &Path) -> Result<()> {
        match self.bootloader {
            Bootloader::Grub => {
                Cmd::new(self.runner.as_ref(), "chroot")
                    .arg_path(root)
                    .args(["grub2-mkconfig", "-o", "/boot/grub2/grub.cfg"])
                    .error_msg("updating the grub configuration")
                    .run()?;
            }
            Bootloader::SystemdBoot => {
                Cmd::new(self.runner.as_ref(), "chroot")
                    .arg_path(root)
                    .args(["sdbootutil", "update"])
                    .error_msg("updating systemd-boot entries")
                    .run()?;
            }
            Bootloader::None => {
                tracing::debug!("no bootloader configured, skipping update");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Boot updater counting invocations.
    #[derive(Default)]
    pub struct CountingBootUpdater(pub AtomicUsize);

    impl BootUpdater for CountingBootUpdater {
        fn update(&self, _root: &Path) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
