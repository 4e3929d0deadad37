//! snapper-backed transaction engine.
//!
//! The normal path: every install or upgrade happens inside a read-write
//! snapshot taken from the current default, which becomes the new read-only
//! default on commit. The total snapshot count is capped right after commit.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::{BootUpdater, State, Transaction, TransactionEngine, UpdateHook};
use crate::btrfs;
use crate::cancel::CancelToken;
use crate::deployment::{Deployment, Source};
use crate::error::Error;
use crate::snapper::{self, Snapper, Userdata, DEFAULT_MAX_SNAPSHOTS};
use crate::unpack::Unpacker;

pub struct SnapperTransaction {
    snapper: Snapper,
    unpacker: Unpacker,
    boot: Box<dyn BootUpdater>,
    cancel: CancelToken,
    /// Mount point of the system btrfs volume.
    root: PathBuf,
    max_snapshots: usize,
    state: State,
    /// Snapshot that is the default before the in-flight transaction
    /// commits; restored on rollback.
    default_id: u64,
}

impl SnapperTransaction {
    pub fn new(
        snapper: Snapper,
        unpacker: Unpacker,
        boot: Box<dyn BootUpdater>,
        cancel: CancelToken,
        root: PathBuf,
    ) -> Self {
        Self {
            snapper,
            unpacker,
            boot,
            cancel,
            root,
            max_snapshots: DEFAULT_MAX_SNAPSHOTS,
            state: State::None,
            default_id: 0,
        }
    }

    pub fn with_max_snapshots(mut self, max: usize) -> Self {
        self.max_snapshots = max;
        self
    }

    fn update_userdata(&self) -> Userdata {
        let mut userdata = Userdata::new();
        userdata.insert("update-in-progress".to_string(), "yes".to_string());
        userdata
    }
}

impl TransactionEngine for SnapperTransaction {
    fn init(&mut self, d: &Deployment) -> Result<()> {
        self.cancel.check()?;
        self.default_id = self
            .snapper
            .first_root_snapshot(&self.root, &Userdata::new())
            .context("initializing the first root snapshot")?;
        self.snapper
            .init_root_volumes(&self.root)
            .context("initializing snapper root volumes")?;

        // Snapshotted RW volumes get their own snapper configuration.
        if let Some(sys) = d.system_partition() {
            for volume in sys.rw_volumes.iter().filter(|v| v.snapshotted) {
                self.snapper
                    .create_config(&self.root, &volume.path.display().to_string())
                    .with_context(|| {
                        format!("creating snapper config for '{}'", volume.path.display())
                    })?;
            }
        }

        self.state = State::Initialized;
        Ok(())
    }

    fn start(&mut self) -> Result<Transaction> {
        if matches!(self.state, State::Started | State::Updating) {
            return Err(Error::TransactionAlreadyOpen.into());
        }
        self.cancel.check()?;

        let id = self
            .snapper
            .create_snapshot(
                &self.root,
                "",
                self.default_id,
                true,
                "update transaction",
                &self.update_userdata(),
            )
            .context("starting a new transaction snapshot")?;

        self.state = State::Started;
        Ok(Transaction {
            id,
            path: snapper::snapshot_path(&self.root, id),
        })
    }

    fn update(&mut self, trans: &Transaction, source: &Source, hook: UpdateHook) -> Result<()> {
        self.cancel.check()?;
        self.state = State::Updating;

        self.unpacker
            .unpack(source, &trans.path)
            .context("unpacking the OS source into the snapshot")?;
        self.cancel.check()?;

        hook(&trans.path).context("running the update hook")?;

        // The unpacked OS may not ship snapper; only configure when the
        // template exists.
        if trans
            .path
            .join("usr/share/snapper/config-templates/default")
            .is_file()
        {
            self.snapper
                .configure_root(&trans.path, self.max_snapshots)
                .context("configuring snapper on the new root")?;
        }
        self.cancel.check()?;
        Ok(())
    }

    fn commit(&mut self, trans: Transaction) -> Result<()> {
        // Cancellation during commit is a hard failure; check only before.
        self.cancel.check()?;

        self.snapper
            .set_default(&self.root, trans.id, &Userdata::new())
            .context("setting the new default snapshot")?;
        self.snapper
            .set_permissions(&self.root, trans.id, false)
            .context("sealing the committed snapshot")?;
        self.boot
            .update(&trans.path)
            .context("updating the bootloader")?;

        // Cap enforcement happens after the default flips, before returning.
        self.snapper
            .cleanup(&self.root, self.max_snapshots)
            .context("enforcing the snapshot cap")?;

        self.default_id = trans.id;
        self.state = State::Committed;
        Ok(())
    }

    fn rollback(&mut self, trans: Transaction) -> Result<()> {
        tracing::warn!("rolling back transaction snapshot {}", trans.id);
        btrfs::delete_subvolume(self.unpacker_runner(), &trans.path)
            .with_context(|| format!("deleting snapshot {}", trans.id))?;
        self.snapper
            .set_default(&self.root, self.default_id, &Userdata::new())
            .context("restoring the previous default snapshot")?;
        self.state = State::RolledBack;
        Ok(())
    }
}

impl SnapperTransaction {
    fn unpacker_runner(&self) -> &crate::process::SharedRunner {
        self.unpacker.runner()
    }
}
