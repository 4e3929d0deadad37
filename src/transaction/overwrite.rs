//! Overwrite transaction engine.
//!
//! Debug path that ignores snapshot semantics entirely: the OS source is
//! unpacked straight onto the freshly formatted system partition and there
//! is nothing to roll back. Exists to isolate bugs in the snapshotting
//! layer; never meant for production installs.

use anyhow::{Context, Result};
use std::path::PathBuf;

use super::{BootUpdater, State, Transaction, TransactionEngine, UpdateHook};
use crate::cancel::CancelToken;
use crate::deployment::{Deployment, Source};
use crate::error::Error;
use crate::unpack::Unpacker;

pub struct OverwriteTransaction {
    unpacker: Unpacker,
    boot: Box<dyn BootUpdater>,
    cancel: CancelToken,
    /// Mount point of the system partition.
    root: PathBuf,
    state: State,
}

impl OverwriteTransaction {
    pub fn new(
        unpacker: Unpacker,
        boot: Box<dyn BootUpdater>,
        cancel: CancelToken,
        root: PathBuf,
    ) -> Self {
        Self {
            unpacker,
            boot,
            cancel,
            root,
            state: State::None,
        }
    }
}

impl TransactionEngine for OverwriteTransaction {
    fn init(&mut self, _d: &Deployment) -> Result<()> {
        tracing::warn!(
            "the overwrite snapshotter is a debugging tool and should not be used \
             for production installations"
        );
        self.state = State::Initialized;
        Ok(())
    }

    fn start(&mut self) -> Result<Transaction> {
        if matches!(self.state, State::Started | State::Updating) {
            return Err(Error::TransactionAlreadyOpen.into());
        }
        self.cancel.check()?;
        self.state = State::Started;
        Ok(Transaction {
            id: 0,
            path: self.root.clone(),
        })
    }

    fn update(&mut self, trans: &Transaction, source: &Source, hook: UpdateHook) -> Result<()> {
        self.cancel.check()?;
        self.state = State::Updating;
        self.unpacker
            .unpack(source, &trans.path)
            .context("unpacking the OS source onto the system partition")?;
        hook(&trans.path).context("running the update hook")?;
        Ok(())
    }

    fn commit(&mut self, trans: Transaction) -> Result<()> {
        self.cancel.check()?;
        self.boot
            .update(&trans.path)
            .context("updating the bootloader")?;
        self.state = State::Committed;
        Ok(())
    }

    fn rollback(&mut self, _trans: Transaction) -> Result<()> {
        tracing::warn!("the overwrite snapshotter cannot roll back a partial installation");
        self.state = State::RolledBack;
        Ok(())
    }
}
