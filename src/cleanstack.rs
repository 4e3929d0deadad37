//! LIFO clean-up stack for the install path.
//!
//! Deferred releases (unmount, remove tmp dir, rollback) accumulate during
//! the pipeline and run in reverse order at exit. Each action carries a mode
//! deciding whether it runs on success, on error, or always. Errors raised
//! while unwinding are joined onto the primary error, never swallowed and
//! never preferred over it.

use anyhow::{anyhow, Result};

type Action = Box<dyn FnOnce() -> Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Always,
    OnSuccess,
    OnError,
}

struct Entry {
    action: Action,
    mode: Mode,
}

#[derive(Default)]
pub struct CleanStack {
    entries: Vec<Entry>,
}

impl CleanStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defer an action that runs regardless of the pipeline outcome.
    pub fn push<F>(&mut self, action: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.entries.push(Entry {
            action: Box::new(action),
            mode: Mode::Always,
        });
    }

    /// Defer an action that runs only when the pipeline succeeded.
    pub fn push_success_only<F>(&mut self, action: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.entries.push(Entry {
            action: Box::new(action),
            mode: Mode::OnSuccess,
        });
    }

    /// Defer an action that runs only when the pipeline failed.
    pub fn push_error_only<F>(&mut self, action: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.entries.push(Entry {
            action: Box::new(action),
            mode: Mode::OnError,
        });
    }

    /// Unwind the stack. `outcome` is the pipeline result so far; the
    /// returned result carries the primary error first with any clean-up
    /// errors appended to its chain.
    pub fn cleanup(mut self, outcome: Result<()>) -> Result<()> {
        let failed = outcome.is_err();
        let mut cleanup_errors: Vec<anyhow::Error> = Vec::new();

        while let Some(entry) = self.entries.pop() {
            let run = match entry.mode {
                Mode::Always => true,
                Mode::OnSuccess => !failed,
                Mode::OnError => failed,
            };
            if !run {
                continue;
            }
            if let Err(err) = (entry.action)() {
                cleanup_errors.push(err);
            }
        }

        if cleanup_errors.is_empty() {
            return outcome;
        }

        let joined = cleanup_errors
            .iter()
            .map(|e| format!("{e:#}"))
            .collect::<Vec<_>>()
            .join("; ");

        match outcome {
            Ok(()) => Err(anyhow!("cleanup failed: {joined}")),
            Err(primary) => Err(primary.context(format!("cleanup also failed: {joined}"))),
        }
    }
}
