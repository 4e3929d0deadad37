//! External process invocation.
//!
//! Every tool the pipelines call (`truncate`, `losetup`, `systemd-repart`,
//! `snapper`, `btrfs`, `rsync`, `xorriso`, ...) is funneled through the
//! [`Runner`] capability so tests can substitute a deterministic fake and
//! assert on the exact argv sequences.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use crate::error::Error;

/// A fully-described command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl CmdSpec {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    /// The invocation as a single argv vector, program first.
    pub fn argv(&self) -> Vec<String> {
        let mut v = Vec::with_capacity(self.args.len() + 1);
        v.push(self.program.clone());
        v.extend(self.args.iter().cloned());
        v
    }
}

/// Captured output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub success: bool,
}

impl CmdOutput {
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Capability for running external commands.
pub trait Runner: Send + Sync {
    /// Run the command to completion, capturing both output streams.
    /// A non-zero exit status is reported through `CmdOutput::success`,
    /// not as an `Err`; spawn failures are `Err`.
    fn run(&self, spec: &CmdSpec) -> std::io::Result<CmdOutput>;
}

/// Runner backed by the host system.
#[derive(Debug, Default)]
pub struct HostRunner;

impl Runner for HostRunner {
    fn run(&self, spec: &CmdSpec) -> std::io::Result<CmdOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        let out = cmd.output()?;
        Ok(CmdOutput {
            stdout: out.stdout,
            stderr: out.stderr,
            success: out.status.success(),
        })
    }
}

/// Builder for a single command invocation.
///
/// # Example
///
/// ```rust,ignore
/// let out = Cmd::new(&runner, "losetup")
///     .args(["-f", "--show"])
///     .arg_path(&image)
///     .error_msg("attaching loop device")
///     .run()?;
/// ```
pub struct Cmd<'a> {
    runner: &'a dyn Runner,
    spec: CmdSpec,
    error_msg: Option<String>,
}

impl<'a> Cmd<'a> {
    pub fn new(runner: &'a dyn Runner, program: &str) -> Self {
        Self {
            runner,
            spec: CmdSpec::new(program),
            error_msg: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.spec.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.spec.args.push(path.display().to_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.spec.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.spec.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Run the command, failing on non-zero exit with captured output
    /// embedded in the error for postmortem. Returns stdout on success.
    pub fn run(self) -> Result<Vec<u8>> {
        let label = self
            .error_msg
            .clone()
            .unwrap_or_else(|| format!("running '{}'", self.spec.program));
        let out = self
            .runner
            .run(&self.spec)
            .with_context(|| label.clone())?;

        tracing::debug!(
            program = %self.spec.program,
            args = ?self.spec.args,
            "tool output:\n------- stdout -------\n{}------- stderr -------\n{}----------------------",
            out.stdout_string(),
            out.stderr_string(),
        );

        if !out.success {
            let tool_err = Error::ExternalTool {
                tool: self.spec.program.clone(),
                message: format!(
                    "{}: {}",
                    out.stdout_string().trim(),
                    out.stderr_string().trim()
                ),
            };
            return Err(anyhow::Error::new(tool_err).context(label));
        }
        Ok(out.stdout)
    }

    /// Run the command ignoring the result. Used for best-effort calls like
    /// `partx -u` and `udevadm settle` where the tool state does not gate the
    /// pipeline.
    pub fn run_best_effort(self) {
        let _ = self.runner.run(&self.spec);
    }
}

/// Check whether a command exists on the host.
///
/// Uses `which` to locate the command in PATH.
pub fn command_exists(runner: &dyn Runner, cmd: &str) -> bool {
    let spec = {
        let mut s = CmdSpec::new("which");
        s.args.push(cmd.to_string());
        s
    };
    runner.run(&spec).map(|o| o.success).unwrap_or(false)
}

/// Shared handle passed through the pipelines.
pub type SharedRunner = Arc<dyn Runner>;
