//! Process invocation as an injectable capability.
//!
//! Daemon control and machine registration both shell out to host tools.
//! Routing those calls through [`CommandExecutor`] lets tests substitute
//! canned output and exit codes without touching the process table.
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Captured result of a finished process.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Output {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl Output {
    /// Whether the process exited with status zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout and stderr joined, for error messages.
    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{}\n{}", out, err),
        }
    }
}

/// Runs a program to completion and captures its output.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs `program` with `args`.
    ///
    /// A non-zero exit is not an error at this level; only failing to spawn
    /// the process or cancellation are.
    async fn run(
        &self,
        cancel: &CancellationToken,
        program: &Path,
        args: &[OsString],
    ) -> Result<Output>;
}

/// Executes commands on the host with `tokio::process`.
#[derive(Clone, Debug, Default)]
pub struct HostExecutor;

#[async_trait]
impl CommandExecutor for HostExecutor {
    async fn run(
        &self,
        cancel: &CancellationToken,
        program: &Path,
        args: &[OsString],
    ) -> Result<Output> {
        debug!(?program, ?args, "Running command");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::io("spawning command", program, e))?;

        // Dropping the output future on cancellation kills the child.
        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|e| Error::io("waiting for command", program, e))?
            }
            _ = cancel.cancelled() => {
                return Err(Error::Canceled {
                    operation: format!("running {}", program.display()),
                });
            }
        };

        Ok(Output {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Builds an argument list from anything string-like.
pub fn args<I, S>(items: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    items.into_iter().map(Into::into).collect()
}
