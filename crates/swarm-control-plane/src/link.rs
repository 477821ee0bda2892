// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote command execution over SSH.
//!
//! Everything the control plane does on a drone host (health probes,
//! service restarts, reboots, payload transfers, log tails) goes through
//! the [`LinkRunner`] trait. The real implementation shells out to the
//! system `ssh` binary; tests substitute [`mock::MockRunner`] with
//! scripted responses.
//!
//! Runners are PURE transports - they do NOT access the database.
//! Resolving a drone's SSH settings is the caller's job.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

pub mod mock;

/// Errors from remote command execution.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LinkError {
    /// The command did not finish inside its time budget.
    #[error("Remote command timed out after {0:?}")]
    Timeout(Duration),

    /// The target has no usable address.
    #[error("No address for {0}")]
    NoAddress(String),

    /// Spawning or wiring up the process failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type for link operations.
pub type Result<T> = std::result::Result<T, LinkError>;

/// Connection parameters for one drone host.
#[derive(Debug, Clone)]
pub struct LinkTarget {
    /// Drone name (for logs and mock scripting).
    pub name: String,
    /// Host address.
    pub host: String,
    /// Login user.
    pub user: String,
    /// SSH port.
    pub port: u16,
    /// Identity file, if configured.
    pub key_path: Option<String>,
    /// Connect timeout passed to ssh.
    pub connect_timeout: Duration,
}

impl LinkTarget {
    /// Target with default user/port and the given connect timeout.
    pub fn new(name: impl Into<String>, host: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            user: "root".to_string(),
            port: 22,
            key_path: None,
            connect_timeout,
        }
    }
}

/// Output of a completed remote command.
#[derive(Debug, Clone)]
pub struct LinkOutput {
    /// Process exit code (-1 when terminated by signal).
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl LinkOutput {
    /// Whether the remote command exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Transport for remote commands.
#[async_trait]
pub trait LinkRunner: Send + Sync {
    /// Run `command` on the target, waiting at most `timeout` for it to
    /// complete.
    async fn run(
        &self,
        target: &LinkTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<LinkOutput>;

    /// Run `command` with `stdin` bytes piped to it (payload transfers).
    async fn run_with_stdin(
        &self,
        target: &LinkTarget,
        command: &str,
        stdin: &[u8],
        timeout: Duration,
    ) -> Result<LinkOutput>;
}

/// [`LinkRunner`] backed by the system `ssh` binary.
#[derive(Debug, Default, Clone)]
pub struct SshRunner;

impl SshRunner {
    /// Create a new runner.
    pub fn new() -> Self {
        Self
    }

    fn build_command(&self, target: &LinkTarget, remote_command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                target.connect_timeout.as_secs().max(1)
            ))
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("LogLevel=ERROR");
        if target.port != 22 {
            cmd.arg("-p").arg(target.port.to_string());
        }
        if let Some(key) = &target.key_path {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(format!("{}@{}", target.user, target.host));
        cmd.arg(remote_command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl LinkRunner for SshRunner {
    async fn run(
        &self,
        target: &LinkTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<LinkOutput> {
        if target.host.is_empty() {
            return Err(LinkError::NoAddress(target.name.clone()));
        }
        debug!(drone = %target.name, host = %target.host, "Running remote command");

        let mut cmd = self.build_command(target, command);
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| LinkError::Timeout(timeout))??;

        Ok(LinkOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run_with_stdin(
        &self,
        target: &LinkTarget,
        command: &str,
        stdin: &[u8],
        timeout: Duration,
    ) -> Result<LinkOutput> {
        if target.host.is_empty() {
            return Err(LinkError::NoAddress(target.name.clone()));
        }

        let mut cmd = self.build_command(target, command);
        cmd.stdin(Stdio::piped());

        let run = async {
            let mut child = cmd.spawn()?;
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(stdin).await?;
                pipe.shutdown().await?;
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| LinkError::Timeout(timeout))??;

        Ok(LinkOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
