// Copyright (c) 2025 - Cowboy AI, Inc.
//! Remote execution boundary
//!
//! The engine never talks SSH itself. A [`RemoteExecutor`] runs commands and
//! copies files on cluster nodes; [`RemoteSession`] adds what every caller
//! needs on top of it: cancellation, retry of transport failures through the
//! convergence poller, and staging scripts before running them.
//!
//! A non-zero exit status is data, not an error: membership predicates read it.
//! Only a transport failure is an error, reported as
//! [`ProvisioningError::RecoverableRemote`].

use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{PollPolicy, ProvisioningConfig};
use crate::convergence::{poll_until, CheckError};
use crate::errors::{ProvisioningError, ProvisioningResult};

/// Connection and execution timeouts of one remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTimeouts {
    pub connect: Duration,
    pub exec: Duration,
}

impl RemoteTimeouts {
    pub fn from_config(config: &ProvisioningConfig) -> Self {
        Self {
            connect: config.ssh_connect_timeout(),
            exec: config.ssh_exec_timeout(),
        }
    }
}

/// Result of a remote command
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into a [`ProvisioningError::FatalRemote`]
    pub fn require_success(self, node: &str, what: &str) -> ProvisioningResult<Self> {
        if self.success() {
            return Ok(self);
        }
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        Err(ProvisioningError::fatal(
            node,
            format!("{what} failed with exit code {}: {detail}", self.exit_code),
        ))
    }
}

/// A value rendered as exactly one POSIX shell word
///
/// Displays inside single quotes; an embedded `'` closes the quote, is
/// escaped, and reopens it. Nothing in the value is expanded by the shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellWord(String);

impl ShellWord {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShellWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_char('\'')?;
        for (i, part) in self.0.split('\'').enumerate() {
            if i > 0 {
                f.write_str("'\\''")?;
            }
            f.write_str(part)?;
        }
        f.write_char('\'')
    }
}

/// Runs commands and copies files on cluster nodes
///
/// `node` is the node's hostname; implementations resolve it to an address.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` on `node`
    ///
    /// # Errors
    ///
    /// `RecoverableRemote` when the node could not be reached or the
    /// connection dropped. A command that ran and failed is `Ok` with a
    /// non-zero exit code.
    async fn run(
        &self,
        node: &str,
        command: &str,
        timeouts: RemoteTimeouts,
    ) -> ProvisioningResult<CommandOutput>;

    /// Copy a local file to `destination` on `node`
    async fn copy(
        &self,
        node: &str,
        source: &Path,
        destination: &str,
        timeouts: RemoteTimeouts,
    ) -> ProvisioningResult<CommandOutput>;
}

/// Executor plus the policies of the cluster it serves
#[derive(Clone)]
pub struct RemoteSession {
    executor: Arc<dyn RemoteExecutor>,
    timeouts: RemoteTimeouts,
    retry: PollPolicy,
    staging_dir: PathBuf,
    remote_dir: String,
}

impl RemoteSession {
    pub fn new(executor: Arc<dyn RemoteExecutor>, config: &ProvisioningConfig) -> Self {
        Self {
            executor,
            timeouts: RemoteTimeouts::from_config(config),
            retry: config.remote_retry_poll(),
            staging_dir: config.staging_dir.clone(),
            remote_dir: config.remote_dir.clone(),
        }
    }

    pub fn timeouts(&self) -> RemoteTimeouts {
        self.timeouts
    }

    /// Run once; the token aborts the call
    pub async fn run(
        &self,
        node: &str,
        command: &str,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<CommandOutput> {
        debug!(%node, %command, "remote run");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProvisioningError::cancelled(format!("run on {node}"))),
            output = self.executor.run(node, command, self.timeouts) => output,
        }
    }

    /// Run, retrying transport failures until the retry budget is spent
    pub async fn run_with_retry(
        &self,
        node: &str,
        command: &str,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<CommandOutput> {
        let operation = format!("run on {node}");
        poll_until(&operation, &self.retry, cancel, || async {
            match self.executor.run(node, command, self.timeouts).await {
                Ok(output) => Ok(output),
                Err(err) if err.is_recoverable() => {
                    warn!(%node, error = %err, "remote transport failure, retrying");
                    Err(CheckError::NotReady(err.to_string()))
                }
                Err(err) => Err(CheckError::Fatal(err)),
            }
        })
        .await
    }

    /// Copy, retrying transport failures
    pub async fn copy_with_retry(
        &self,
        node: &str,
        source: &Path,
        destination: &str,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<CommandOutput> {
        let operation = format!("copy to {node}");
        poll_until(&operation, &self.retry, cancel, || async {
            self.executor
                .copy(node, source, destination, self.timeouts)
                .await
                .map_err(CheckError::from)
        })
        .await
    }

    /// Stage `content` locally, copy it to the node and run it
    ///
    /// Returns the output of the script; a failed copy or a non-zero copy
    /// status is an error.
    pub async fn upload_and_run(
        &self,
        node: &str,
        script_name: &str,
        content: &str,
        cancel: &CancellationToken,
    ) -> ProvisioningResult<CommandOutput> {
        let local = self.stage(node, script_name, content).await?;
        let remote = format!("{}/{script_name}", self.remote_dir.trim_end_matches('/'));

        self.copy_with_retry(node, &local, &remote, cancel)
            .await?
            .require_success(node, &format!("upload of {script_name}"))?;

        let command = format!("sudo bash {remote}; rc=$?; rm -f {remote}; exit $rc");
        self.run_with_retry(node, &command, cancel).await
    }

    async fn stage(&self, node: &str, script_name: &str, content: &str) -> ProvisioningResult<PathBuf> {
        let dir = self.staging_dir.join(node);
        let path = dir.join(script_name);
        let io_err = |e: std::io::Error| {
            ProvisioningError::Configuration(format!(
                "cannot stage {} in {}: {e}",
                script_name,
                dir.display()
            ))
        };
        tokio::fs::create_dir_all(&dir).await.map_err(io_err)?;
        tokio::fs::write(&path, content).await.map_err(io_err)?;
        Ok(path)
    }
}
