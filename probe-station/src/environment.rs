//! Execution environments for hardware-server processes.
//!
//! Debug servers, RTT clients and flashing tools run inside an isolated
//! per-probe runtime (in practice a container with the probe's USB device
//! passed through). The core only needs a handful of operations on it, which
//! [`ExecutionEnvironment`] captures so session logic can be tested against
//! an in-memory fake.
//!
//! Every call is potentially slow I/O. [`DockerEnvironment`] bounds each one
//! with a timeout and reports a hang as [`Error::EnvironmentTimeout`].

use async_trait::async_trait;
use std::{process::Stdio, time::Duration};
use tokio::{process::Command, time};

use crate::{
    config::EnvironmentConfig,
    error::{Error, Result},
    tracing::prelude::*,
};

/// How a command is run inside the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Detach and return once the command has been launched
    Background,
    /// Wait for the command to finish, up to the given bound
    Synchronous(Duration),
}

/// Result of running a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Operations the core needs from an execution environment.
///
/// `env` is the environment's name; one implementation serves all of them.
#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    /// Run a shell command.
    async fn run(&self, env: &str, command: &str, mode: RunMode) -> Result<RunOutput>;

    /// PIDs of processes whose full command line matches `pattern`.
    async fn list_matching(&self, env: &str, pattern: &str) -> Result<Vec<u32>>;

    /// Kill processes whose full command line matches `pattern`.
    ///
    /// Finding nothing to kill is not an error.
    async fn kill_matching(&self, env: &str, pattern: &str) -> Result<()>;

    /// Whether the environment itself is up.
    async fn is_running(&self, env: &str) -> Result<bool>;

    /// Established TCP connections to a local port.
    ///
    /// `Ok(None)` means the environment has no way to tell (no `ss` binary,
    /// for example).
    async fn established_connections(&self, env: &str, port: u16) -> Result<Option<usize>>;
}

/// Execution environment backed by docker containers.
#[derive(Debug, Clone)]
pub struct DockerEnvironment {
    docker_bin: String,
    call_timeout: Duration,
}

// pgrep/pkill exit status when nothing matched.
const NO_MATCH: i32 = 1;

impl DockerEnvironment {
    pub fn new(config: &EnvironmentConfig) -> Self {
        Self {
            docker_bin: config.docker_bin.clone(),
            call_timeout: config.call_timeout(),
        }
    }

    async fn docker(&self, args: &[&str], timeout: Duration) -> Result<RunOutput> {
        let call = args.iter().take(3).copied().collect::<Vec<_>>().join(" ");
        trace!(args = ?args, "docker call");

        let child = Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::EnvironmentUnavailable(format!("failed to spawn {}: {}", self.docker_bin, e))
            })?;

        let output = time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::EnvironmentTimeout { call, timeout })?
            .map_err(|e| Error::EnvironmentUnavailable(e.to_string()))?;

        Ok(RunOutput {
            // Killed by a signal: report like a shell would
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl ExecutionEnvironment for DockerEnvironment {
    async fn run(&self, env: &str, command: &str, mode: RunMode) -> Result<RunOutput> {
        match mode {
            RunMode::Background => {
                self.docker(&["exec", "-d", env, "/bin/bash", "-c", command], self.call_timeout)
                    .await
            }
            RunMode::Synchronous(timeout) => {
                self.docker(&["exec", env, "/bin/bash", "-c", command], timeout)
                    .await
            }
        }
    }

    async fn list_matching(&self, env: &str, pattern: &str) -> Result<Vec<u32>> {
        let output = self
            .docker(&["exec", env, "pgrep", "-f", pattern], self.call_timeout)
            .await?;
        match output.exit_code {
            0 => Ok(parse_pids(&output.stdout)),
            NO_MATCH => Ok(Vec::new()),
            code => Err(Error::EnvironmentUnavailable(format!(
                "pgrep in {} exited with {}: {}",
                env,
                code,
                output.stderr.trim()
            ))),
        }
    }

    async fn kill_matching(&self, env: &str, pattern: &str) -> Result<()> {
        let output = self
            .docker(&["exec", env, "pkill", "-f", pattern], self.call_timeout)
            .await?;
        match output.exit_code {
            0 | NO_MATCH => Ok(()),
            code => Err(Error::EnvironmentUnavailable(format!(
                "pkill in {} exited with {}: {}",
                env,
                code,
                output.stderr.trim()
            ))),
        }
    }

    async fn is_running(&self, env: &str) -> Result<bool> {
        let output = self
            .docker(&["inspect", "-f", "{{.State.Running}}", env], self.call_timeout)
            .await?;
        Ok(output.success() && output.stdout.trim() == "true")
    }

    async fn established_connections(&self, env: &str, port: u16) -> Result<Option<usize>> {
        let filter = format!("( sport = :{} )", port);
        let output = self
            .docker(
                &["exec", env, "ss", "-Htn", "state", "established", &filter],
                self.call_timeout,
            )
            .await?;
        match output.exit_code {
            0 => Ok(Some(count_lines(&output.stdout))),
            code => {
                debug!(env, code, stderr = %output.stderr.trim(), "ss unavailable");
                Ok(None)
            }
        }
    }
}

fn parse_pids(stdout: &str) -> Vec<u32> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

fn count_lines(stdout: &str) -> usize {
    stdout.lines().filter(|line| !line.trim().is_empty()).count()
}
