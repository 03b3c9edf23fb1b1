use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use gpuwatch_common::FleetError;

/// ssh reserves this exit status for its own failures (connect, auth, ...).
const SSH_FAILURE_STATUS: i32 = 255;

const AUTH_MARKERS: &[&str] = &[
    "Permission denied",
    "Host key verification failed",
    "Too many authentication failures",
    "no matching host key type",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Failure to get a command to run at all, as opposed to a command that ran
/// and exited non-zero.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("authentication failed: {0}")]
    AuthFailure(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl From<TransportError> for FleetError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unreachable(m) => FleetError::Unreachable(m),
            TransportError::AuthFailure(m) => FleetError::AuthFailure(m),
            TransportError::Timeout(d) => FleetError::Timeout(d),
        }
    }
}

/// Run a shell command on a remote host.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn execute(
        &self,
        address: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError>;
}

/// `RemoteExec` backed by the system `ssh` client in batch mode. Credentials
/// come from the invoking user's ssh configuration.
#[derive(Debug, Clone)]
pub struct SshExec {
    program: String,
    extra_options: Vec<String>,
}

impl Default for SshExec {
    fn default() -> Self {
        Self::new()
    }
}

impl SshExec {
    pub fn new() -> Self {
        Self {
            program: "ssh".to_string(),
            extra_options: Vec::new(),
        }
    }

    /// Extra `-o` options, e.g. `StrictHostKeyChecking=accept-new`.
    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.extra_options = options;
        self
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn build_command(&self, address: &str, command: &str, timeout: Duration) -> Command {
        let connect_timeout = timeout.as_secs().max(1);
        let mut cmd = Command::new(&self.program);
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={connect_timeout}"));
        for opt in &self.extra_options {
            cmd.arg("-o").arg(opt);
        }
        cmd.arg(address)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteExec for SshExec {
    async fn execute(
        &self,
        address: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        let child = self
            .build_command(address, command, timeout)
            .spawn()
            .map_err(|e| TransportError::Unreachable(format!("failed to spawn {}: {e}", self.program)))?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(TransportError::Unreachable(e.to_string())),
            Err(_) => return Err(TransportError::Timeout(timeout)),
        };

        let out = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            // Killed by a signal: no code, report as a command failure.
            exit_code: output.status.code().unwrap_or(-1),
        };
        classify_ssh_output(out)
    }
}

fn classify_ssh_output(out: CommandOutput) -> Result<CommandOutput, TransportError> {
    if out.exit_code != SSH_FAILURE_STATUS {
        return Ok(out);
    }
    if AUTH_MARKERS.iter().any(|m| out.stderr.contains(m)) {
        Err(TransportError::AuthFailure(out.stderr))
    } else {
        Err(TransportError::Unreachable(out.stderr))
    }
}
