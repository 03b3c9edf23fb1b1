use std::sync::Arc;
use std::time::{Duration, Instant};

use gpuwatch_common::{FleetError, HostSnapshot, HostSpec, PidOutcome, ProbeFailure};

use crate::exec::{CommandOutput, RemoteExec};
use crate::parse::{parse_probe_output, PROBE_COMMAND};

/// Runs status and kill commands against single hosts and turns whatever
/// comes back into typed results. Never returns an error: failures are
/// folded into the snapshot or the per-pid outcome.
#[derive(Clone)]
pub struct Prober {
    exec: Arc<dyn RemoteExec>,
}

impl std::fmt::Debug for Prober {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prober").finish_non_exhaustive()
    }
}

impl Prober {
    pub fn new(exec: Arc<dyn RemoteExec>) -> Self {
        Self { exec }
    }

    pub async fn probe(&self, host: &HostSpec, deadline: Duration) -> HostSnapshot {
        let started = Instant::now();
        let result = self.run(host, PROBE_COMMAND, deadline).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                let failure = ProbeFailure::from(&e);
                tracing::warn!(host=%host.id, kind=%failure.kind, error=%e, "probe failed");
                return HostSnapshot::offline(&host.id, failure, latency_ms);
            }
        };

        match parse_probe_output(&output.stdout) {
            Ok(parsed) => {
                if parsed.skipped_lines > 0 {
                    tracing::warn!(host=%host.id, skipped=parsed.skipped_lines, "probe output had malformed lines");
                }
                tracing::debug!(host=%host.id, gpus=parsed.devices.len(), latency_ms, "probe ok");
                HostSnapshot::online(&host.id, parsed.devices, latency_ms, parsed.skipped_lines)
            }
            Err(msg) => {
                tracing::warn!(host=%host.id, error=%msg, "unparseable probe output");
                HostSnapshot::offline(
                    &host.id,
                    ProbeFailure::from(&FleetError::ParseError(msg)),
                    latency_ms,
                )
            }
        }
    }

    /// Terminate `pids` on `host` with one remote command. Every pid gets an
    /// outcome; a host-level failure fails all of them.
    pub async fn kill_processes(
        &self,
        host: &HostSpec,
        pids: &[u32],
        deadline: Duration,
    ) -> Vec<PidOutcome> {
        if pids.is_empty() {
            return Vec::new();
        }
        let command = kill_command(pids);
        match self.run(host, &command, deadline).await {
            Ok(output) => {
                let outcomes = parse_kill_output(&output.stdout, pids);
                let killed = outcomes.iter().filter(|o| o.killed).count();
                tracing::info!(host=%host.id, requested=pids.len(), killed, "kill batch finished");
                outcomes
            }
            Err(e) => {
                tracing::warn!(host=%host.id, error=%e, "kill batch failed");
                let reason = e.to_string();
                pids.iter()
                    .map(|pid| PidOutcome::failed(*pid, reason.clone()))
                    .collect()
            }
        }
    }

    async fn run(
        &self,
        host: &HostSpec,
        command: &str,
        deadline: Duration,
    ) -> Result<CommandOutput, FleetError> {
        // The transport gets the same deadline; this outer bound covers
        // implementations that ignore it.
        let call = self.exec.execute(&host.address, command, deadline);
        let output = tokio::time::timeout(deadline, call)
            .await
            .map_err(|_| FleetError::Timeout(deadline))??;
        if !output.success() {
            let stderr = if output.stderr.is_empty() {
                output.stdout.trim().to_string()
            } else {
                output.stderr.clone()
            };
            return Err(FleetError::CommandError {
                exit_code: output.exit_code,
                stderr,
            });
        }
        Ok(output)
    }
}

pub(crate) fn kill_command(pids: &[u32]) -> String {
    let list = pids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "for p in {list}; do if kill -9 \"$p\" 2>/dev/null; then echo \"$p ok\"; else echo \"$p fail\"; fi; done"
    )
}

fn parse_kill_output(stdout: &str, pids: &[u32]) -> Vec<PidOutcome> {
    pids.iter()
        .map(|pid| {
            let status = stdout.lines().find_map(|line| {
                let (p, status) = line.trim().split_once(' ')?;
                (p.parse::<u32>().ok()? == *pid).then_some(status.trim())
            });
            match status {
                Some("ok") => PidOutcome::killed(*pid),
                Some(_) => PidOutcome::failed(*pid, "no such process or not permitted"),
                None => PidOutcome::failed(*pid, "no result reported"),
            }
        })
        .collect()
}
