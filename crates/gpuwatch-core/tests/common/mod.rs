#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use gpuwatch_common::HostSpec;
use gpuwatch_core::parse::PROBE_COMMAND;
use gpuwatch_core::{CommandOutput, FleetConfig, RemoteExec, Settings, TransportError};

/// What a fake host does when a command reaches it.
#[derive(Debug, Clone)]
pub enum Behavior {
    Output(String),
    Fail(TransportError),
    Exit(i32),
    /// Answers with the given probe output after a pause.
    Delayed(Duration, String),
    /// Never answers; the caller's timeout has to fire.
    Hang,
}

/// In-memory `RemoteExec`: per-address scripted answers plus call
/// accounting. Kill commands succeed for every pid unless the host fails,
/// and killed pids drop out of the host's later probe output.
#[derive(Debug, Default)]
pub struct FakeExec {
    behaviors: Mutex<HashMap<String, Behavior>>,
    delay: Mutex<Option<Duration>>,
    probes: Mutex<HashMap<String, usize>>,
    kills: Mutex<Vec<(String, Vec<u32>)>>,
}

impl FakeExec {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, address: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(address.to_string(), behavior);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn probes(&self, address: &str) -> usize {
        self.probes
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    pub fn kill_calls(&self) -> Vec<(String, Vec<u32>)> {
        self.kills.lock().unwrap().clone()
    }

    fn behavior(&self, address: &str) -> Behavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_else(|| Behavior::Fail(TransportError::Unreachable("no such host".into())))
    }
}

#[async_trait]
impl RemoteExec for FakeExec {
    async fn execute(
        &self,
        address: &str,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        let kill_pids = parse_kill_pids(command);
        match &kill_pids {
            Some(pids) => self
                .kills
                .lock()
                .unwrap()
                .push((address.to_string(), pids.clone())),
            None => {
                assert_eq!(command, PROBE_COMMAND, "unexpected command");
                *self
                    .probes
                    .lock()
                    .unwrap()
                    .entry(address.to_string())
                    .or_default() += 1;
            }
        }

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match (self.behavior(address), kill_pids) {
            (Behavior::Hang, _) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(TransportError::Timeout(Duration::from_secs(3600)))
            }
            (Behavior::Fail(e), _) => Err(e),
            (Behavior::Exit(code), _) => Ok(CommandOutput {
                stdout: String::new(),
                stderr: "command failed".to_string(),
                exit_code: code,
            }),
            (Behavior::Output(stdout), Some(pids)) => {
                self.set(address, Behavior::Output(without_pids(&stdout, &pids)));
                Ok(CommandOutput {
                    stdout: pids.iter().map(|p| format!("{p} ok\n")).collect(),
                    stderr: String::new(),
                    exit_code: 0,
                })
            }
            (Behavior::Delayed(pause, stdout), None) => {
                tokio::time::sleep(pause).await;
                Ok(CommandOutput {
                    stdout,
                    stderr: String::new(),
                    exit_code: 0,
                })
            }
            (Behavior::Delayed(..), Some(_)) => Err(TransportError::Unreachable("busy".into())),
            (Behavior::Output(stdout), None) => Ok(CommandOutput {
                stdout,
                stderr: String::new(),
                exit_code: 0,
            }),
        }
    }
}

/// Probe output with the process lines for `pids` removed.
fn without_pids(stdout: &str, pids: &[u32]) -> String {
    let Some((gpus, processes)) = stdout.split_once("---PROCESSES---\n") else {
        return stdout.to_string();
    };
    let kept: String = processes
        .lines()
        .filter(|line| {
            let pid = line.split(',').nth(1).and_then(|p| p.trim().parse::<u32>().ok());
            !pid.is_some_and(|p| pids.contains(&p))
        })
        .map(|line| format!("{line}\n"))
        .collect();
    format!("{gpus}---PROCESSES---\n{kept}")
}

fn parse_kill_pids(command: &str) -> Option<Vec<u32>> {
    let rest = command.strip_prefix("for p in ")?;
    let (list, _) = rest.split_once(';')?;
    Some(list.split_whitespace().filter_map(|p| p.parse().ok()).collect())
}

pub fn gpu_line(index: u32, utilization: u8, used_mb: u64, total_mb: u64) -> String {
    format!("{index}, GPU-{index}, NVIDIA A100-SXM4-80GB, {utilization}, {used_mb}, {total_mb}, 41, 180.25")
}

pub fn process_line(index: u32, pid: u32, user: &str, mem_mb: u64) -> String {
    format!("GPU-{index}, {pid}, {user}, {mem_mb}, python train.py")
}

pub fn probe_text(gpus: &[String], processes: &[String]) -> String {
    let mut out = gpus.join("\n");
    out.push_str("\n---PROCESSES---\n");
    out.push_str(&processes.join("\n"));
    out.push('\n');
    out
}

pub fn probe_output(gpus: &[String], processes: &[String]) -> Behavior {
    Behavior::Output(probe_text(gpus, processes))
}

/// One idle GPU, no processes.
pub fn idle_host() -> Behavior {
    probe_output(&[gpu_line(0, 0, 0, 81920)], &[])
}

pub fn unreachable() -> Behavior {
    Behavior::Fail(TransportError::Unreachable("connection refused".into()))
}

/// Roster where each host's address equals its id, so fakes are keyed by id.
pub fn roster(ids: &[&str], tweak: impl FnOnce(&mut Settings)) -> FleetConfig {
    let mut settings = Settings {
        rate_limit_capacity: 0,
        ..Settings::default()
    };
    tweak(&mut settings);
    let hosts = ids.iter().map(|id| HostSpec::new(*id, *id)).collect();
    let cfg = FleetConfig::new(hosts, settings);
    cfg.validate().unwrap();
    cfg
}
