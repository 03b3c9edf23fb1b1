use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DeviceReading, ProcessReading};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Unreachable,
    AuthFailure,
    CommandError,
    Timeout,
    ParseError,
    BreakerOpen,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Unreachable => "unreachable",
            FailureKind::AuthFailure => "auth_failure",
            FailureKind::CommandError => "command_error",
            FailureKind::Timeout => "timeout",
            FailureKind::ParseError => "parse_error",
            FailureKind::BreakerOpen => "breaker_open",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ProbeFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Point-in-time state of one host. Never mutated after construction; the
/// next probe of the same host produces a new value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostSnapshot {
    pub host_id: String,
    pub reachable: bool,

    #[serde(default)]
    pub devices: Vec<DeviceReading>,

    pub captured_at: DateTime<Utc>,
    pub latency_ms: u64,

    #[serde(default)]
    pub failure: Option<ProbeFailure>,

    /// Lines of probe output that did not match the expected shape.
    #[serde(default)]
    pub skipped_lines: usize,

    /// Carried over from an earlier cycle instead of freshly probed.
    #[serde(default)]
    pub stale: bool,
}

impl HostSnapshot {
    pub fn online(
        host_id: impl Into<String>,
        devices: Vec<DeviceReading>,
        latency_ms: u64,
        skipped_lines: usize,
    ) -> Self {
        Self {
            host_id: host_id.into(),
            reachable: true,
            devices,
            captured_at: Utc::now(),
            latency_ms,
            failure: None,
            skipped_lines,
            stale: false,
        }
    }

    pub fn offline(host_id: impl Into<String>, failure: ProbeFailure, latency_ms: u64) -> Self {
        Self {
            host_id: host_id.into(),
            reachable: false,
            devices: Vec::new(),
            captured_at: Utc::now(),
            latency_ms,
            failure: Some(failure),
            skipped_lines: 0,
            stale: false,
        }
    }

    /// Copy of this snapshot flagged as carried over. The capture time is
    /// kept so readers can tell how old the data really is.
    pub fn to_stale(&self) -> Self {
        Self {
            stale: true,
            ..self.clone()
        }
    }

    pub fn processes(&self) -> impl Iterator<Item = &ProcessReading> {
        self.devices.iter().flat_map(|d| d.processes.iter())
    }

    pub fn gpu_count(&self) -> usize {
        self.devices.len()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }
}

/// One refresh cycle's view of the whole fleet, one entry per roster host
/// in roster order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetSnapshot {
    pub hosts: Vec<HostSnapshot>,
    pub captured_at: DateTime<Utc>,
    pub degraded: bool,

    /// False when the cycle deadline fired before every probe answered.
    pub cycle_complete: bool,
}

impl FleetSnapshot {
    pub fn new(hosts: Vec<HostSnapshot>, cycle_complete: bool) -> Self {
        let degraded = hosts.iter().any(|h| !h.reachable || h.stale);
        Self {
            hosts,
            captured_at: Utc::now(),
            degraded,
            cycle_complete,
        }
    }

    pub fn host(&self, host_id: &str) -> Option<&HostSnapshot> {
        self.hosts.iter().find(|h| h.host_id == host_id)
    }

    pub fn host_ids(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(|h| h.host_id.as_str())
    }

    pub fn total_gpus(&self) -> usize {
        self.hosts
            .iter()
            .filter(|h| h.reachable)
            .map(|h| h.gpu_count())
            .sum()
    }

    pub fn online_hosts(&self) -> usize {
        self.hosts.iter().filter(|h| h.reachable).count()
    }

    pub fn total_hosts(&self) -> usize {
        self.hosts.len()
    }

    pub fn age_ms(&self) -> u64 {
        Utc::now()
            .signed_duration_since(self.captured_at)
            .num_milliseconds()
            .max(0) as u64
    }
}
