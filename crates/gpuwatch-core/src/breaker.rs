use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Per-host failure tracking. Values are replaced whole on every update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BreakerState {
    pub consecutive_failures: u32,
    pub open: bool,
    pub opened_at: Option<Instant>,
    /// Cycles in which the host was skipped while open.
    pub short_circuits: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed breaker: probe normally.
    Probe,
    /// Open breaker whose cool-down has elapsed: one trial probe.
    Trial,
    /// Open breaker: reuse the last snapshot.
    ShortCircuit,
}

#[derive(Debug)]
pub struct BreakerRegistry {
    threshold: u32,
    cooldown: Duration,
    states: DashMap<String, BreakerState>,
}

impl BreakerRegistry {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            states: DashMap::new(),
        }
    }

    pub fn state(&self, host_id: &str) -> BreakerState {
        self.states
            .get(host_id)
            .map(|s| *s.value())
            .unwrap_or_default()
    }

    pub fn is_open(&self, host_id: &str) -> bool {
        self.state(host_id).open
    }

    pub fn admit(&self, host_id: &str) -> Admission {
        let state = self.state(host_id);
        if !state.open {
            return Admission::Probe;
        }
        let cooled = state
            .opened_at
            .map(|at| at.elapsed() >= self.cooldown)
            .unwrap_or(true);
        if cooled {
            Admission::Trial
        } else {
            Admission::ShortCircuit
        }
    }

    pub fn record_success(&self, host_id: &str) {
        let prev = self.state(host_id);
        if prev.open {
            tracing::info!(host=%host_id, "circuit closed after successful trial probe");
        }
        self.states.insert(
            host_id.to_string(),
            BreakerState {
                short_circuits: prev.short_circuits,
                ..BreakerState::default()
            },
        );
    }

    pub fn record_failure(&self, host_id: &str) {
        let prev = self.state(host_id);
        let consecutive_failures = prev.consecutive_failures.saturating_add(1);
        let next = if prev.open {
            // Failed trial: stay open, restart the cool-down.
            tracing::debug!(host=%host_id, "trial probe failed, circuit stays open");
            BreakerState {
                consecutive_failures,
                opened_at: Some(Instant::now()),
                ..prev
            }
        } else if consecutive_failures >= self.threshold {
            tracing::warn!(
                host=%host_id,
                consecutive_failures,
                cooldown_secs=self.cooldown.as_secs(),
                "circuit opened"
            );
            BreakerState {
                consecutive_failures,
                open: true,
                opened_at: Some(Instant::now()),
                ..prev
            }
        } else {
            BreakerState {
                consecutive_failures,
                ..prev
            }
        };
        self.states.insert(host_id.to_string(), next);
    }

    pub fn record_short_circuit(&self, host_id: &str) {
        let prev = self.state(host_id);
        self.states.insert(
            host_id.to_string(),
            BreakerState {
                short_circuits: prev.short_circuits.saturating_add(1),
                ..prev
            },
        );
    }

    /// Ids of hosts whose breaker is currently open, sorted.
    pub fn open_hosts(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .states
            .iter()
            .filter(|e| e.value().open)
            .map(|e| e.key().clone())
            .collect();
        out.sort();
        out
    }

    pub fn total_short_circuits(&self) -> u64 {
        self.states.iter().map(|e| e.value().short_circuits).sum()
    }
}
