use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashSet;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use gpuwatch_common::{FleetError, FleetSnapshot, HostSnapshot, ProbeFailure};

use crate::breaker::{Admission, BreakerRegistry};
use crate::config::FleetConfig;
use crate::probe::Prober;

/// Runs one refresh cycle across the roster with at most K probes in flight.
#[derive(Debug)]
pub struct FleetScanner {
    config: Arc<FleetConfig>,
    prober: Prober,
    breakers: Arc<BreakerRegistry>,
    permits: Arc<Semaphore>,
    probe_timeout: Duration,
    cycle_deadline: Duration,
    scans_total: AtomicU64,
    probes_total: AtomicU64,
    incomplete_cycles_total: AtomicU64,
}

impl FleetScanner {
    /// `permits` bounds concurrent remote calls; callers may share it with
    /// other fleet-wide work.
    pub fn new(
        config: Arc<FleetConfig>,
        prober: Prober,
        breakers: Arc<BreakerRegistry>,
        permits: Arc<Semaphore>,
    ) -> Self {
        let probe_timeout = config.settings.probe_timeout();
        let cycle_deadline = config.settings.cycle_deadline();
        Self {
            config,
            prober,
            breakers,
            permits,
            probe_timeout,
            cycle_deadline,
            scans_total: AtomicU64::new(0),
            probes_total: AtomicU64::new(0),
            incomplete_cycles_total: AtomicU64::new(0),
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn scans_total(&self) -> u64 {
        self.scans_total.load(Ordering::Relaxed)
    }

    pub fn probes_total(&self) -> u64 {
        self.probes_total.load(Ordering::Relaxed)
    }

    pub fn incomplete_cycles_total(&self) -> u64 {
        self.incomplete_cycles_total.load(Ordering::Relaxed)
    }

    /// Probe every roster host and build the next fleet snapshot. Hosts that
    /// are skipped by their breaker or miss the cycle deadline contribute
    /// their entry from `previous`, marked stale. Only probes that actually
    /// started feed the breaker; a host still queued for a permit when the
    /// deadline fires is left untouched.
    pub async fn scan(&self, previous: Option<&FleetSnapshot>) -> FleetSnapshot {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.cycle_deadline;
        self.scans_total.fetch_add(1, Ordering::Relaxed);

        let mut short_circuited: HashSet<&str> = HashSet::new();
        let dispatched: Arc<DashSet<String>> = Arc::new(DashSet::new());
        let mut tasks = JoinSet::new();

        for host in &self.config.hosts {
            let admission = self.breakers.admit(&host.id);
            match admission {
                Admission::ShortCircuit => {
                    self.breakers.record_short_circuit(&host.id);
                    short_circuited.insert(host.id.as_str());
                    continue;
                }
                Admission::Trial => {
                    tracing::info!(host=%host.id, "circuit cool-down elapsed, sending trial probe");
                }
                Admission::Probe => {}
            }

            let prober = self.prober.clone();
            let permits = self.permits.clone();
            let dispatched = dispatched.clone();
            let host = host.clone();
            let timeout = self.probe_timeout;
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return HostSnapshot::offline(
                        &host.id,
                        ProbeFailure::from(&FleetError::Unreachable("scanner shutting down".into())),
                        0,
                    );
                };
                dispatched.insert(host.id.clone());
                prober.probe(&host, timeout).await
            });
        }

        let mut fresh: HashMap<String, HostSnapshot> = HashMap::new();
        let collect = async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(snap) => {
                        fresh.insert(snap.host_id.clone(), snap);
                    }
                    Err(e) => tracing::error!(error=%e, "probe task failed"),
                }
            }
        };
        let cycle_complete = tokio::time::timeout_at(deadline, collect).await.is_ok();
        if !cycle_complete {
            self.incomplete_cycles_total.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                outstanding = tasks.len(),
                deadline_ms = self.cycle_deadline.as_millis() as u64,
                "cycle deadline reached, cancelling outstanding probes"
            );
            // Late results die with their tasks and never reach a snapshot.
            tasks.abort_all();
        }
        self.probes_total
            .fetch_add(dispatched.len() as u64, Ordering::Relaxed);

        let mut hosts = Vec::with_capacity(self.config.hosts.len());
        for host in &self.config.hosts {
            let entry = match fresh.remove(&host.id) {
                Some(snap) => {
                    if snap.reachable {
                        self.breakers.record_success(&host.id);
                    } else {
                        self.breakers.record_failure(&host.id);
                    }
                    snap
                }
                None if short_circuited.contains(host.id.as_str()) => carry_over(
                    previous,
                    &host.id,
                    ProbeFailure::from(&FleetError::BreakerOpen(host.id.clone())),
                ),
                None if dispatched.contains(&host.id) => {
                    self.breakers.record_failure(&host.id);
                    carry_over(
                        previous,
                        &host.id,
                        ProbeFailure::from(&FleetError::Timeout(self.cycle_deadline)),
                    )
                }
                None => {
                    tracing::debug!(host=%host.id, "probe never started before the cycle deadline");
                    carry_over(
                        previous,
                        &host.id,
                        ProbeFailure::from(&FleetError::Timeout(self.cycle_deadline)),
                    )
                }
            };
            hosts.push(entry);
        }

        let snapshot = FleetSnapshot::new(hosts, cycle_complete);
        tracing::info!(
            hosts = snapshot.total_hosts(),
            online = snapshot.online_hosts(),
            gpus = snapshot.total_gpus(),
            degraded = snapshot.degraded,
            cycle_complete,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "fleet scan finished"
        );
        snapshot
    }
}

/// Last known entry for `host_id`, flagged stale, or an unreachable
/// placeholder if the host was never seen.
fn carry_over(previous: Option<&FleetSnapshot>, host_id: &str, failure: ProbeFailure) -> HostSnapshot {
    match previous.and_then(|p| p.host(host_id)) {
        Some(last) => last.to_stale(),
        None => HostSnapshot::offline(host_id, failure, 0),
    }
}
