use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use gpuwatch_common::{
    FleetError, HostKillOutcome, KillCandidate, KillOutcome, KillPlan, KillReport, PidOutcome,
};

use crate::cache::SnapshotCache;
use crate::config::FleetConfig;
use crate::probe::Prober;

/// Whether `execute` may touch remote hosts. Dry-run is the default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Confirmation {
    #[default]
    DryRun,
    Confirmed,
}

impl From<bool> for Confirmation {
    fn from(confirm: bool) -> Self {
        if confirm {
            Confirmation::Confirmed
        } else {
            Confirmation::DryRun
        }
    }
}

#[derive(Debug)]
pub struct KillCoordinator {
    config: Arc<FleetConfig>,
    cache: SnapshotCache,
    prober: Prober,
    permits: Arc<Semaphore>,
    timeout: Duration,
    /// Held across plan and execute of a confirmed kill.
    writer: Mutex<()>,
}

impl KillCoordinator {
    pub fn new(
        config: Arc<FleetConfig>,
        cache: SnapshotCache,
        prober: Prober,
        permits: Arc<Semaphore>,
    ) -> Self {
        let timeout = config.settings.probe_timeout();
        Self {
            config,
            cache,
            prober,
            permits,
            timeout,
            writer: Mutex::new(()),
        }
    }

    /// Plan and carry out a kill for `username`. Confirmed kills run one at
    /// a time, and each plans only after the previous one has invalidated
    /// the cache, so the same pids are never sent twice.
    pub async fn plan_and_execute(
        &self,
        username: &str,
        host_scope: Option<&str>,
        confirmation: Confirmation,
    ) -> Result<KillReport, FleetError> {
        let _writer = match confirmation {
            Confirmation::Confirmed => Some(self.writer.lock().await),
            Confirmation::DryRun => None,
        };
        let plan = self.plan(username, host_scope).await?;
        Ok(self.execute(plan, confirmation).await)
    }

    /// Candidates for termination from the cached snapshot. The preview can
    /// be up to one TTL old; no host is probed specifically for it.
    pub async fn plan(
        &self,
        username: &str,
        host_scope: Option<&str>,
    ) -> Result<KillPlan, FleetError> {
        if let Some(h) = host_scope {
            if self.config.host(h).is_none() {
                return Err(FleetError::UnknownHost(h.to_string()));
            }
        }
        let fleet = self.cache.get_fleet().await;
        let candidates = fleet
            .hosts
            .iter()
            .filter(|h| h.reachable)
            .filter(|h| host_scope.map_or(true, |scope| h.host_id == scope))
            .flat_map(|h| {
                h.processes()
                    .filter(|p| p.username == username)
                    .map(|p| KillCandidate {
                        host_id: h.host_id.clone(),
                        pid: p.pid,
                        device_index: p.device_index,
                        memory_used_mb: p.memory_used_mb,
                        command: p.process_name.clone(),
                    })
            })
            .collect();

        Ok(KillPlan {
            username: username.to_string(),
            host_scope: host_scope.map(str::to_string),
            candidates,
            planned_at: Utc::now(),
            snapshot_captured_at: fleet.captured_at,
        })
    }

    /// Carry out `plan`. Without confirmation the plan is handed back as-is
    /// and nothing is sent to any host.
    pub async fn execute(&self, plan: KillPlan, confirmation: Confirmation) -> KillReport {
        if confirmation == Confirmation::DryRun {
            tracing::info!(
                user=%plan.username,
                candidates=plan.candidates.len(),
                "kill dry-run, nothing executed"
            );
            return KillReport::DryRun(plan);
        }

        let request_id = uuid::Uuid::new_v4();
        let batches = plan.by_host();
        tracing::warn!(
            %request_id,
            user=%plan.username,
            hosts=batches.len(),
            candidates=plan.candidates.len(),
            "executing confirmed kill"
        );

        let mut tasks = JoinSet::new();
        let mut outcomes: HashMap<String, Vec<PidOutcome>> = HashMap::new();
        for (host_id, pids) in &batches {
            let Some(host) = self.config.host(host_id).cloned() else {
                outcomes.insert(
                    host_id.clone(),
                    pids.iter()
                        .map(|pid| PidOutcome::failed(*pid, "host not in roster"))
                        .collect(),
                );
                continue;
            };
            let prober = self.prober.clone();
            let permits = self.permits.clone();
            let pids = pids.clone();
            let timeout = self.timeout;
            tasks.spawn(async move {
                let results = match permits.acquire_owned().await {
                    Ok(_permit) => prober.kill_processes(&host, &pids, timeout).await,
                    Err(_) => pids
                        .iter()
                        .map(|pid| PidOutcome::failed(*pid, "coordinator shutting down"))
                        .collect(),
                };
                (host.id, results)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((host_id, results)) => {
                    outcomes.insert(host_id, results);
                }
                Err(e) => tracing::error!(%request_id, error=%e, "kill task failed"),
            }
        }

        let hosts: Vec<HostKillOutcome> = batches
            .into_iter()
            .map(|(host_id, pids)| {
                let results = outcomes.remove(&host_id).unwrap_or_else(|| {
                    pids.iter()
                        .map(|pid| PidOutcome::failed(*pid, "kill task did not complete"))
                        .collect()
                });
                summarize(&plan, host_id, results)
            })
            .collect();

        let outcome = KillOutcome::new(&plan.username, hosts);
        if outcome.killed > 0 {
            self.cache.invalidate();
        }
        tracing::info!(
            %request_id,
            user=%outcome.username,
            killed=outcome.killed,
            failed=outcome.failed,
            "kill finished"
        );
        KillReport::Executed(outcome)
    }
}

fn summarize(plan: &KillPlan, host_id: String, results: Vec<PidOutcome>) -> HostKillOutcome {
    let killed: Vec<&KillCandidate> = plan
        .candidates
        .iter()
        .filter(|c| c.host_id == host_id)
        .filter(|c| results.iter().any(|r| r.pid == c.pid && r.killed))
        .collect();
    let memory_freed_mb = killed.iter().map(|c| c.memory_used_mb).sum();
    let mut devices_touched: Vec<u32> = killed.iter().map(|c| c.device_index).collect();
    devices_touched.sort_unstable();
    devices_touched.dedup();
    HostKillOutcome {
        host_id,
        results,
        memory_freed_mb,
        devices_touched,
    }
}
