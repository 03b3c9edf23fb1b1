use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use gpuwatch_common::{
    FleetError, FleetSnapshot, HealthStatus, HostSnapshot, KillPlan, KillReport, KillRequest,
    UserUsage,
};

use crate::breaker::BreakerRegistry;
use crate::cache::{CacheStats, SnapshotCache};
use crate::config::FleetConfig;
use crate::exec::RemoteExec;
use crate::kill::{Confirmation, KillCoordinator};
use crate::probe::Prober;
use crate::ratelimit::{Admission, RateLimiter};
use crate::scan::FleetScanner;

/// Who is asking and how long they are willing to wait.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    pub identity: Option<String>,
    pub deadline: Option<Duration>,
}

impl Caller {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn identified(identity: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub cache: CacheStats,
    pub scans_total: u64,
    pub probes_total: u64,
    pub incomplete_cycles_total: u64,
    pub short_circuits_total: u64,
    pub open_breakers: u64,
    pub rate_limited_total: u64,
    pub cancelled_total: u64,
    pub kills_executed_total: u64,
}

/// Entry point for every consumer: HTTP handlers, tests, anything else.
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct GpuWatch {
    config: Arc<FleetConfig>,
    breakers: Arc<BreakerRegistry>,
    cache: SnapshotCache,
    coordinator: Arc<KillCoordinator>,
    limiter: Arc<RateLimiter>,
    cancelled_total: Arc<AtomicU64>,
    kills_executed_total: Arc<AtomicU64>,
}

impl GpuWatch {
    pub fn new(config: impl Into<Arc<FleetConfig>>, exec: Arc<dyn RemoteExec>) -> Self {
        let config = config.into();
        let s = &config.settings;
        let breakers = Arc::new(BreakerRegistry::new(
            s.breaker_threshold,
            s.breaker_cooldown(),
        ));
        // Shared between scans and kill batches so the fleet never sees
        // more than K concurrent remote sessions from us.
        let permits = Arc::new(Semaphore::new(s.max_concurrent));
        let limiter = Arc::new(RateLimiter::new(
            s.rate_limit_capacity,
            s.rate_limit_refill_per_sec,
        ));
        let prober = Prober::new(exec);
        let scanner = Arc::new(FleetScanner::new(
            config.clone(),
            prober.clone(),
            breakers.clone(),
            permits.clone(),
        ));
        let cache = SnapshotCache::new(config.clone(), scanner);
        let coordinator = Arc::new(KillCoordinator::new(
            config.clone(),
            cache.clone(),
            prober,
            permits,
        ));

        tracing::info!(
            hosts = config.hosts.len(),
            max_concurrent = s.max_concurrent,
            cache_ttl_secs = s.cache_ttl,
            "gpu fleet service initialised"
        );

        Self {
            config,
            breakers,
            cache,
            coordinator,
            limiter,
            cancelled_total: Arc::new(AtomicU64::new(0)),
            kills_executed_total: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &Arc<FleetConfig> {
        &self.config
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub async fn fleet(&self, caller: &Caller) -> Result<Arc<FleetSnapshot>, FleetError> {
        self.admit(caller)?;
        self.bounded(caller, async { Ok(self.cache.get_fleet().await) })
            .await
    }

    pub async fn host(&self, caller: &Caller, host_id: &str) -> Result<HostSnapshot, FleetError> {
        self.admit(caller)?;
        self.bounded(caller, self.cache.get_host(host_id)).await
    }

    pub async fn usage(
        &self,
        caller: &Caller,
        username: &str,
        host_scope: Option<&str>,
    ) -> Result<UserUsage, FleetError> {
        self.admit(caller)?;
        self.bounded(caller, self.cache.usage(username, host_scope))
            .await
    }

    /// Preview what a kill for `username` would terminate. Never touches a
    /// host.
    pub async fn plan_kill(
        &self,
        caller: &Caller,
        username: &str,
        host_scope: Option<&str>,
    ) -> Result<KillPlan, FleetError> {
        self.admit(caller)?;
        self.bounded(caller, self.coordinator.plan(username, host_scope))
            .await
    }

    /// Plan and, when `request.confirm` is set, execute. Once execution
    /// starts it runs to completion even if the caller stops waiting.
    /// Confirmed kills are serialized.
    pub async fn kill(
        &self,
        caller: &Caller,
        request: KillRequest,
    ) -> Result<KillReport, FleetError> {
        self.admit(caller)?;
        let confirmation = Confirmation::from(request.confirm);
        let coordinator = self.coordinator.clone();
        let executed = self.kills_executed_total.clone();
        let run = tokio::spawn(async move {
            let report = coordinator
                .plan_and_execute(&request.username, request.host.as_deref(), confirmation)
                .await?;
            if matches!(report, KillReport::Executed(_)) {
                executed.fetch_add(1, Ordering::Relaxed);
            }
            Ok::<_, FleetError>(report)
        });
        self.bounded(caller, async move {
            match run.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(error=%e, "kill task did not complete");
                    Err(FleetError::Cancelled(Duration::ZERO))
                }
            }
        })
        .await
    }

    /// Healthy once the last committed scan finished within its cycle
    /// deadline. Never triggers a scan.
    pub async fn health(&self) -> HealthStatus {
        let snapshot = self.cache.peek().await;
        let breaker_open_hosts = self.breakers.open_hosts();
        let last_cycle_complete = snapshot.as_ref().is_some_and(|s| s.cycle_complete);
        HealthStatus {
            healthy: last_cycle_complete,
            last_cycle_complete,
            breaker_open_hosts,
            snapshot_age_ms: snapshot.as_ref().map(|s| s.age_ms()),
            last_scan_at: snapshot.as_ref().map(|s| s.captured_at),
        }
    }

    pub fn stats(&self) -> ServiceStats {
        let scanner = self.cache.scanner();
        ServiceStats {
            cache: self.cache.stats(),
            scans_total: scanner.scans_total(),
            probes_total: scanner.probes_total(),
            incomplete_cycles_total: scanner.incomplete_cycles_total(),
            short_circuits_total: self.breakers.total_short_circuits(),
            open_breakers: self.breakers.open_hosts().len() as u64,
            rate_limited_total: self.limiter.rejected_total(),
            cancelled_total: self.cancelled_total.load(Ordering::Relaxed),
            kills_executed_total: self.kills_executed_total.load(Ordering::Relaxed),
        }
    }

    fn admit(&self, caller: &Caller) -> Result<(), FleetError> {
        match self.limiter.admit(caller.identity.as_deref()) {
            Admission::Allowed => Ok(()),
            Admission::Rejected { retry_after } => Err(FleetError::RateLimited { retry_after }),
        }
    }

    async fn bounded<T>(
        &self,
        caller: &Caller,
        fut: impl Future<Output = Result<T, FleetError>>,
    ) -> Result<T, FleetError> {
        let Some(deadline) = caller.deadline else {
            return fut.await;
        };
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => {
                self.cancelled_total.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(caller=?caller.identity, deadline_ms=deadline.as_millis() as u64, "caller deadline reached");
                Err(FleetError::Cancelled(deadline))
            }
        }
    }
}
