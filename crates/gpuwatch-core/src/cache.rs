use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use gpuwatch_common::{
    FailureKind, FleetError, FleetSnapshot, HostSnapshot, ProbeFailure, UserUsage,
};

use crate::config::FleetConfig;
use crate::scan::FleetScanner;
use crate::usage::user_usage;

type Refresh = Shared<BoxFuture<'static, Arc<FleetSnapshot>>>;

#[derive(Debug, Clone)]
struct Committed {
    snapshot: Arc<FleetSnapshot>,
    at: Instant,
    generation: u64,
}

struct Inner {
    config: Arc<FleetConfig>,
    scanner: Arc<FleetScanner>,
    ttl: Duration,
    committed: RwLock<Option<Committed>>,
    inflight: Mutex<Option<Refresh>>,
    /// Bumped by `invalidate`; a commit from an older generation is never
    /// considered fresh.
    generation: AtomicU64,
    hits_total: AtomicU64,
    refreshes_total: AtomicU64,
    coalesced_total: AtomicU64,
}

/// Holds the most recently committed fleet snapshot and refreshes it at
/// most once at a time.
#[derive(Clone)]
pub struct SnapshotCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SnapshotCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCache")
            .field("ttl", &self.inner.ttl)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits_total: u64,
    pub refreshes_total: u64,
    pub coalesced_total: u64,
}

impl SnapshotCache {
    pub fn new(config: Arc<FleetConfig>, scanner: Arc<FleetScanner>) -> Self {
        let ttl = config.settings.cache_ttl();
        Self {
            inner: Arc::new(Inner {
                config,
                scanner,
                ttl,
                committed: RwLock::new(None),
                inflight: Mutex::new(None),
                generation: AtomicU64::new(0),
                hits_total: AtomicU64::new(0),
                refreshes_total: AtomicU64::new(0),
                coalesced_total: AtomicU64::new(0),
            }),
        }
    }

    pub fn scanner(&self) -> &Arc<FleetScanner> {
        &self.inner.scanner
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits_total: self.inner.hits_total.load(Ordering::Relaxed),
            refreshes_total: self.inner.refreshes_total.load(Ordering::Relaxed),
            coalesced_total: self.inner.coalesced_total.load(Ordering::Relaxed),
        }
    }

    /// The committed snapshot if younger than the TTL, otherwise the result
    /// of a (possibly shared) refresh.
    pub async fn get_fleet(&self) -> Arc<FleetSnapshot> {
        if let Some(snapshot) = self.fresh_committed().await {
            self.inner.hits_total.fetch_add(1, Ordering::Relaxed);
            return snapshot;
        }
        self.refresh().await
    }

    /// One host's entry sliced out of the fleet snapshot. Never probes a
    /// single host on its own.
    pub async fn get_host(&self, host_id: &str) -> Result<HostSnapshot, FleetError> {
        if self.inner.config.host(host_id).is_none() {
            return Err(FleetError::UnknownHost(host_id.to_string()));
        }
        self.get_fleet()
            .await
            .host(host_id)
            .cloned()
            .ok_or_else(|| FleetError::UnknownHost(host_id.to_string()))
    }

    pub async fn usage(
        &self,
        username: &str,
        host_scope: Option<&str>,
    ) -> Result<UserUsage, FleetError> {
        if let Some(h) = host_scope {
            if self.inner.config.host(h).is_none() {
                return Err(FleetError::UnknownHost(h.to_string()));
            }
        }
        let fleet = self.get_fleet().await;
        Ok(user_usage(&fleet, username, host_scope))
    }

    /// Committed snapshot regardless of age, without triggering any work.
    pub async fn peek(&self) -> Option<Arc<FleetSnapshot>> {
        self.inner
            .committed
            .read()
            .await
            .as_ref()
            .map(|c| c.snapshot.clone())
    }

    /// Force the next read to refresh. A scan already in flight still
    /// commits, but its result is not served as fresh.
    pub fn invalidate(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Refresh now, joining the in-flight refresh if there is one.
    pub async fn refresh(&self) -> Arc<FleetSnapshot> {
        let refresh = {
            let mut inflight = self.inner.inflight.lock().await;
            match inflight.as_ref() {
                Some(r) => {
                    self.inner.coalesced_total.fetch_add(1, Ordering::Relaxed);
                    r.clone()
                }
                None => {
                    // Another refresh may have committed between our
                    // staleness check and taking the lock.
                    if let Some(snapshot) = self.fresh_committed().await {
                        self.inner.coalesced_total.fetch_add(1, Ordering::Relaxed);
                        return snapshot;
                    }
                    let r = self.start_refresh();
                    *inflight = Some(r.clone());
                    r
                }
            }
        };
        refresh.await
    }

    async fn fresh_committed(&self) -> Option<Arc<FleetSnapshot>> {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let guard = self.inner.committed.read().await;
        let committed = guard.as_ref()?;
        (committed.generation == generation && committed.at.elapsed() < self.inner.ttl)
            .then(|| committed.snapshot.clone())
    }

    fn start_refresh(&self) -> Refresh {
        self.inner.refreshes_total.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        // The scan runs in its own task so that callers giving up do not
        // cancel it for everyone else.
        let handle = tokio::spawn(async move {
            let generation = inner.generation.load(Ordering::SeqCst);
            let previous = inner
                .committed
                .read()
                .await
                .as_ref()
                .map(|c| c.snapshot.clone());
            let scanned = AssertUnwindSafe(inner.scanner.scan(previous.as_deref()))
                .catch_unwind()
                .await;
            let snapshot = match scanned {
                Ok(snapshot) => Arc::new(snapshot),
                Err(_) => {
                    tracing::error!("fleet scan panicked, committing placeholder snapshot");
                    Arc::new(placeholder(&inner.config, "fleet scan panicked"))
                }
            };
            let committed = inner.commit(snapshot, generation).await;
            *inner.inflight.lock().await = None;
            committed
        });

        let inner = self.inner.clone();
        async move {
            match handle.await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::error!(error=%e, "refresh task did not complete");
                    *inner.inflight.lock().await = None;
                    match inner.committed.read().await.as_ref() {
                        Some(c) => c.snapshot.clone(),
                        None => Arc::new(placeholder(&inner.config, "refresh task did not complete")),
                    }
                }
            }
        }
        .boxed()
        .shared()
    }
}

impl Inner {
    /// Swap in `snapshot` unless something newer is already committed.
    async fn commit(&self, snapshot: Arc<FleetSnapshot>, generation: u64) -> Arc<FleetSnapshot> {
        let mut guard = self.committed.write().await;
        if let Some(current) = guard.as_ref() {
            if current.snapshot.captured_at > snapshot.captured_at {
                return current.snapshot.clone();
            }
        }
        *guard = Some(Committed {
            snapshot: snapshot.clone(),
            at: Instant::now(),
            generation,
        });
        snapshot
    }
}

fn placeholder(config: &FleetConfig, reason: &str) -> FleetSnapshot {
    let hosts = config
        .hosts
        .iter()
        .map(|h| {
            HostSnapshot::offline(&h.id, ProbeFailure::new(FailureKind::Unreachable, reason), 0)
        })
        .collect();
    FleetSnapshot::new(hosts, false)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use gpuwatch_common::HostSpec;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::breaker::BreakerRegistry;
    use crate::config::Settings;
    use crate::exec::{CommandOutput, RemoteExec, TransportError};
    use crate::probe::Prober;

    struct Offline;

    #[async_trait]
    impl RemoteExec for Offline {
        async fn execute(
            &self,
            _address: &str,
            _command: &str,
            _timeout: Duration,
        ) -> Result<CommandOutput, TransportError> {
            Err(TransportError::Unreachable("connection refused".into()))
        }
    }

    fn cache() -> SnapshotCache {
        let config = Arc::new(FleetConfig::new(
            vec![HostSpec::new("gpu01", "gpu01")],
            Settings::default(),
        ));
        let scanner = Arc::new(FleetScanner::new(
            config.clone(),
            Prober::new(Arc::new(Offline)),
            Arc::new(BreakerRegistry::new(3, Duration::from_secs(60))),
            Arc::new(Semaphore::new(1)),
        ));
        SnapshotCache::new(config, scanner)
    }

    #[tokio::test]
    async fn test_older_snapshot_never_replaces_newer() {
        let cache = cache();
        let generation = cache.inner.generation.load(Ordering::SeqCst);
        let newer = Arc::new(FleetSnapshot::new(Vec::new(), true));
        let mut older = FleetSnapshot::new(Vec::new(), false);
        older.captured_at = newer.captured_at - chrono::Duration::seconds(5);

        let committed = cache.inner.commit(newer.clone(), generation).await;
        assert!(Arc::ptr_eq(&committed, &newer));

        let kept = cache.inner.commit(Arc::new(older), generation).await;
        assert!(Arc::ptr_eq(&kept, &newer));
        assert!(cache.peek().await.is_some_and(|s| Arc::ptr_eq(&s, &newer)));

        let read = cache.get_fleet().await;
        assert!(Arc::ptr_eq(&read, &newer));
        assert_eq!(cache.stats().refreshes_total, 0);
    }

    #[tokio::test]
    async fn test_refresh_commits_one_entry_per_host() {
        let cache = cache();
        let fleet = cache.refresh().await;
        assert_eq!(fleet.total_hosts(), 1);
        assert_eq!(
            fleet.host("gpu01").and_then(|h| h.failure_kind()),
            Some(FailureKind::Unreachable)
        );
        assert!(cache.peek().await.is_some_and(|s| Arc::ptr_eq(&s, &fleet)));
    }
}
