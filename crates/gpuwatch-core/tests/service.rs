mod common;

use std::time::Duration;

use common::{idle_host, roster, unreachable, Behavior, FakeExec};
use gpuwatch_common::FleetError;
use gpuwatch_core::{Caller, GpuWatch};

#[tokio::test]
async fn test_rate_limit_per_caller() {
    let exec = FakeExec::new();
    exec.set("gpu01", idle_host());
    let svc = GpuWatch::new(
        roster(&["gpu01"], |s| {
            s.rate_limit_capacity = 2;
            s.rate_limit_refill_per_sec = 0.0;
        }),
        exec.clone(),
    );
    let alice = Caller::identified("alice");

    svc.fleet(&alice).await.unwrap();
    svc.host(&alice, "gpu01").await.unwrap();
    let err = svc.fleet(&alice).await.unwrap_err();
    assert!(matches!(err, FleetError::RateLimited { retry_after } if retry_after > Duration::ZERO));

    // Other callers have their own bucket; anonymous ones share "global".
    svc.fleet(&Caller::identified("bob")).await.unwrap();
    svc.fleet(&Caller::anonymous()).await.unwrap();
    assert_eq!(svc.stats().rate_limited_total, 1);
    assert_eq!(exec.probes("gpu01"), 1);
}

#[tokio::test]
async fn test_rate_limited_call_does_no_work() {
    let exec = FakeExec::new();
    exec.set("gpu01", idle_host());
    let svc = GpuWatch::new(
        roster(&["gpu01"], |s| {
            s.rate_limit_capacity = 1;
            s.rate_limit_refill_per_sec = 0.0;
        }),
        exec.clone(),
    );
    let caller = Caller::identified("alice");
    svc.health().await;
    assert!(svc.usage(&caller, "john", None).await.is_ok());
    svc.cache().invalidate();
    assert!(svc.usage(&caller, "john", None).await.is_err());
    assert_eq!(exec.probes("gpu01"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_caller_deadline_cancels_wait_not_scan() {
    let exec = FakeExec::new();
    exec.set("gpu01", Behavior::Hang);
    exec.set("gpu02", idle_host());
    let svc = GpuWatch::new(roster(&["gpu01", "gpu02"], |_| {}), exec.clone());

    let impatient = Caller::anonymous().with_deadline(Duration::from_millis(100));
    let err = svc.fleet(&impatient).await.unwrap_err();
    assert_eq!(err, FleetError::Cancelled(Duration::from_millis(100)));
    assert_eq!(svc.stats().cancelled_total, 1);

    // The abandoned refresh keeps running and is joined by the next reader.
    let fleet = svc.fleet(&Caller::anonymous()).await.unwrap();
    assert_eq!(fleet.total_hosts(), 2);
    assert_eq!(exec.probes("gpu01"), 1);
    assert_eq!(svc.stats().cache.refreshes_total, 1);
}

#[tokio::test]
async fn test_unknown_host() {
    let exec = FakeExec::new();
    exec.set("gpu01", idle_host());
    let svc = GpuWatch::new(roster(&["gpu01"], |_| {}), exec.clone());
    let caller = Caller::anonymous();

    assert_eq!(
        svc.host(&caller, "gpu42").await.unwrap_err(),
        FleetError::UnknownHost("gpu42".to_string())
    );
    assert_eq!(
        svc.usage(&caller, "john", Some("gpu42")).await.unwrap_err(),
        FleetError::UnknownHost("gpu42".to_string())
    );
    // Rejected before any scan was needed.
    assert_eq!(exec.probes("gpu01"), 0);
}

#[tokio::test]
async fn test_health_tracks_last_scan_and_breakers() {
    let exec = FakeExec::new();
    exec.set("gpu01", idle_host());
    exec.set("gpu02", unreachable());
    let svc = GpuWatch::new(
        roster(&["gpu01", "gpu02"], |s| s.breaker_threshold = 1),
        exec.clone(),
    );

    let before = svc.health().await;
    assert!(!before.healthy);
    assert_eq!(before.snapshot_age_ms, None);
    assert_eq!(exec.probes("gpu01"), 0);

    svc.fleet(&Caller::anonymous()).await.unwrap();
    let after = svc.health().await;
    assert!(after.healthy);
    assert!(after.last_cycle_complete);
    assert_eq!(after.breaker_open_hosts, vec!["gpu02".to_string()]);
    assert!(after.last_scan_at.is_some());
    assert_eq!(svc.stats().open_breakers, 1);
}
