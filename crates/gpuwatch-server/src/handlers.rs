use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gpuwatch_common::{FleetSnapshot, HostSnapshot, KillReport, KillRequest, UserUsage};
use gpuwatch_core::Caller;

use crate::error::ApiError;
use crate::state::AppState;

fn age_ms(captured_at: DateTime<Utc>) -> u64 {
    (Utc::now() - captured_at).num_milliseconds().max(0) as u64
}

#[derive(Debug, Serialize)]
pub struct FleetView {
    #[serde(flatten)]
    pub snapshot: FleetSnapshot,
    pub age_ms: u64,
    pub total_hosts: usize,
    pub online_hosts: usize,
    pub total_gpus: usize,
}

#[derive(Debug, Serialize)]
pub struct HostView {
    #[serde(flatten)]
    pub host: HostSnapshot,
    pub age_ms: u64,
    /// The fleet snapshot's flag: some host is unreachable or stale.
    pub degraded: bool,
    /// This host alone is unreachable or carried over.
    pub host_degraded: bool,
}

#[derive(Debug, Serialize)]
pub struct UsageView {
    #[serde(flatten)]
    pub usage: UserUsage,
    pub age_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub host: Option<String>,
}

pub async fn get_fleet(
    State(st): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<FleetView>, ApiError> {
    let fleet = st.watch.fleet(&caller).await?;
    Ok(Json(FleetView {
        age_ms: fleet.age_ms(),
        total_hosts: fleet.total_hosts(),
        online_hosts: fleet.online_hosts(),
        total_gpus: fleet.total_gpus(),
        snapshot: FleetSnapshot::clone(&fleet),
    }))
}

pub async fn get_host(
    State(st): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(host_id): Path<String>,
) -> Result<Json<HostView>, ApiError> {
    let host = st.watch.host(&caller, &host_id).await?;
    // The entry was just sliced out of the committed snapshot.
    let degraded = st
        .watch
        .cache()
        .peek()
        .await
        .map_or(true, |fleet| fleet.degraded);
    Ok(Json(HostView {
        age_ms: age_ms(host.captured_at),
        degraded,
        host_degraded: !host.reachable || host.stale,
        host,
    }))
}

pub async fn get_usage(
    State(st): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(username): Path<String>,
    Query(q): Query<UsageQuery>,
) -> Result<Json<UsageView>, ApiError> {
    let usage = st
        .watch
        .usage(&caller, &username, q.host.as_deref())
        .await?;
    Ok(Json(UsageView {
        age_ms: age_ms(usage.captured_at),
        usage,
    }))
}

pub async fn post_kill(
    State(st): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<KillRequest>,
) -> Result<Json<KillReport>, ApiError> {
    tracing::info!(
        caller=?caller.identity,
        user=%req.username,
        host=?req.host,
        confirm=req.confirm,
        "kill requested"
    );
    let report = st.watch.kill(&caller, req).await?;
    Ok(Json(report))
}

pub async fn healthz(State(st): State<AppState>) -> impl IntoResponse {
    let health = st.watch.health().await;
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}
