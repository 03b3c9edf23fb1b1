use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use gpuwatch_core::ServiceStats;

use crate::state::AppState;

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_inflight: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
}

pub fn render_metrics(metrics: &Metrics, stats: &ServiceStats) -> String {
    let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
    let rows = [
        ("requests_total", "counter", "Total HTTP requests handled.", load(&metrics.requests_total)),
        ("requests_inflight", "gauge", "Currently in-flight HTTP requests.", load(&metrics.requests_inflight)),
        ("responses_2xx", "counter", "Total 2xx responses.", load(&metrics.status_2xx)),
        ("responses_4xx", "counter", "Total 4xx responses.", load(&metrics.status_4xx)),
        ("responses_5xx", "counter", "Total 5xx responses.", load(&metrics.status_5xx)),
        ("cache_hits_total", "counter", "Fleet reads served from a fresh snapshot.", stats.cache.hits_total),
        ("cache_refreshes_total", "counter", "Snapshot refreshes started.", stats.cache.refreshes_total),
        ("cache_coalesced_total", "counter", "Reads that joined a refresh already in flight.", stats.cache.coalesced_total),
        ("scans_total", "counter", "Fleet scan cycles run.", stats.scans_total),
        ("probes_total", "counter", "Host probes dispatched.", stats.probes_total),
        ("incomplete_cycles_total", "counter", "Scan cycles cut short by the cycle deadline.", stats.incomplete_cycles_total),
        ("breaker_short_circuits_total", "counter", "Probes skipped because the host breaker was open.", stats.short_circuits_total),
        ("breakers_open", "gauge", "Hosts whose breaker is currently open.", stats.open_breakers),
        ("rate_limited_total", "counter", "Requests rejected by the rate limiter.", stats.rate_limited_total),
        ("cancelled_total", "counter", "Requests that ran past the caller deadline.", stats.cancelled_total),
        ("kills_executed_total", "counter", "Confirmed kill requests executed.", stats.kills_executed_total),
    ];

    let mut body = String::new();
    for (name, kind, help, value) in rows {
        let _ = write!(
            body,
            "# HELP gpuwatch_{name} {help}\n\
             # TYPE gpuwatch_{name} {kind}\n\
             gpuwatch_{name} {value}\n"
        );
    }
    body
}

pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    let body = render_metrics(&st.metrics, &st.watch.stats());
    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

pub async fn track_requests(
    State(st): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible> {
    st.metrics.requests_inflight.fetch_add(1, Ordering::Relaxed);
    let resp = next.run(req).await;
    st.metrics.requests_inflight.fetch_sub(1, Ordering::Relaxed);
    st.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let status = resp.status().as_u16();
    if status >= 500 {
        st.metrics.status_5xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 400 {
        st.metrics.status_4xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 200 {
        st.metrics.status_2xx.fetch_add(1, Ordering::Relaxed);
    }

    Ok(resp)
}
