use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::caller::caller_context;
use crate::handlers::{get_fleet, get_host, get_usage, healthz, post_kill};
use crate::metrics::{metrics_handler, track_requests};
use crate::state::AppState;

pub fn router(st: AppState) -> Router {
    // Fleet routes go through the service's rate limiter and caller deadline.
    let fleet_routes = Router::new()
        .route("/v1/fleet", get(get_fleet))
        .route("/v1/hosts/:id", get(get_host))
        .route("/v1/usage/:username", get(get_usage))
        .route("/v1/kill", post(post_kill))
        .layer(middleware::from_fn(caller_context));

    let public_routes = Router::new()
        .route("/healthz", get(healthz))
        .route("/health", get(healthz))
        .route("/metrics", get(metrics_handler));

    public_routes
        .merge(fleet_routes)
        .layer(middleware::from_fn_with_state(st.clone(), track_requests))
        .with_state(st)
}
