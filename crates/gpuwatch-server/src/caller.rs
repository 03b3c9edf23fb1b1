use std::time::Duration;

use axum::{body::Body, http::HeaderMap, http::Request, middleware::Next, response::Response};

use gpuwatch_core::Caller;

const API_KEY: &str = "x-api-key";
const CALLER_ID: &str = "x-caller-id";
const REQUEST_TIMEOUT: &str = "x-request-timeout-ms";

/// Identity comes from a bearer token, then `x-api-key`, then `x-caller-id`.
/// Requests with none of them share the anonymous bucket.
pub fn caller_from_headers(headers: &HeaderMap) -> Caller {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let identity = header(axum::http::header::AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| header(API_KEY))
        .or_else(|| header(CALLER_ID))
        .map(|s| s.trim().to_string());

    let deadline = header(REQUEST_TIMEOUT)
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis);

    Caller { identity, deadline }
}

pub async fn caller_context(
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible> {
    let caller = caller_from_headers(req.headers());
    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}
