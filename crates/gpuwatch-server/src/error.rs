use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use gpuwatch_common::FleetError;

/// `FleetError` rendered as `{"error": {"message": ...}}`.
#[derive(Debug)]
pub struct ApiError(pub FleetError);

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            FleetError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            FleetError::UnknownHost(_) => StatusCode::NOT_FOUND,
            FleetError::Cancelled(_) | FleetError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            FleetError::Unreachable(_)
            | FleetError::AuthFailure(_)
            | FleetError::CommandError { .. }
            | FleetError::ParseError(_)
            | FleetError::BreakerOpen(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(serde_json::json!({"error": {"message": self.0.to_string()}}));
        let mut resp = (status, body).into_response();
        if let FleetError::RateLimited { retry_after } = &self.0 {
            // Whole seconds, rounded up.
            let secs = retry_after.as_millis().div_ceil(1000).max(1);
            if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
                resp.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        resp
    }
}
