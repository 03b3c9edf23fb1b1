use std::time::Duration;

use thiserror::Error;

use crate::{FailureKind, ProbeFailure};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FleetError {
    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("authentication rejected: {0}")]
    AuthFailure(String),

    #[error("remote command exited with status {exit_code}: {stderr}")]
    CommandError { exit_code: i32, stderr: String },

    #[error("unexpected command output: {0}")]
    ParseError(String),

    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("circuit breaker open for host {0}")]
    BreakerOpen(String),

    #[error("rate limited, retry in {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("request cancelled after {0:?}")]
    Cancelled(Duration),

    #[error("unknown host '{0}'")]
    UnknownHost(String),
}

impl FleetError {
    /// Failure kind recorded on a host snapshot, for the errors that can
    /// happen while probing a host.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            FleetError::Unreachable(_) => Some(FailureKind::Unreachable),
            FleetError::AuthFailure(_) => Some(FailureKind::AuthFailure),
            FleetError::CommandError { .. } => Some(FailureKind::CommandError),
            FleetError::ParseError(_) => Some(FailureKind::ParseError),
            FleetError::Timeout(_) => Some(FailureKind::Timeout),
            FleetError::BreakerOpen(_) => Some(FailureKind::BreakerOpen),
            FleetError::RateLimited { .. } | FleetError::Cancelled(_) | FleetError::UnknownHost(_) => {
                None
            }
        }
    }
}

/// Errors outside the probe taxonomy are recorded as command errors.
impl From<&FleetError> for ProbeFailure {
    fn from(err: &FleetError) -> Self {
        let kind = err.failure_kind().unwrap_or(FailureKind::CommandError);
        ProbeFailure::new(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_failure_from_error() {
        let f = ProbeFailure::from(&FleetError::Timeout(Duration::from_secs(6)));
        assert_eq!(f.kind, FailureKind::Timeout);
        assert_eq!(f.message, "deadline of 6s exceeded");

        let f = ProbeFailure::from(&FleetError::CommandError {
            exit_code: 127,
            stderr: "nvidia-smi: not found".into(),
        });
        assert_eq!(f.kind, FailureKind::CommandError);
        assert!(f.message.contains("127"));

        assert_eq!(
            ProbeFailure::from(&FleetError::BreakerOpen("gpu02".into())).kind,
            FailureKind::BreakerOpen
        );
        assert_eq!(FleetError::UnknownHost("gpu99".into()).failure_kind(), None);
    }
}
