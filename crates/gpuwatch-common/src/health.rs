use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub healthy: bool,
    pub last_cycle_complete: bool,
    pub breaker_open_hosts: Vec<String>,
    pub snapshot_age_ms: Option<u64>,
    pub last_scan_at: Option<DateTime<Utc>>,
}
