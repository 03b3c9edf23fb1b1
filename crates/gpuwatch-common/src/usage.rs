use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ProcessReading;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostProcesses {
    pub host_id: String,
    pub processes: Vec<ProcessReading>,
}

/// One user's GPU footprint, derived from a fleet snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserUsage {
    pub username: String,
    pub total_processes: usize,
    pub total_memory_mb: u64,
    pub servers: Vec<String>,
    pub processes_by_host: Vec<HostProcesses>,
    pub captured_at: DateTime<Utc>,
    /// Copied from the snapshot the figures were taken from.
    pub degraded: bool,
}
