use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wire form of a kill submission. `confirm` defaults to false so an absent
/// flag is a dry-run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KillRequest {
    pub username: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KillCandidate {
    pub host_id: String,
    pub pid: u32,
    pub device_index: u32,
    pub memory_used_mb: u64,
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KillPlan {
    pub username: String,
    pub host_scope: Option<String>,
    pub candidates: Vec<KillCandidate>,
    pub planned_at: DateTime<Utc>,
    pub snapshot_captured_at: DateTime<Utc>,
}

impl KillPlan {
    /// Host ids in first-seen order with the pids planned for each.
    pub fn by_host(&self) -> Vec<(String, Vec<u32>)> {
        let mut out: Vec<(String, Vec<u32>)> = Vec::new();
        for c in &self.candidates {
            match out.iter_mut().find(|(h, _)| *h == c.host_id) {
                Some((_, pids)) => {
                    if !pids.contains(&c.pid) {
                        pids.push(c.pid);
                    }
                }
                None => out.push((c.host_id.clone(), vec![c.pid])),
            }
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PidOutcome {
    pub pid: u32,
    pub killed: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl PidOutcome {
    pub fn killed(pid: u32) -> Self {
        Self {
            pid,
            killed: true,
            error: None,
        }
    }

    pub fn failed(pid: u32, error: impl Into<String>) -> Self {
        Self {
            pid,
            killed: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostKillOutcome {
    pub host_id: String,
    pub results: Vec<PidOutcome>,
    pub memory_freed_mb: u64,
    pub devices_touched: Vec<u32>,
}

impl HostKillOutcome {
    pub fn succeeded(&self) -> bool {
        self.results.iter().all(|r| r.killed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KillOutcome {
    pub username: String,
    pub hosts: Vec<HostKillOutcome>,
    pub killed: usize,
    pub failed: usize,
    pub finished_at: DateTime<Utc>,
}

impl KillOutcome {
    pub fn new(username: impl Into<String>, hosts: Vec<HostKillOutcome>) -> Self {
        let killed = hosts
            .iter()
            .flat_map(|h| h.results.iter())
            .filter(|r| r.killed)
            .count();
        let total: usize = hosts.iter().map(|h| h.results.len()).sum();
        Self {
            username: username.into(),
            hosts,
            killed,
            failed: total - killed,
            finished_at: Utc::now(),
        }
    }

    pub fn host(&self, host_id: &str) -> Option<&HostKillOutcome> {
        self.hosts.iter().find(|h| h.host_id == host_id)
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum KillReport {
    DryRun(KillPlan),
    Executed(KillOutcome),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(host: &str, pid: u32) -> KillCandidate {
        KillCandidate {
            host_id: host.to_string(),
            pid,
            device_index: 0,
            memory_used_mb: 10,
            command: "python".to_string(),
        }
    }

    #[test]
    fn test_by_host_groups_in_first_seen_order() {
        let plan = KillPlan {
            username: "bob".to_string(),
            host_scope: None,
            candidates: vec![
                candidate("gpu02", 7),
                candidate("gpu01", 1),
                candidate("gpu02", 8),
                candidate("gpu02", 7),
            ],
            planned_at: Utc::now(),
            snapshot_captured_at: Utc::now(),
        };
        assert_eq!(
            plan.by_host(),
            vec![
                ("gpu02".to_string(), vec![7, 8]),
                ("gpu01".to_string(), vec![1]),
            ]
        );
    }

    #[test]
    fn test_outcome_counts() {
        let outcome = KillOutcome::new(
            "bob",
            vec![
                HostKillOutcome {
                    host_id: "gpu01".to_string(),
                    results: vec![PidOutcome::killed(1), PidOutcome::killed(2)],
                    memory_freed_mb: 20,
                    devices_touched: vec![0],
                },
                HostKillOutcome {
                    host_id: "gpu02".to_string(),
                    results: vec![PidOutcome::failed(3, "unreachable")],
                    memory_freed_mb: 0,
                    devices_touched: vec![],
                },
            ],
        );
        assert_eq!(outcome.killed, 2);
        assert_eq!(outcome.failed, 1);
        assert!(!outcome.all_succeeded());
        assert!(outcome.host("gpu01").is_some_and(|h| h.succeeded()));
    }

    #[test]
    fn test_request_confirm_defaults_to_false() {
        let req: KillRequest = serde_json::from_str(r#"{"username":"john"}"#).unwrap();
        assert!(!req.confirm);
        assert_eq!(req.host, None);
    }
}
