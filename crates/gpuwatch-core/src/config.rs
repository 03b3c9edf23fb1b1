use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use gpuwatch_common::HostSpec;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read roster {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid roster json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("roster has no hosts")]
    EmptyRoster,
    #[error("duplicate host id '{0}'")]
    DuplicateHost(String),
    #[error("host entry {0} has an empty id or address")]
    IncompleteHost(usize),
    #[error("setting '{0}' must be greater than zero")]
    Zero(&'static str),
    #[error("cycle_deadline ({cycle}s) must not be shorter than ssh_timeout ({probe}s)")]
    DeadlineShorterThanProbe { cycle: f64, probe: f64 },
    #[error("rate_limit_refill_per_sec must be a finite, non-negative number")]
    BadRefill,
}

fn default_cache_ttl() -> f64 {
    30.0
}
fn default_probe_timeout() -> f64 {
    5.0
}
fn default_cycle_deadline() -> f64 {
    10.0
}
fn default_max_concurrent() -> usize {
    4
}
fn default_breaker_threshold() -> u32 {
    3
}
fn default_breaker_cooldown() -> f64 {
    60.0
}
fn default_rate_capacity() -> u32 {
    20
}
fn default_rate_refill() -> f64 {
    5.0
}

/// Tunables. Durations are seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: f64,
    #[serde(default = "default_probe_timeout", alias = "probe_timeout")]
    pub ssh_timeout: f64,
    #[serde(default = "default_cycle_deadline")]
    pub cycle_deadline: f64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_cooldown")]
    pub breaker_cooldown: f64,
    /// Zero disables rate limiting.
    #[serde(default = "default_rate_capacity")]
    pub rate_limit_capacity: u32,
    #[serde(default = "default_rate_refill")]
    pub rate_limit_refill_per_sec: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_ttl: default_cache_ttl(),
            ssh_timeout: default_probe_timeout(),
            cycle_deadline: default_cycle_deadline(),
            max_concurrent: default_max_concurrent(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown: default_breaker_cooldown(),
            rate_limit_capacity: default_rate_capacity(),
            rate_limit_refill_per_sec: default_rate_refill(),
        }
    }
}

impl Settings {
    pub fn cache_ttl(&self) -> Duration {
        secs(self.cache_ttl)
    }

    pub fn probe_timeout(&self) -> Duration {
        secs(self.ssh_timeout)
    }

    pub fn cycle_deadline(&self) -> Duration {
        secs(self.cycle_deadline)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        secs(self.breaker_cooldown)
    }
}

fn secs(v: f64) -> Duration {
    Duration::try_from_secs_f64(v).unwrap_or(Duration::ZERO)
}

/// Host roster plus tunables, loaded once at startup and shared read-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetConfig {
    #[serde(alias = "servers")]
    pub hosts: Vec<HostSpec>,
    #[serde(default)]
    pub settings: Settings,
}

impl FleetConfig {
    pub fn new(hosts: Vec<HostSpec>, settings: Settings) -> Self {
        Self { hosts, settings }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let cfg: FleetConfig = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn host(&self, host_id: &str) -> Option<&HostSpec> {
        self.hosts.iter().find(|h| h.id == host_id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::EmptyRoster);
        }
        let mut seen = HashSet::new();
        for (i, h) in self.hosts.iter().enumerate() {
            if h.id.trim().is_empty() || h.address.trim().is_empty() {
                return Err(ConfigError::IncompleteHost(i));
            }
            if !seen.insert(h.id.as_str()) {
                return Err(ConfigError::DuplicateHost(h.id.clone()));
            }
        }

        let s = &self.settings;
        let positive = [
            ("cache_ttl", s.cache_ttl),
            ("ssh_timeout", s.ssh_timeout),
            ("cycle_deadline", s.cycle_deadline),
        ];
        for (name, v) in positive {
            if !(v.is_finite() && v > 0.0) {
                return Err(ConfigError::Zero(name));
            }
        }
        if s.max_concurrent == 0 {
            return Err(ConfigError::Zero("max_concurrent"));
        }
        if s.breaker_threshold == 0 {
            return Err(ConfigError::Zero("breaker_threshold"));
        }
        if !(s.breaker_cooldown.is_finite() && s.breaker_cooldown >= 0.0) {
            return Err(ConfigError::Zero("breaker_cooldown"));
        }
        if s.cycle_deadline < s.ssh_timeout {
            return Err(ConfigError::DeadlineShorterThanProbe {
                cycle: s.cycle_deadline,
                probe: s.ssh_timeout,
            });
        }
        if !(s.rate_limit_refill_per_sec.is_finite() && s.rate_limit_refill_per_sec >= 0.0) {
            return Err(ConfigError::BadRefill);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_accepts_servers_layout() {
        let raw = r#"{
            "servers": [
                {"id": "test-gpu01", "hostname": "test1.example.com", "description": "Test GPU server 1"},
                {"id": "test-gpu02", "hostname": "test2.example.com"}
            ],
            "settings": {"cache_ttl": 5, "ssh_timeout": 2, "max_concurrent": 2}
        }"#;
        let cfg = FleetConfig::from_json(raw).unwrap();
        assert_eq!(cfg.hosts.len(), 2);
        assert_eq!(cfg.hosts[0].address, "test1.example.com");
        assert_eq!(cfg.hosts[0].label, "Test GPU server 1");
        assert_eq!(cfg.hosts[1].label, "");
        assert_eq!(cfg.settings.cache_ttl(), Duration::from_secs(5));
        assert_eq!(cfg.settings.probe_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.settings.max_concurrent, 2);
        // untouched settings keep defaults
        assert_eq!(cfg.settings.breaker_threshold, 3);
        assert_eq!(cfg.settings.cycle_deadline(), Duration::from_secs(10));
    }

    #[test]
    fn test_rejects_bad_rosters() {
        assert!(matches!(
            FleetConfig::from_json(r#"{"hosts": []}"#),
            Err(ConfigError::EmptyRoster)
        ));
        assert!(matches!(
            FleetConfig::from_json(
                r#"{"hosts": [{"id": "a", "address": "x"}, {"id": "a", "address": "y"}]}"#
            ),
            Err(ConfigError::DuplicateHost(id)) if id == "a"
        ));
        assert!(matches!(
            FleetConfig::from_json(r#"{"hosts": [{"id": "a", "address": ""}]}"#),
            Err(ConfigError::IncompleteHost(0))
        ));
        assert!(matches!(
            FleetConfig::from_json(r#"{"hosts": [{"id": "a"}]}"#),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_rejects_bad_settings() {
        let roster = vec![HostSpec::new("gpu01", "gpu01")];
        let mut settings = Settings {
            max_concurrent: 0,
            ..Settings::default()
        };
        assert!(matches!(
            FleetConfig::new(roster.clone(), settings.clone()).validate(),
            Err(ConfigError::Zero("max_concurrent"))
        ));

        settings.max_concurrent = 4;
        settings.cycle_deadline = 1.0;
        assert!(matches!(
            FleetConfig::new(roster, settings).validate(),
            Err(ConfigError::DeadlineShorterThanProbe { .. })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"hosts": [{{"id": "gpu01", "address": "gpu01.cluster.local"}}]}}"#
        )
        .unwrap();
        let cfg = FleetConfig::load(file.path()).unwrap();
        assert_eq!(cfg.host("gpu01").map(|h| h.address.as_str()), Some("gpu01.cluster.local"));
        assert!(cfg.host("gpu02").is_none());

        assert!(matches!(
            FleetConfig::load("/nonexistent/roster.json"),
            Err(ConfigError::Io { .. })
        ));
    }
}
