//! Probing and caching core for a GPU fleet reached over SSH.

pub mod breaker;
pub mod cache;
pub mod config;
pub mod exec;
pub mod kill;
pub mod parse;
pub mod probe;
pub mod ratelimit;
pub mod scan;
pub mod service;
pub mod usage;

pub use breaker::BreakerRegistry;
pub use cache::{CacheStats, SnapshotCache};
pub use config::{ConfigError, FleetConfig, Settings};
pub use exec::{CommandOutput, RemoteExec, SshExec, TransportError};
pub use kill::{Confirmation, KillCoordinator};
pub use probe::Prober;
pub use ratelimit::RateLimiter;
pub use scan::FleetScanner;
pub use service::{Caller, GpuWatch, ServiceStats};
