pub mod device;
pub mod error;
pub mod health;
pub mod host;
pub mod kill;
pub mod snapshot;
pub mod usage;

pub use device::{DeviceReading, ProcessReading};
pub use error::FleetError;
pub use health::HealthStatus;
pub use host::HostSpec;
pub use kill::{
    HostKillOutcome, KillCandidate, KillOutcome, KillPlan, KillReport, KillRequest, PidOutcome,
};
pub use snapshot::{FailureKind, FleetSnapshot, HostSnapshot, ProbeFailure};
pub use usage::{HostProcesses, UserUsage};

pub mod telemetry;
