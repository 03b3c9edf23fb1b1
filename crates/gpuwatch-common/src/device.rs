use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceReading {
    pub index: u32,
    pub name: String,
    pub utilization_percent: u8,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,

    #[serde(default)]
    pub temperature_c: Option<u32>,
    #[serde(default)]
    pub power_draw_w: Option<f64>,

    #[serde(default)]
    pub processes: Vec<ProcessReading>,
}

impl DeviceReading {
    pub fn memory_free_mb(&self) -> u64 {
        self.memory_total_mb.saturating_sub(self.memory_used_mb)
    }
}

/// A compute process holding memory on one device. `pid` is only unique
/// within the host it was read from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessReading {
    pub pid: u32,
    pub username: String,
    pub device_index: u32,
    pub memory_used_mb: u64,
    pub process_name: String,
}
