use serde::{Deserialize, Serialize};

/// One entry of the host roster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostSpec {
    pub id: String,

    /// SSH destination, e.g. `gpu01.cluster.local` or `user@10.0.0.7`.
    #[serde(alias = "hostname")]
    pub address: String,

    #[serde(default, alias = "description")]
    pub label: String,
}

impl HostSpec {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            label: String::new(),
        }
    }
}
