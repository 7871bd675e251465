//! Records exchanged with a hub during device reconciliation.

use crate::attributes::AttributeMap;
use serde::{Deserialize, Serialize};

/// One device as reported by a hub in a sync request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDeviceInfo {
    pub protocol: String,
    /// Absent when the hub does not know the device's connectivity.
    #[serde(default)]
    pub online: Option<bool>,
    #[serde(default)]
    pub degraded: bool,
    #[serde(default)]
    pub attrs: AttributeMap,
}

/// Degraded flag of one device as reported by a hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradedInfo {
    pub protocol: String,
    #[serde(default)]
    pub degraded: bool,
}

/// Platform view of a device known to both sides, returned to the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDeviceState {
    pub protocol: String,
    pub platform: String,
    pub driver: String,
    pub version: String,
    /// Driver content hash, empty when the definition could not be loaded.
    pub hash: String,
}
