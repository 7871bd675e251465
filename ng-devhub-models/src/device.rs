use crate::address::{DriverAddress, ProtocolAddress};
use ng_devhub_error::HubError;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, str::FromStr};
use uuid::Uuid;

pub const DEGRADED_CODE_NONE: &str = "none";
pub const DEGRADED_CODE_HUB_FIRMWARE: &str = "hub.firmware";

/// Driver version, `major.minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    #[inline]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HubError::InvalidState(format!("invalid driver version: {s}"));
        let (major, minor) = s.trim().split_once('.').unwrap_or((s.trim(), "0"));
        Ok(Version {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

/// Identity of a driver: name plus version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriverId {
    pub name: String,
    pub version: Version,
}

impl DriverId {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DegradedCode {
    #[default]
    None,
    HubFirmware,
    /// Any code the hub sync does not own; never toggled by reconciliation.
    Other(String),
}

impl DegradedCode {
    pub fn as_str(&self) -> &str {
        match self {
            DegradedCode::None => DEGRADED_CODE_NONE,
            DegradedCode::HubFirmware => DEGRADED_CODE_HUB_FIRMWARE,
            DegradedCode::Other(code) => code,
        }
    }

    /// Code the device should move to given the hub's `degraded` flag.
    ///
    /// Only `None` and `HubFirmware` are toggled; any other code is left alone.
    pub fn transition(&self, degraded: bool) -> Option<DegradedCode> {
        match (self, degraded) {
            (DegradedCode::None, true) => Some(DegradedCode::HubFirmware),
            (DegradedCode::HubFirmware, false) => Some(DegradedCode::None),
            _ => None,
        }
    }
}

impl From<String> for DegradedCode {
    fn from(value: String) -> Self {
        match value.as_str() {
            "" | DEGRADED_CODE_NONE => DegradedCode::None,
            DEGRADED_CODE_HUB_FIRMWARE => DegradedCode::HubFirmware,
            _ => DegradedCode::Other(value),
        }
    }
}

impl From<DegradedCode> for String {
    fn from(value: DegradedCode) -> Self {
        value.as_str().to_string()
    }
}

/// Persistent device record as held by the device store.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: Uuid,
    pub place_id: Option<Uuid>,
    pub name: Option<String>,
    pub protocol: Option<String>,
    pub protocol_address: Option<ProtocolAddress>,
    pub driver_id: Option<DriverId>,
    pub caps: BTreeSet<String>,
    pub degraded_code: DegradedCode,
    pub tombstoned: bool,
}

impl Device {
    pub fn new(id: Uuid, protocol_address: ProtocolAddress, driver_id: DriverId) -> Self {
        Self {
            id,
            place_id: None,
            name: None,
            protocol: Some(protocol_address.protocol().to_string()),
            protocol_address: Some(protocol_address),
            driver_id: Some(driver_id),
            caps: BTreeSet::new(),
            degraded_code: DegradedCode::None,
            tombstoned: false,
        }
    }

    #[inline]
    pub fn address(&self) -> DriverAddress {
        DriverAddress::new(self.id)
    }

    /// Hub the device is paired through; `None` for devices that connect directly.
    #[inline]
    pub fn hub_id(&self) -> Option<&str> {
        self.protocol_address.as_ref().and_then(|p| p.hub_id())
    }

    /// True when the device is paired through a hub radio protocol.
    pub fn is_hub_device(&self, hub_protocols: &[String]) -> bool {
        self.protocol
            .as_deref()
            .is_some_and(|p| hub_protocols.iter().any(|h| h == p))
    }
}
