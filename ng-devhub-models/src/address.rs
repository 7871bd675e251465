//! Bus addresses.
//!
//! Every message on the protocol and platform buses carries a source and a
//! destination [`Address`]. The textual representation is stable and is used
//! both for logging and for pattern matching in [`AddressMatcher`].

use ng_devhub_error::HubError;
use std::{fmt, str::FromStr};
use uuid::Uuid;

pub const DRIVER_PREFIX: &str = "DRIV";
pub const PROTOCOL_PREFIX: &str = "PROT";
pub const SERVICE_PREFIX: &str = "SERV";
pub const BROADCAST_REPR: &str = "BCAST";

/// Group segment used for every device driver address.
pub const DEVICE_GROUP: &str = "dev";

/// Name of the device service on the platform bus.
pub const DEVICE_SERVICE: &str = "devsvc";
/// Name of the hub service a hub listens on.
pub const HUB_SERVICE: &str = "hub";
/// Name of the place service; its events carry the place in the message header.
pub const PLACE_SERVICE: &str = "place";

/// Platform-side address of a device driver, `DRIV:dev:<uuid>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriverAddress(Uuid);

impl DriverAddress {
    #[inline]
    pub fn new(device_id: Uuid) -> Self {
        Self(device_id)
    }

    #[inline]
    pub fn device_id(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for DriverAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{DRIVER_PREFIX}:{DEVICE_GROUP}:{}", self.0)
    }
}

/// Protocol-side address of a device, `PROT:<hub-id>:<protocol>:<id>`.
///
/// The hub id is empty for devices that talk to the platform directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolAddress {
    hub_id: Option<String>,
    protocol: String,
    id: String,
}

impl ProtocolAddress {
    pub fn new(hub_id: Option<String>, protocol: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            hub_id: hub_id.filter(|h| !h.is_empty()),
            protocol: protocol.into(),
            id: id.into(),
        }
    }

    #[inline]
    pub fn hub_id(&self) -> Option<&str> {
        self.hub_id.as_deref()
    }

    #[inline]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Hub-scoped form of this address, used to compare hub reports against
    /// the platform's device records.
    pub fn canonical(&self, hub_id: &str) -> ProtocolAddress {
        ProtocolAddress {
            hub_id: Some(hub_id.to_string()),
            protocol: self.protocol.clone(),
            id: self.id.clone(),
        }
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{PROTOCOL_PREFIX}:{}:{}:{}",
            self.hub_id.as_deref().unwrap_or_default(),
            self.protocol,
            self.id
        )
    }
}

impl FromStr for ProtocolAddress {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Address::from_str(s)? {
            Address::Protocol(p) => Ok(p),
            other => Err(HubError::UnsupportedAddress(other.to_string())),
        }
    }
}

/// Address of a named service, `SERV:<name>:<hub-id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceAddress {
    service: String,
    hub_id: Option<String>,
}

impl ServiceAddress {
    pub fn platform(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            hub_id: None,
        }
    }

    pub fn hub(hub_id: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            hub_id: Some(hub_id.into()),
        }
    }

    #[inline]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[inline]
    pub fn hub_id(&self) -> Option<&str> {
        self.hub_id.as_deref()
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{SERVICE_PREFIX}:{}:{}",
            self.service,
            self.hub_id.as_deref().unwrap_or_default()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Address {
    Driver(DriverAddress),
    Protocol(ProtocolAddress),
    Service(ServiceAddress),
    Broadcast,
}

impl Address {
    #[inline]
    pub fn device_service() -> Self {
        Address::Service(ServiceAddress::platform(DEVICE_SERVICE))
    }

    #[inline]
    pub fn hub_service(hub_id: impl Into<String>) -> Self {
        Address::Service(ServiceAddress::hub(hub_id, HUB_SERVICE))
    }

    #[inline]
    pub fn place_service() -> Self {
        Address::Service(ServiceAddress::platform(PLACE_SERVICE))
    }

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Address::Broadcast)
    }

    /// Hub that owns this address, if any.
    pub fn hub_id(&self) -> Option<&str> {
        match self {
            Address::Protocol(p) => p.hub_id(),
            Address::Service(s) => s.hub_id(),
            Address::Driver(_) | Address::Broadcast => None,
        }
    }

    #[inline]
    pub fn is_hub_address(&self) -> bool {
        self.hub_id().is_some()
    }

    pub fn as_driver(&self) -> Option<&DriverAddress> {
        match self {
            Address::Driver(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_protocol(&self) -> Option<&ProtocolAddress> {
        match self {
            Address::Protocol(p) => Some(p),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Driver(d) => d.fmt(f),
            Address::Protocol(p) => p.fmt(f),
            Address::Service(s) => s.fmt(f),
            Address::Broadcast => f.write_str(BROADCAST_REPR),
        }
    }
}

impl From<DriverAddress> for Address {
    fn from(value: DriverAddress) -> Self {
        Address::Driver(value)
    }
}

impl From<ProtocolAddress> for Address {
    fn from(value: ProtocolAddress) -> Self {
        Address::Protocol(value)
    }
}

impl From<ServiceAddress> for Address {
    fn from(value: ServiceAddress) -> Self {
        Address::Service(value)
    }
}

impl FromStr for Address {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == BROADCAST_REPR {
            return Ok(Address::Broadcast);
        }
        let unsupported = || HubError::UnsupportedAddress(s.to_string());
        let (prefix, rest) = s.split_once(':').ok_or_else(unsupported)?;
        match prefix {
            DRIVER_PREFIX => {
                let (group, id) = rest.split_once(':').ok_or_else(unsupported)?;
                if group != DEVICE_GROUP {
                    return Err(unsupported());
                }
                let id = Uuid::parse_str(id).map_err(|_| unsupported())?;
                Ok(Address::Driver(DriverAddress::new(id)))
            }
            PROTOCOL_PREFIX => {
                let mut parts = rest.splitn(3, ':');
                let hub = parts.next().ok_or_else(unsupported)?;
                let protocol = parts.next().ok_or_else(unsupported)?;
                let id = parts.next().ok_or_else(unsupported)?;
                if protocol.is_empty() || id.is_empty() {
                    return Err(unsupported());
                }
                Ok(Address::Protocol(ProtocolAddress::new(
                    Some(hub.to_string()),
                    protocol,
                    id,
                )))
            }
            SERVICE_PREFIX => {
                let (service, hub) = rest.split_once(':').unwrap_or((rest, ""));
                if service.is_empty() {
                    return Err(unsupported());
                }
                Ok(Address::Service(ServiceAddress {
                    service: service.to_string(),
                    hub_id: (!hub.is_empty()).then(|| hub.to_string()),
                }))
            }
            _ => Err(unsupported()),
        }
    }
}

/// Address pattern used when subscribing to a bus.
///
/// Supported forms:
/// - `*` matches everything
/// - `BCAST` matches broadcast destinations
/// - a trailing `*` matches by prefix (e.g. `PROT:*`, `DRIV:dev:*`)
/// - anything else matches the exact representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressMatcher {
    Any,
    Broadcast,
    Prefix(String),
    Exact(String),
}

impl AddressMatcher {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim();
        if pattern == "*" {
            AddressMatcher::Any
        } else if pattern == BROADCAST_REPR {
            AddressMatcher::Broadcast
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            AddressMatcher::Prefix(prefix.to_string())
        } else {
            AddressMatcher::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, address: &Address) -> bool {
        match self {
            AddressMatcher::Any => true,
            AddressMatcher::Broadcast => address.is_broadcast(),
            AddressMatcher::Prefix(prefix) => address.to_string().starts_with(prefix.as_str()),
            AddressMatcher::Exact(exact) => address.to_string() == *exact,
        }
    }

    /// True when any matcher in `matchers` accepts `address`.
    pub fn any_matches(matchers: &[AddressMatcher], address: &Address) -> bool {
        matchers.iter().any(|m| m.matches(address))
    }
}
