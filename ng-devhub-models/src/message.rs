//! Messages carried on the protocol and platform buses.

use crate::address::Address;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Well-known message type names.
pub mod names {
    pub const EMPTY_MESSAGE: &str = "EmptyMessage";
    pub const ERROR: &str = "Error";

    pub const SET_ATTRIBUTES: &str = "base:SetAttributes";
    pub const VALUE_CHANGE: &str = "base:ValueChange";
    pub const DELETED: &str = "base:Deleted";

    pub const SYNC_DEVICES: &str = "devsvc:SyncDevices";
    pub const SYNC_DEVICES_RESPONSE: &str = "devsvc:SyncDevicesResponse";
    pub const LEGACY_SYNC_DEVICES: &str = "device:SyncDevices";
    pub const LEGACY_SYNC_DEVICES_RESPONSE: &str = "device:SyncDevicesResponse";
    pub const DEVICES_DEGRADED: &str = "devsvc:DevicesDegraded";

    pub const REMOVED_DEVICE: &str = "devadv:RemovedDevice";
    pub const FORCE_REMOVE: &str = "dev:ForceRemove";
    pub const LOST_DEVICE: &str = "devconn:LostDevice";
    pub const GET_DEVICE_INFO: &str = "hubadv:GetDeviceInfo";

    /// Legacy marker on a `DeviceOnline` control event for a re-paired device.
    pub const LEGACY_PAIRED: &str = "PAIRED";
    /// Legacy marker on a `DeviceOffline` control event for an unpaired device.
    pub const LEGACY_UNPAIRED: &str = "UNPAIRED";

    pub const ATTR_CODE: &str = "code";
    pub const ATTR_MESSAGE: &str = "message";
}

/// Typed JSON payload of a platform message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageBody {
    pub message_type: String,
    pub attributes: Map<String, Value>,
}

impl MessageBody {
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            attributes: Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn empty() -> Self {
        Self::new(names::EMPTY_MESSAGE)
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(names::ERROR)
            .with(names::ATTR_CODE, code.into())
            .with(names::ATTR_MESSAGE, message.into())
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.message_type == names::ERROR
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    #[inline]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }
}

/// Header shared by every bus message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageHeader {
    pub source: Address,
    pub destination: Address,
    pub place_id: Option<Uuid>,
    pub population: Option<String>,
    pub actor: Option<String>,
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Milliseconds after `timestamp` past which the message is dropped unprocessed.
    pub time_to_live_ms: Option<i64>,
    pub reflex_version: Option<u32>,
    pub is_request: bool,
}

impl MessageHeader {
    pub fn new(source: Address, destination: Address) -> Self {
        Self {
            source,
            destination,
            place_id: None,
            population: None,
            actor: None,
            correlation_id: None,
            timestamp: Utc::now(),
            time_to_live_ms: None,
            reflex_version: None,
            is_request: false,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.time_to_live_ms {
            Some(ttl) if ttl > 0 => self.timestamp + Duration::milliseconds(ttl) < now,
            _ => false,
        }
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Protocol-level control events.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    DeviceOnline { message: Option<String> },
    DeviceOffline { message: Option<String> },
    Error { code: String, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolPayload {
    Control(ControlEvent),
    /// Event emitted by a reflex that already ran on the hub.
    Reflex(MessageBody),
    Raw { protocol: String, payload: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolMessage {
    pub header: MessageHeader,
    pub payload: ProtocolPayload,
}

impl ProtocolMessage {
    pub fn new(source: Address, destination: Address, payload: ProtocolPayload) -> Self {
        Self {
            header: MessageHeader::new(source, destination),
            payload,
        }
    }

    pub fn with_place(mut self, place_id: Option<Uuid>, population: Option<String>) -> Self {
        self.header.place_id = place_id;
        self.header.population = population;
        self
    }

    pub fn with_reflex_version(mut self, version: Option<u32>) -> Self {
        self.header.reflex_version = version;
        self
    }

    #[inline]
    pub fn control(&self) -> Option<&ControlEvent> {
        match &self.payload {
            ProtocolPayload::Control(c) => Some(c),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlatformMessage {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl PlatformMessage {
    pub fn broadcast(source: Address, body: MessageBody) -> Self {
        Self {
            header: MessageHeader::new(source, Address::Broadcast),
            body,
        }
    }

    pub fn request(source: Address, destination: Address, body: MessageBody) -> Self {
        let mut header = MessageHeader::new(source, destination);
        header.is_request = true;
        header.correlation_id = Some(Uuid::new_v4().to_string());
        Self { header, body }
    }

    pub fn with_place(mut self, place_id: Option<Uuid>, population: Option<String>) -> Self {
        self.header.place_id = place_id;
        self.header.population = population;
        self
    }

    pub fn with_actor(mut self, actor: Option<String>) -> Self {
        self.header.actor = actor;
        self
    }

    /// Response to this message, addressed back to its source.
    pub fn respond(&self, body: MessageBody) -> PlatformMessage {
        let mut header = MessageHeader::new(
            self.header.destination.clone(),
            self.header.source.clone(),
        );
        header.place_id = self.header.place_id;
        header.population = self.header.population.clone();
        header.correlation_id = self.header.correlation_id.clone();
        PlatformMessage { header, body }
    }

    #[inline]
    pub fn message_type(&self) -> &str {
        &self.body.message_type
    }
}

/// Anything that travels on a bus and can be routed by destination.
pub trait BusMessage: Clone + Send + Sync + 'static {
    fn header(&self) -> &MessageHeader;
}

impl BusMessage for ProtocolMessage {
    fn header(&self) -> &MessageHeader {
        &self.header
    }
}

impl BusMessage for PlatformMessage {
    fn header(&self) -> &MessageHeader {
        &self.header
    }
}

/// A message delivered into a driver executor.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Protocol(ProtocolMessage),
    Platform(PlatformMessage),
}

impl Message {
    pub fn header(&self) -> &MessageHeader {
        match self {
            Message::Protocol(m) => &m.header,
            Message::Platform(m) => &m.header,
        }
    }
}

impl From<ProtocolMessage> for Message {
    fn from(value: ProtocolMessage) -> Self {
        Message::Protocol(value)
    }
}

impl From<PlatformMessage> for Message {
    fn from(value: PlatformMessage) -> Self {
        Message::Platform(value)
    }
}
