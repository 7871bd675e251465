use crate::{attributes::AttributeMap, device::DriverId, message::Message};

/// Everything a driver executor can be asked to process.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    Message(Message),
    /// Attribute values reported by the hub, already filtered to the driver's supported set.
    AttributesUpdated {
        attributes: AttributeMap,
        reflex_version: Option<u32>,
        is_device_message: bool,
    },
    DriverStarted,
    /// Terminal event; the executor worker exits once it has been processed.
    DriverStopped,
    /// The device was bound to this driver, optionally replacing `previous`.
    Associated { previous: Option<DriverId> },
    Disassociated,
}

impl DriverEvent {
    /// Lifecycle events are still accepted while an executor is shutting down.
    #[inline]
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, DriverEvent::DriverStopped | DriverEvent::Disassociated)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DriverEvent::Message(_) => "Message",
            DriverEvent::AttributesUpdated { .. } => "AttributesUpdated",
            DriverEvent::DriverStarted => "DriverStarted",
            DriverEvent::DriverStopped => "DriverStopped",
            DriverEvent::Associated { .. } => "Associated",
            DriverEvent::Disassociated => "Disassociated",
        }
    }
}
