use ng_devhub_error::{HubError, HubResult};
use ng_devhub_models::{
    address::Address,
    message::{names, ControlEvent, MessageBody, PlatformMessage, ProtocolMessage, ProtocolPayload},
    services::{MessageBus, PopulationResolver},
    settings::Settings,
};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub const ATTR_PROTOCOL_ADDRESS: &str = "protocolAddress";

/// Re-discovery of devices one side reports and the other does not know.
pub struct LostDeviceRecovery {
    settings: Settings,
    protocol_bus: Arc<dyn MessageBus<ProtocolMessage>>,
    platform_bus: Arc<dyn MessageBus<PlatformMessage>>,
    population: Arc<dyn PopulationResolver>,
}

impl LostDeviceRecovery {
    pub fn new(
        settings: Settings,
        protocol_bus: Arc<dyn MessageBus<ProtocolMessage>>,
        platform_bus: Arc<dyn MessageBus<PlatformMessage>>,
        population: Arc<dyn PopulationResolver>,
    ) -> Self {
        Self {
            settings,
            protocol_bus,
            platform_bus,
            population,
        }
    }

    #[inline]
    pub async fn population_of(&self, place_id: Option<Uuid>) -> String {
        self.population.get_population_by_place_id(place_id).await
    }

    /// Handles traffic from an address with no device record.
    ///
    /// Hub devices get a device-info request sent to their hub so the hub can
    /// re-pair them; devices talking to the platform directly are told they are
    /// not found.
    pub async fn try_restore(&self, address: &Address, place_id: Option<Uuid>) -> HubResult<()> {
        if !self.settings.service.restore_lost_devices {
            debug!(device = %address, "Ignoring unrecognized device, restore_lost_devices is disabled");
            return Ok(());
        }
        if address.is_hub_address() {
            return self.send_get_device_info(address, place_id).await;
        }

        let population = self.population_of(place_id).await;
        let error = HubError::not_found(address);
        let message = ProtocolMessage::new(
            Address::device_service(),
            address.clone(),
            ProtocolPayload::Control(ControlEvent::Error {
                code: error.code().to_string(),
                message: error.to_string(),
            }),
        )
        .with_place(place_id, Some(population));
        self.protocol_bus.send(message).await
    }

    /// Asks the owning hub to describe the device at `address`.
    pub async fn send_get_device_info(
        &self,
        address: &Address,
        place_id: Option<Uuid>,
    ) -> HubResult<()> {
        let Some(hub_id) = address.hub_id() else {
            warn!(device = %address, "Cannot request device info for a non-hub device");
            return Err(HubError::UnsupportedAddress(address.to_string()));
        };
        let population = self.population_of(place_id).await;
        let body = MessageBody::new(names::GET_DEVICE_INFO)
            .with(ATTR_PROTOCOL_ADDRESS, address.to_string());
        let message =
            PlatformMessage::request(Address::device_service(), Address::hub_service(hub_id), body)
                .with_place(place_id, Some(population));
        self.platform_bus.send(message).await
    }

    /// Tells the device's driver that its hub no longer knows it.
    pub async fn send_lost_device(&self, address: &Address, place_id: Option<Uuid>) -> HubResult<()> {
        let population = self.population_of(place_id).await;
        let message = PlatformMessage::request(
            Address::device_service(),
            address.clone(),
            MessageBody::new(names::LOST_DEVICE),
        )
        .with_place(place_id, Some(population));
        self.platform_bus.send(message).await
    }
}
