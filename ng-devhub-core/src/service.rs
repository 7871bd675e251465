//! Handler for platform messages addressed to the device service.

use crate::{
    codec::{compress, decompress},
    reconcile::ReconciliationEngine,
    recovery::LostDeviceRecovery,
    registry::ExecutorRegistry,
};
use ng_devhub_error::{HubError, HubResult};
use ng_devhub_models::{
    address::{Address, ProtocolAddress, PLACE_SERVICE},
    dao::DeviceDao,
    device::Device,
    message::{names, MessageBody, PlatformMessage},
    settings::Settings,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

pub const ATTR_PLACE_ID: &str = "placeId";
pub const ATTR_REFLEX_VERSION: &str = "reflexVersion";
pub const ATTR_DEVICES: &str = "devices";
pub const ATTR_DRIVERS: &str = "drivers";

pub const ATTR_PROTOCOL: &str = "protocol";
pub const ATTR_PROTOCOL_ID: &str = "protocolId";
pub const ATTR_HUB_ID: &str = "hubId";
pub const ATTR_STATUS: &str = "status";

pub const STATUS_CLEAN: &str = "CLEAN";
pub const STATUS_FORCED: &str = "FORCED";
pub const STATUS_SPONTANEOUS: &str = "SPONTANEOUS";

/// Broadcast events the device service consumes in addition to its own address.
pub const HANDLED_EVENTS: [&str; 2] = [names::REMOVED_DEVICE, names::DEVICES_DEGRADED];

/// Owner whose `base:Deleted` takes its devices down with it.
#[derive(Debug, Clone, PartialEq)]
enum DeletedOwner<'a> {
    Hub(&'a str),
    Place(Uuid),
}

impl<'a> DeletedOwner<'a> {
    fn of(message: &'a PlatformMessage) -> Option<Self> {
        let Address::Service(service) = &message.header.source else {
            return None;
        };
        match service.hub_id() {
            Some(hub_id) => Some(DeletedOwner::Hub(hub_id)),
            None if service.service() == PLACE_SERVICE => {
                message.header.place_id.map(DeletedOwner::Place)
            }
            None => None,
        }
    }
}

pub struct DeviceServiceHandler {
    settings: Settings,
    dao: Arc<dyn DeviceDao>,
    registry: Arc<ExecutorRegistry>,
    engine: Arc<ReconciliationEngine>,
    recovery: Arc<LostDeviceRecovery>,
}

impl DeviceServiceHandler {
    pub fn new(
        settings: Settings,
        dao: Arc<dyn DeviceDao>,
        registry: Arc<ExecutorRegistry>,
        engine: Arc<ReconciliationEngine>,
        recovery: Arc<LostDeviceRecovery>,
    ) -> Self {
        Self {
            settings,
            dao,
            registry,
            engine,
            recovery,
        }
    }

    /// True when `message` is addressed to this service.
    pub fn handles(&self, message: &PlatformMessage) -> bool {
        let destination = &message.header.destination;
        if *destination == Address::device_service() {
            return true;
        }
        if !destination.is_broadcast() {
            return false;
        }
        match message.message_type() {
            names::DELETED => DeletedOwner::of(message).is_some(),
            other => HANDLED_EVENTS.contains(&other),
        }
    }

    /// Handles one message; returns the response body for requests.
    pub async fn handle(&self, message: &PlatformMessage) -> HubResult<Option<MessageBody>> {
        trace!(message_type = message.message_type(), "Device service message");
        match message.message_type() {
            names::SYNC_DEVICES => self.sync_devices(message).await.map(Some),
            names::LEGACY_SYNC_DEVICES => {
                let mut response = self.sync_devices(message).await?;
                if response.message_type == names::SYNC_DEVICES_RESPONSE {
                    response.message_type = names::LEGACY_SYNC_DEVICES_RESPONSE.to_string();
                }
                Ok(Some(response))
            }
            names::DEVICES_DEGRADED => {
                self.sync_degraded_devices(message).await?;
                Ok(message.header.is_request.then(MessageBody::empty))
            }
            names::REMOVED_DEVICE => {
                self.removed_device(&message.body).await?;
                Ok(message.header.is_request.then(MessageBody::empty))
            }
            names::DELETED => {
                if let Some(owner) = DeletedOwner::of(message) {
                    self.owner_deleted(owner).await?;
                }
                Ok(None)
            }
            other if message.header.is_request => Err(HubError::InvalidState(format!(
                "unsupported request type [{other}]"
            ))),
            other => {
                debug!(message_type = other, "Ignoring unsupported device service event");
                Ok(None)
            }
        }
    }

    /// Place and hub of a sync-style request, checked against the message header.
    fn sync_scope(&self, message: &PlatformMessage) -> HubResult<(Uuid, String)> {
        let place_id = message
            .body
            .get_str(ATTR_PLACE_ID)
            .and_then(|p| Uuid::parse_str(p).ok())
            .ok_or_else(|| HubError::MalformedReport("missing or invalid placeId".into()))?;
        if message.header.place_id.is_some_and(|p| p != place_id) {
            return Err(HubError::InvalidState(format!(
                "request place does not match header place for [{place_id}]"
            )));
        }
        let hub_id = message
            .header
            .source
            .hub_id()
            .ok_or_else(|| {
                HubError::InvalidState(format!(
                    "sync request from non-hub source [{}]",
                    message.header.source
                ))
            })?
            .to_string();
        Ok((place_id, hub_id))
    }

    async fn place_devices(&self, place_id: Uuid) -> HubResult<Vec<Device>> {
        self.dao.list_devices_by_place(place_id).await
    }

    fn reported_records(body: &MessageBody) -> HubResult<Vec<Value>> {
        let encoded = body
            .get_str(ATTR_DEVICES)
            .ok_or_else(|| HubError::MalformedReport("missing devices payload".into()))?;
        decompress(encoded)
    }

    #[instrument(name = "devsvc-sync", skip_all)]
    async fn sync_devices(&self, message: &PlatformMessage) -> HubResult<MessageBody> {
        let (place_id, hub_id) = self.sync_scope(message)?;
        let reflex_version = message
            .body
            .get(ATTR_REFLEX_VERSION)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok());
        let reported = Self::reported_records(&message.body)?;
        let devices = self.place_devices(place_id).await?;

        let outcome = self
            .engine
            .sync_devices(&hub_id, place_id, reflex_version, &devices, &reported)
            .await;

        let devices = compress(&outcome.device_states)?;
        let drivers = compress(&outcome.driver_reflexes)?;
        let size = devices.len() + drivers.len();
        if size > self.settings.service.sync_size_warning {
            warn!(
                size,
                hub = %hub_id,
                "Sync device response contains a large amount of device state and driver reflexes"
            );
        }
        Ok(MessageBody::new(names::SYNC_DEVICES_RESPONSE)
            .with(ATTR_DEVICES, devices)
            .with(ATTR_DRIVERS, drivers))
    }

    async fn sync_degraded_devices(&self, message: &PlatformMessage) -> HubResult<()> {
        let (place_id, hub_id) = self.sync_scope(message)?;
        let reported = Self::reported_records(&message.body)?;
        let devices = self.place_devices(place_id).await?;
        let updated = self
            .engine
            .sync_degraded_devices(&hub_id, place_id, &devices, &reported)
            .await;
        debug!(hub = %hub_id, updated = updated.len(), "Synced degraded devices");
        Ok(())
    }

    /// Deletes every device of a deleted hub, or the directly connected
    /// devices of a deleted place. Hub devices of a place go with their hub.
    #[instrument(name = "devsvc-owner-deleted", skip_all, fields(owner = ?owner))]
    async fn owner_deleted(&self, owner: DeletedOwner<'_>) -> HubResult<()> {
        let devices = match owner {
            DeletedOwner::Hub(hub_id) => self.dao.list_devices_by_hub(hub_id).await?,
            DeletedOwner::Place(place_id) => self
                .dao
                .list_devices_by_place(place_id)
                .await?
                .into_iter()
                .filter(|d| d.hub_id().is_none())
                .collect(),
        };
        info!(devices = devices.len(), "Owner deleted, deleting its devices");
        for device in devices {
            let address = Address::Driver(device.address());
            if let Err(e) = self.registry.delete(&address).await {
                warn!(device = %address, error = %e, "Unable to delete device");
            }
        }
        Ok(())
    }

    /// A hub reports that a device left its network.
    async fn removed_device(&self, body: &MessageBody) -> HubResult<()> {
        let protocol = body
            .get_str(ATTR_PROTOCOL)
            .ok_or_else(|| HubError::MalformedReport("missing protocol".into()))?;
        let protocol_id = body
            .get_str(ATTR_PROTOCOL_ID)
            .ok_or_else(|| HubError::MalformedReport("missing protocolId".into()))?;
        let hub_id = body.get_str(ATTR_HUB_ID).map(str::to_string);
        let address = ProtocolAddress::new(hub_id, protocol, protocol_id);

        let Some(device) = self.dao.find_by_protocol_address(&address).await? else {
            debug!(device = %address, "Received remove for unrecognized device");
            return Ok(());
        };
        let driver_address = Address::Driver(device.address());

        if device.tombstoned {
            debug!(device = %address, "Received remove for tombstoned device, removing tombstone");
            self.registry.delete(&driver_address).await?;
            return Ok(());
        }

        match body.get_str(ATTR_STATUS) {
            None => {
                warn!(device = %address, "Received device removed with no status, assuming clean removal");
                self.registry.delete(&driver_address).await?;
            }
            Some(status @ (STATUS_CLEAN | STATUS_FORCED)) => {
                info!(device = %address, status, "Device removed, deleting");
                self.registry.delete(&driver_address).await?;
            }
            Some(status) => {
                info!(device = %address, status, "Device removed, marking as lost");
                self.recovery
                    .send_lost_device(&driver_address, device.place_id)
                    .await?;
            }
        }
        Ok(())
    }
}
