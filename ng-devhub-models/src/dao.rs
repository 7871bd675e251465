use crate::{
    address::ProtocolAddress,
    attributes::{AttributeMap, VariableMap},
    device::Device,
};
use async_trait::async_trait;
use ng_devhub_error::HubResult;
use uuid::Uuid;

/// Persisted driver-owned state of one device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverState {
    pub attributes: AttributeMap,
    pub variables: VariableMap,
}

/// Device store.
#[async_trait]
pub trait DeviceDao: Send + Sync + 'static {
    async fn find_by_id(&self, id: Uuid) -> HubResult<Option<Device>>;

    async fn find_by_protocol_address(
        &self,
        address: &ProtocolAddress,
    ) -> HubResult<Option<Device>>;

    async fn list_devices_by_place(&self, place_id: Uuid) -> HubResult<Vec<Device>>;

    async fn list_devices_by_hub(&self, hub_id: &str) -> HubResult<Vec<Device>>;

    async fn load_driver_state(&self, device: &Device) -> HubResult<DriverState>;

    /// Persists changed attributes; a `null` value removes the attribute.
    async fn update_driver_state(&self, device: &Device, state: DriverState) -> HubResult<()>;

    async fn save(&self, device: &Device) -> HubResult<()>;

    async fn delete(&self, device: &Device) -> HubResult<()>;

    async fn tombstone(&self, device: &Device) -> HubResult<()>;
}
