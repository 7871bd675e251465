use crate::context::DeviceDriverContext;
use async_trait::async_trait;
use ng_devhub_error::HubResult;
use ng_devhub_models::{
    device::DriverId,
    driver::DriverDefinition,
    event::DriverEvent,
};
use std::sync::Arc;

/// Device driver behavior.
///
/// The executor applies platform-level effects (connectivity, attribute
/// writes) to the context before `handle` runs, and commits the context after.
#[async_trait]
pub trait DeviceDriver: Send + Sync + 'static {
    fn definition(&self) -> &DriverDefinition;

    async fn handle(&self, context: &mut DeviceDriverContext, event: &DriverEvent)
        -> HubResult<()>;
}

/// Driver lookup.
#[async_trait]
pub trait DriverRegistry: Send + Sync + 'static {
    async fn load_driver_by_id(&self, id: &DriverId) -> HubResult<Option<Arc<dyn DeviceDriver>>>;

    /// Driver used when a device's own driver cannot be loaded.
    fn fallback(&self) -> Option<Arc<dyn DeviceDriver>>;
}
