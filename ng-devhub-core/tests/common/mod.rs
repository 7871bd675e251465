#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use ng_devhub_common::{population::InMemoryPopulationResolver, scheduler::TokioScheduler};
use ng_devhub_core::{
    context::{ContextServices, DeviceDriverContext},
    driver::{DeviceDriver, DriverRegistry},
    reconcile::ReconciliationEngine,
    recovery::LostDeviceRecovery,
    registry::ExecutorRegistry,
    router::MessageRouter,
    service::DeviceServiceHandler,
};
use ng_devhub_error::{HubError, HubResult};
use ng_devhub_models::{
    address::{AddressMatcher, ProtocolAddress},
    attributes::AttributeMap,
    dao::{DeviceDao, DriverState},
    device::{Device, DriverId, Version},
    driver::{CapabilityDefinition, DriverDefinition, ReflexDefinition, ReflexRunMode},
    event::DriverEvent,
    message::{BusMessage, PlatformMessage, ProtocolMessage},
    services::MessageBus,
    settings::{Inner, Settings},
};
use serde_json::{json, Value};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

pub const HUB_ID: &str = "ABC-1234";
pub const PLACE_ID: Uuid = Uuid::from_u128(0x5eed_0000_0000_4000_8000_0000_0000_0001);

/// Awaits `future`, failing the test instead of hanging.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// Polls `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

// === Device store ===

#[derive(Default)]
pub struct InMemoryDeviceDao {
    devices: DashMap<Uuid, Device>,
    states: DashMap<Uuid, DriverState>,
    deleted: Mutex<Vec<Uuid>>,
    pub protocol_lookups: AtomicUsize,
}

impl InMemoryDeviceDao {
    pub fn insert(&self, device: Device, state: DriverState) {
        self.states.insert(device.id, state);
        self.devices.insert(device.id, device);
    }

    pub fn device(&self, id: Uuid) -> Option<Device> {
        self.devices.get(&id).map(|d| d.value().clone())
    }

    pub fn state(&self, id: Uuid) -> DriverState {
        self.states
            .get(&id)
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }

    pub fn deleted(&self) -> Vec<Uuid> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceDao for InMemoryDeviceDao {
    async fn find_by_id(&self, id: Uuid) -> HubResult<Option<Device>> {
        Ok(self.device(id))
    }

    async fn find_by_protocol_address(
        &self,
        address: &ProtocolAddress,
    ) -> HubResult<Option<Device>> {
        self.protocol_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .devices
            .iter()
            .find(|d| d.protocol_address.as_ref() == Some(address))
            .map(|d| d.value().clone()))
    }

    async fn list_devices_by_place(&self, place_id: Uuid) -> HubResult<Vec<Device>> {
        Ok(self
            .devices
            .iter()
            .filter(|d| d.place_id == Some(place_id))
            .map(|d| d.value().clone())
            .collect())
    }

    async fn list_devices_by_hub(&self, hub_id: &str) -> HubResult<Vec<Device>> {
        Ok(self
            .devices
            .iter()
            .filter(|d| d.hub_id() == Some(hub_id))
            .map(|d| d.value().clone())
            .collect())
    }

    async fn load_driver_state(&self, device: &Device) -> HubResult<DriverState> {
        Ok(self.state(device.id))
    }

    async fn update_driver_state(&self, device: &Device, state: DriverState) -> HubResult<()> {
        let mut current = self.states.entry(device.id).or_default();
        for (key, value) in state.attributes {
            if value.is_null() {
                current.attributes.remove(&key);
            } else {
                current.attributes.insert(key, value);
            }
        }
        if !state.variables.is_empty() {
            current.variables = state.variables;
        }
        Ok(())
    }

    async fn save(&self, device: &Device) -> HubResult<()> {
        self.devices.insert(device.id, device.clone());
        Ok(())
    }

    async fn delete(&self, device: &Device) -> HubResult<()> {
        self.devices.remove(&device.id);
        self.states.remove(&device.id);
        self.deleted.lock().unwrap().push(device.id);
        Ok(())
    }

    async fn tombstone(&self, device: &Device) -> HubResult<()> {
        if let Some(mut stored) = self.devices.get_mut(&device.id) {
            stored.tombstoned = true;
        }
        Ok(())
    }
}

// === Drivers ===

pub fn definition(name: &str, major: u32, hub_local: bool) -> DriverDefinition {
    DriverDefinition::new(
        name,
        Version::new(major, 0),
        None,
        vec![
            CapabilityDefinition::new("base", &[]),
            CapabilityDefinition::new("dev", &[]),
            CapabilityDefinition::new("swit", &["swit:state"]),
        ],
        AttributeMap::from([
            ("dev:productId".to_string(), json!(format!("{name}-product"))),
            ("swit:state".to_string(), json!("OFF")),
        ]),
        ReflexDefinition {
            mode: if hub_local {
                ReflexRunMode::Hub
            } else {
                ReflexRunMode::Platform
            },
            reflexes: if hub_local {
                vec![json!({ "match": "swit:state" })]
            } else {
                vec![]
            },
            dfa: None,
        },
    )
}

/// Driver that records every event it handles.
pub struct RecordingDriver {
    definition: DriverDefinition,
    events: Mutex<Vec<DriverEvent>>,
    entered: AtomicUsize,
    blocking: AtomicBool,
    gate: Semaphore,
    fail_on: Option<&'static str>,
}

impl RecordingDriver {
    pub fn new(definition: DriverDefinition) -> Arc<Self> {
        Arc::new(Self::build(definition, false, None))
    }

    /// Each event waits for a [`release`](Self::release) permit before completing.
    pub fn blocking(definition: DriverDefinition) -> Arc<Self> {
        Arc::new(Self::build(definition, true, None))
    }

    /// Fails every event named `event`.
    pub fn failing_on(definition: DriverDefinition, event: &'static str) -> Arc<Self> {
        Arc::new(Self::build(definition, false, Some(event)))
    }

    fn build(definition: DriverDefinition, blocking: bool, fail_on: Option<&'static str>) -> Self {
        Self {
            definition,
            events: Mutex::new(Vec::new()),
            entered: AtomicUsize::new(0),
            blocking: AtomicBool::new(blocking),
            gate: Semaphore::new(0),
            fail_on,
        }
    }

    pub fn driver_id(&self) -> DriverId {
        self.definition.driver_id()
    }

    pub fn definition_ref(&self) -> &DriverDefinition {
        &self.definition
    }

    pub fn release(&self, permits: usize) {
        self.gate.add_permits(permits);
    }

    pub fn unblock(&self) {
        self.blocking.store(false, Ordering::SeqCst);
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<DriverEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_names(&self) -> Vec<&'static str> {
        self.events().iter().map(DriverEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.event_names().iter().filter(|n| **n == name).count()
    }
}

#[async_trait]
impl DeviceDriver for RecordingDriver {
    fn definition(&self) -> &DriverDefinition {
        &self.definition
    }

    async fn handle(
        &self,
        _context: &mut DeviceDriverContext,
        event: &DriverEvent,
    ) -> HubResult<()> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        if self.blocking.load(Ordering::SeqCst) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }
        self.events.lock().unwrap().push(event.clone());
        if self.fail_on == Some(event.name()) {
            return Err(HubError::Msg(format!("driver rejected {}", event.name())));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDriverRegistry {
    drivers: DashMap<DriverId, Arc<dyn DeviceDriver>>,
    fallback: Mutex<Option<Arc<dyn DeviceDriver>>>,
    pub loads: AtomicUsize,
}

impl FakeDriverRegistry {
    pub fn register(&self, driver: Arc<dyn DeviceDriver>) {
        self.drivers
            .insert(driver.definition().driver_id(), driver);
    }

    pub fn set_fallback(&self, driver: Arc<dyn DeviceDriver>) {
        *self.fallback.lock().unwrap() = Some(driver);
    }
}

#[async_trait]
impl DriverRegistry for FakeDriverRegistry {
    async fn load_driver_by_id(&self, id: &DriverId) -> HubResult<Option<Arc<dyn DeviceDriver>>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.drivers.get(id).map(|d| Arc::clone(d.value())))
    }

    fn fallback(&self) -> Option<Arc<dyn DeviceDriver>> {
        self.fallback.lock().unwrap().clone()
    }
}

// === Buses ===

/// Bus that keeps every sent message and forwards to matching subscribers.
pub struct RecordingBus<M: BusMessage> {
    sent: Mutex<Vec<M>>,
    subscribers: Mutex<Vec<(Vec<AddressMatcher>, mpsc::Sender<M>)>>,
}

impl<M: BusMessage> Default for RecordingBus<M> {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<M: BusMessage> RecordingBus<M> {
    pub fn sent(&self) -> Vec<M> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl RecordingBus<PlatformMessage> {
    pub fn of_type(&self, message_type: &str) -> Vec<PlatformMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.message_type() == message_type)
            .collect()
    }
}

#[async_trait]
impl<M: BusMessage> MessageBus<M> for RecordingBus<M> {
    async fn send(&self, message: M) -> HubResult<()> {
        self.sent.lock().unwrap().push(message.clone());
        for (matchers, tx) in self.subscribers.lock().unwrap().iter() {
            if AddressMatcher::any_matches(matchers, &message.header().destination) {
                let _ = tx.try_send(message.clone());
            }
        }
        Ok(())
    }

    fn subscribe(&self, matchers: Vec<AddressMatcher>) -> HubResult<mpsc::Receiver<M>> {
        let (tx, rx) = mpsc::channel(256);
        self.subscribers.lock().unwrap().push((matchers, tx));
        Ok(rx)
    }
}

// === Wiring ===

pub struct Harness {
    pub settings: Settings,
    pub dao: Arc<InMemoryDeviceDao>,
    pub drivers: Arc<FakeDriverRegistry>,
    pub protocol_bus: Arc<RecordingBus<ProtocolMessage>>,
    pub platform_bus: Arc<RecordingBus<PlatformMessage>>,
    pub population: Arc<InMemoryPopulationResolver>,
    pub scheduler: Arc<TokioScheduler>,
    pub registry: Arc<ExecutorRegistry>,
    pub recovery: Arc<LostDeviceRecovery>,
    pub engine: Arc<ReconciliationEngine>,
    pub service: Arc<DeviceServiceHandler>,
    pub router: Arc<MessageRouter>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(Inner::default())
    }

    pub fn with_settings(inner: Inner) -> Self {
        let settings = Settings::from_inner(inner);
        let dao = Arc::new(InMemoryDeviceDao::default());
        let drivers = Arc::new(FakeDriverRegistry::default());
        let protocol_bus = Arc::new(RecordingBus::<ProtocolMessage>::default());
        let platform_bus = Arc::new(RecordingBus::<PlatformMessage>::default());
        let population = Arc::new(InMemoryPopulationResolver::default());
        let scheduler = Arc::new(TokioScheduler::default());

        let services = ContextServices {
            dao: dao.clone(),
            platform_bus: platform_bus.clone(),
            population: population.clone(),
        };
        let registry = Arc::new(ExecutorRegistry::new(
            settings.clone(),
            drivers.clone(),
            scheduler.clone(),
            services,
        ));
        let recovery = Arc::new(LostDeviceRecovery::new(
            settings.clone(),
            protocol_bus.clone(),
            platform_bus.clone(),
            population.clone(),
        ));
        let engine = Arc::new(ReconciliationEngine::new(
            settings.clone(),
            Arc::clone(&registry),
            drivers.clone(),
            Arc::clone(&recovery),
            platform_bus.clone(),
        ));
        let service = Arc::new(DeviceServiceHandler::new(
            settings.clone(),
            dao.clone(),
            Arc::clone(&registry),
            Arc::clone(&engine),
            Arc::clone(&recovery),
        ));
        let router = Arc::new(MessageRouter::new(
            settings.clone(),
            Arc::clone(&registry),
            Arc::clone(&service),
            Arc::clone(&recovery),
            protocol_bus.clone(),
            platform_bus.clone(),
        ));

        Self {
            settings,
            dao,
            drivers,
            protocol_bus,
            platform_bus,
            population,
            scheduler,
            registry,
            recovery,
            engine,
            service,
            router,
        }
    }

    pub fn services(&self) -> ContextServices {
        ContextServices {
            dao: self.dao.clone(),
            platform_bus: self.platform_bus.clone(),
            population: self.population.clone(),
        }
    }

    /// Registers `driver` and stores a hub device bound to it.
    pub fn add_hub_device(&self, driver: &Arc<RecordingDriver>, protocol: &str, id: &str) -> Device {
        self.add_hub_device_with(driver, protocol, id, AttributeMap::new())
    }

    pub fn add_hub_device_with(
        &self,
        driver: &Arc<RecordingDriver>,
        protocol: &str,
        id: &str,
        attributes: AttributeMap,
    ) -> Device {
        self.drivers.register(driver.clone());
        let mut device = Device::new(
            Uuid::new_v4(),
            ProtocolAddress::new(Some(HUB_ID.to_string()), protocol, id),
            driver.driver_id(),
        );
        device.place_id = Some(PLACE_ID);
        self.dao.insert(
            device.clone(),
            DriverState {
                attributes,
                ..Default::default()
            },
        );
        device
    }
}

pub fn online_state() -> AttributeMap {
    AttributeMap::from([("devconn:state".to_string(), Value::from("ONLINE"))])
}
