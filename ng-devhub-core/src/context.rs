//! Per-device driver context: the in-memory device state an executor works on.

use ng_devhub_models::{
    address::{Address, DriverAddress, ProtocolAddress},
    attributes::{
        is_core_namespace, namespace_of, AttributeMap, VariableMap, ATTR_CAPS,
        ATTR_CONNECTION_STATE, ATTR_DEGRADED_CODE, ATTR_DRIVER_NAME, ATTR_DRIVER_VERSION,
        ATTR_HUB_LOCAL, ATTR_PRODUCT_ID, CONNECTION_OFFLINE, CONNECTION_ONLINE,
    },
    dao::{DeviceDao, DriverState},
    device::{DegradedCode, Device, DriverId},
    driver::DriverDefinition,
    event::DriverEvent,
    message::{names, ControlEvent, Message, MessageBody, PlatformMessage},
    services::{MessageBus, PopulationResolver},
};
use ng_devhub_error::HubResult;
use serde_json::Value;
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Shared collaborators every context writes through.
#[derive(Clone)]
pub struct ContextServices {
    pub dao: Arc<dyn DeviceDao>,
    pub platform_bus: Arc<dyn MessageBus<PlatformMessage>>,
    pub population: Arc<dyn PopulationResolver>,
}

pub struct DeviceDriverContext {
    device: Device,
    driver_id: DriverId,
    supported: Arc<BTreeSet<String>>,
    attributes: AttributeMap,
    variables: VariableMap,
    dirty_attributes: BTreeSet<String>,
    dirty_variables: bool,
    device_dirty: bool,
    connected: bool,
    deleted: bool,
    tearing_down: bool,
    outbox: Vec<MessageBody>,
    services: ContextServices,
}

impl DeviceDriverContext {
    /// Context for a device loaded from the store.
    pub fn new(
        device: Device,
        definition: &DriverDefinition,
        state: DriverState,
        services: ContextServices,
    ) -> Self {
        let connected = state
            .attributes
            .get(ATTR_CONNECTION_STATE)
            .and_then(Value::as_str)
            == Some(CONNECTION_ONLINE);
        let mut context = Self {
            device,
            driver_id: definition.driver_id(),
            supported: Arc::new(definition.supported_attributes()),
            attributes: state.attributes,
            variables: state.variables,
            dirty_attributes: BTreeSet::new(),
            dirty_variables: false,
            device_dirty: false,
            connected,
            deleted: false,
            tearing_down: false,
            outbox: Vec::new(),
            services,
        };
        context.stamp_driver(definition);
        context
    }

    /// Context for a device being bound to `definition`, carrying over
    /// `previous` state from the driver it replaces (empty for a new device).
    pub fn migrated(
        device: Device,
        definition: &DriverDefinition,
        previous: DriverState,
        services: ContextServices,
    ) -> Self {
        let migrated = migrate_attributes(&previous.attributes, definition);
        let mut context = Self::new(device, definition, previous, services);
        context.replace_attributes(migrated);
        context.stamp_driver(definition);
        context
    }

    fn stamp_driver(&mut self, definition: &DriverDefinition) {
        self.set_attribute(ATTR_DRIVER_NAME, Value::from(definition.name.clone()));
        self.set_attribute(
            ATTR_DRIVER_VERSION,
            Value::from(definition.version.to_string()),
        );
    }

    // === Identity ===

    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    #[inline]
    pub fn driver_address(&self) -> DriverAddress {
        self.device.address()
    }

    #[inline]
    pub fn protocol_address(&self) -> Option<&ProtocolAddress> {
        self.device.protocol_address.as_ref()
    }

    #[inline]
    pub fn place_id(&self) -> Option<Uuid> {
        self.device.place_id
    }

    #[inline]
    pub fn driver_id(&self) -> &DriverId {
        &self.driver_id
    }

    #[inline]
    pub fn is_tombstoned(&self) -> bool {
        self.device.tombstoned
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Set once a delete or tombstone has started; reconciliation leaves the device alone.
    #[inline]
    pub fn is_tearing_down(&self) -> bool {
        self.tearing_down
    }

    pub(crate) fn mark_tearing_down(&mut self) {
        self.tearing_down = true;
    }

    #[inline]
    pub fn supported_attributes(&self) -> Arc<BTreeSet<String>> {
        Arc::clone(&self.supported)
    }

    // === Connectivity ===

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
        let state = if connected {
            CONNECTION_ONLINE
        } else {
            CONNECTION_OFFLINE
        };
        self.set_attribute(ATTR_CONNECTION_STATE, Value::from(state));
    }

    // === Attributes ===

    #[inline]
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    #[inline]
    pub fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    /// Writes a supported attribute; returns whether the stored value changed.
    pub fn set_attribute(&mut self, key: &str, value: Value) -> bool {
        if !self.supported.contains(key) {
            debug!(device = %self.driver_address(), key, "Ignoring unsupported attribute");
            return false;
        }
        if self.attributes.get(key) == Some(&value) {
            return false;
        }
        if key == ATTR_DEGRADED_CODE {
            if let Some(code) = value.as_str() {
                self.device.degraded_code = DegradedCode::from(code.to_string());
                self.device_dirty = true;
            }
        }
        self.attributes.insert(key.to_string(), value);
        self.dirty_attributes.insert(key.to_string());
        true
    }

    pub fn remove_attribute(&mut self, key: &str) -> Option<Value> {
        let removed = self.attributes.remove(key);
        if removed.is_some() {
            self.dirty_attributes.insert(key.to_string());
        }
        removed
    }

    /// Replaces the attribute set wholesale, marking every difference dirty.
    fn replace_attributes(&mut self, attributes: AttributeMap) {
        for key in self.attributes.keys() {
            if !attributes.contains_key(key) {
                self.dirty_attributes.insert(key.clone());
            }
        }
        for (key, value) in &attributes {
            if self.attributes.get(key) != Some(value) {
                self.dirty_attributes.insert(key.clone());
            }
        }
        self.attributes = attributes;
    }

    // === Variables ===

    #[inline]
    pub fn variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn set_variable(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
        self.dirty_variables = true;
    }

    /// Snapshot of attributes and variables, used to carry state across a driver upgrade.
    pub fn driver_state(&self) -> DriverState {
        DriverState {
            attributes: self.attributes.clone(),
            variables: self.variables.clone(),
        }
    }

    // === Outbound ===

    /// Queues an event to broadcast from this device once the current event commits.
    pub fn emit(&mut self, body: MessageBody) {
        self.outbox.push(body);
    }

    /// Applies the platform-level effect of `event` before the driver sees it.
    pub(crate) fn apply_builtin(&mut self, event: &DriverEvent) {
        match event {
            DriverEvent::Message(Message::Protocol(message)) => match message.control() {
                Some(ControlEvent::DeviceOnline { .. }) => self.set_connected(true),
                Some(ControlEvent::DeviceOffline { .. }) => self.set_connected(false),
                _ => {}
            },
            DriverEvent::Message(Message::Platform(message))
                if message.message_type() == names::SET_ATTRIBUTES =>
            {
                for (key, value) in &message.body.attributes {
                    self.set_attribute(key, value.clone());
                }
            }
            DriverEvent::AttributesUpdated { attributes, .. } => {
                for (key, value) in attributes {
                    self.set_attribute(key, value.clone());
                }
            }
            _ => {}
        }
    }

    /// Persists dirty state and publishes the resulting events.
    ///
    /// Persistence and publish failures are logged; the in-memory state stays authoritative.
    pub async fn commit(&mut self) {
        if self.deleted {
            self.dirty_attributes.clear();
            self.dirty_variables = false;
            self.outbox.clear();
            return;
        }

        let changes: AttributeMap = std::mem::take(&mut self.dirty_attributes)
            .into_iter()
            .map(|key| {
                let value = self.attributes.get(&key).cloned().unwrap_or(Value::Null);
                (key, value)
            })
            .collect();

        if self.device_dirty {
            self.device_dirty = false;
            if let Err(e) = self.services.dao.save(&self.device).await {
                warn!(device = %self.driver_address(), error = %e, "Failed to save device");
            }
        }

        if !changes.is_empty() || self.dirty_variables {
            let state = DriverState {
                attributes: changes.clone(),
                variables: if self.dirty_variables {
                    self.variables.clone()
                } else {
                    VariableMap::new()
                },
            };
            self.dirty_variables = false;
            if let Err(e) = self
                .services
                .dao
                .update_driver_state(&self.device, state)
                .await
            {
                warn!(device = %self.driver_address(), error = %e, "Failed to persist driver state");
            }
        }

        let mut outbound = Vec::with_capacity(self.outbox.len() + 1);
        if !changes.is_empty() {
            outbound.push(MessageBody {
                message_type: names::VALUE_CHANGE.to_string(),
                attributes: changes.into_iter().collect(),
            });
        }
        outbound.append(&mut self.outbox);
        for body in outbound {
            self.broadcast(body).await;
        }
    }

    async fn broadcast(&self, body: MessageBody) {
        let population = self
            .services
            .population
            .get_population_by_place_id(self.place_id())
            .await;
        trace!(device = %self.driver_address(), message_type = %body.message_type, "Broadcasting");
        let message = PlatformMessage::broadcast(Address::Driver(self.driver_address()), body)
            .with_place(self.place_id(), Some(population));
        if let Err(e) = self.services.platform_bus.send(message).await {
            warn!(device = %self.driver_address(), error = %e, "Failed to publish device event");
        }
    }

    /// Removes the device from the store and announces the deletion.
    pub async fn delete(&mut self) -> HubResult<()> {
        self.services.dao.delete(&self.device).await?;
        self.deleted = true;
        self.broadcast(MessageBody::new(names::DELETED)).await;
        Ok(())
    }

    /// Marks the device removed while keeping its record for later cleanup.
    pub async fn tombstone(&mut self) -> HubResult<()> {
        self.device.tombstoned = true;
        self.services.dao.tombstone(&self.device).await
    }
}

/// Attribute set a device should carry after being bound to `definition`.
///
/// - attributes outside the new capability namespaces are dropped, core ones included
/// - base attributes in core namespaces always overwrite; others only fill gaps
/// - `base:caps`, `dev:productId` and `devadv:hubLocal` are always recomputed
pub fn migrate_attributes(previous: &AttributeMap, definition: &DriverDefinition) -> AttributeMap {
    let caps = definition.capability_namespaces();
    let mut attributes: AttributeMap = previous
        .iter()
        .filter(|(key, _)| caps.contains(namespace_of(key)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for (key, value) in &definition.base_attributes {
        if is_core_namespace(namespace_of(key)) || !attributes.contains_key(key) {
            attributes.insert(key.clone(), value.clone());
        }
    }

    attributes.insert(
        ATTR_CAPS.to_string(),
        Value::from(caps.into_iter().collect::<Vec<_>>()),
    );
    attributes.insert(
        ATTR_PRODUCT_ID.to_string(),
        definition
            .base_attributes
            .get(ATTR_PRODUCT_ID)
            .cloned()
            .unwrap_or(Value::Null),
    );
    attributes.insert(
        ATTR_HUB_LOCAL.to_string(),
        Value::from(definition.reflexes.is_hub_local()),
    );
    attributes
}
