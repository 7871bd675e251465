//! Hub/platform device reconciliation.
//!
//! A hub periodically reports every device it has paired. The report is
//! diffed against the platform's device records for the hub's place:
//! - known to both: connectivity and attributes are pushed into the executor,
//!   tombstoned devices are force-removed from the hub
//! - unknown to the platform: lost-device recovery
//! - unknown to the hub: left alone (see [`DevicePartition::unknown_to_hub`])

use crate::{
    driver::DriverRegistry,
    recovery::LostDeviceRecovery,
    registry::ExecutorRegistry,
};
use ng_devhub_error::HubResult;
use ng_devhub_models::{
    address::{Address, ProtocolAddress},
    attributes::{AttributeMap, ATTR_DEGRADED_CODE},
    device::{Device, DriverId},
    driver::{DriverDefinition, ReflexRunMode},
    event::DriverEvent,
    message::{
        names, ControlEvent, Message, MessageBody, PlatformMessage, ProtocolMessage,
        ProtocolPayload,
    },
    services::MessageBus,
    settings::Settings,
    sync::{DegradedInfo, SyncDeviceInfo, SyncDeviceState},
};
use serde_json::Value;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const HUB_SYNC_REASON: &str = "hub sync";

/// A device present in both the hub report and the platform records.
#[derive(Debug, Clone, PartialEq)]
pub struct KnownDevice {
    pub device: Device,
    pub online: Option<bool>,
    pub degraded: bool,
    pub attrs: AttributeMap,
}

/// Three-way split of a hub report against the platform's devices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DevicePartition {
    pub known_to_both: Vec<KnownDevice>,
    /// Hub-local platform devices missing from the report. Nothing is done
    /// with these yet: a hub mid-pairing reports partial lists, so marking
    /// them lost here would orphan healthy devices.
    pub unknown_to_hub: BTreeSet<ProtocolAddress>,
    pub unknown_to_platform: BTreeSet<ProtocolAddress>,
    /// Devices whose degraded code changes, already carrying the new code.
    pub degraded_updates: Vec<Device>,
    /// Report records skipped because they could not be decoded.
    pub malformed: usize,
}

/// What a sync hands back to the hub.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub device_states: Vec<SyncDeviceState>,
    pub driver_reflexes: Vec<Value>,
    pub partition: DevicePartition,
}

/// Hub-local platform devices keyed by their hub-scoped protocol address.
pub fn hub_devices_by_protocol(
    hub_id: &str,
    hub_protocols: &[String],
    devices: &[Device],
) -> BTreeMap<ProtocolAddress, Device> {
    let mut by_protocol = BTreeMap::new();
    for device in devices.iter().filter(|d| d.is_hub_device(hub_protocols)) {
        match &device.protocol_address {
            Some(address) => {
                by_protocol.insert(address.canonical(hub_id), device.clone());
            }
            None if !device.tombstoned => {
                info!(device = %device.address(), "Platform device has no protocol address");
            }
            None => {}
        }
    }
    by_protocol
}

fn canonical_report_address(hub_id: &str, reported: &str) -> Option<ProtocolAddress> {
    match reported.parse::<ProtocolAddress>() {
        Ok(address) => Some(address.canonical(hub_id)),
        Err(e) => {
            warn!(protocol = reported, error = %e, "Skipping report with invalid protocol address");
            None
        }
    }
}

/// Splits `reported` against `devices`. Pure: no executor or bus is touched.
pub fn partition_devices(
    hub_id: &str,
    hub_protocols: &[String],
    devices: &[Device],
    reported: &[Value],
) -> DevicePartition {
    let by_protocol = hub_devices_by_protocol(hub_id, hub_protocols, devices);
    let mut partition = DevicePartition {
        unknown_to_hub: by_protocol.keys().cloned().collect(),
        ..Default::default()
    };

    let mut known: BTreeMap<ProtocolAddress, KnownDevice> = BTreeMap::new();
    for report in reported {
        let info: SyncDeviceInfo = match serde_json::from_value(report.clone()) {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "Skipping malformed device report");
                partition.malformed += 1;
                continue;
            }
        };
        let Some(protocol) = canonical_report_address(hub_id, &info.protocol) else {
            partition.malformed += 1;
            continue;
        };
        match by_protocol.get(&protocol) {
            Some(device) => {
                partition.unknown_to_hub.remove(&protocol);
                known.insert(
                    protocol,
                    KnownDevice {
                        device: device.clone(),
                        online: info.online,
                        degraded: info.degraded,
                        attrs: info.attrs,
                    },
                );
            }
            None => {
                partition.unknown_to_platform.insert(protocol);
            }
        }
    }

    for entry in known.values() {
        if let Some(code) = entry.device.degraded_code.transition(entry.degraded) {
            let mut device = entry.device.clone();
            device.degraded_code = code;
            partition.degraded_updates.push(device);
        }
    }
    partition.known_to_both = known.into_values().collect();
    partition
}

pub struct ReconciliationEngine {
    settings: Settings,
    registry: Arc<ExecutorRegistry>,
    drivers: Arc<dyn DriverRegistry>,
    recovery: Arc<LostDeviceRecovery>,
    platform_bus: Arc<dyn MessageBus<PlatformMessage>>,
}

impl ReconciliationEngine {
    pub fn new(
        settings: Settings,
        registry: Arc<ExecutorRegistry>,
        drivers: Arc<dyn DriverRegistry>,
        recovery: Arc<LostDeviceRecovery>,
        platform_bus: Arc<dyn MessageBus<PlatformMessage>>,
    ) -> Self {
        Self {
            settings,
            registry,
            drivers,
            recovery,
            platform_bus,
        }
    }

    /// Reconciles a full hub report for `place_id`.
    ///
    /// Per-device failures are logged and skipped; a sync never fails as a whole.
    #[instrument(name = "sync-devices", skip_all, fields(hub = hub_id, place = %place_id))]
    pub async fn sync_devices(
        &self,
        hub_id: &str,
        place_id: Uuid,
        reflex_version: Option<u32>,
        devices: &[Device],
        reported: &[Value],
    ) -> SyncOutcome {
        let partition =
            partition_devices(hub_id, &self.settings.service.hub_protocols, devices, reported);
        debug!(
            known = partition.known_to_both.len(),
            unknown_to_hub = partition.unknown_to_hub.len(),
            unknown_to_platform = partition.unknown_to_platform.len(),
            malformed = partition.malformed,
            "Partitioned hub report"
        );

        let population = self.recovery.population_of(Some(place_id)).await;
        for known in &partition.known_to_both {
            if let Err(e) = self
                .reconcile_known(known, place_id, &population, reflex_version)
                .await
            {
                warn!(
                    device = %known.device.address(),
                    error = %e,
                    "Failed to sync connectivity and attributes"
                );
            }
        }

        for protocol in &partition.unknown_to_platform {
            let address = Address::Protocol(protocol.clone());
            if let Err(e) = self.recovery.try_restore(&address, Some(place_id)).await {
                warn!(device = %address, error = %e, "Failed to restore lost device");
            }
        }

        let definitions = self.load_definitions(&partition.known_to_both).await;
        let driver_reflexes = sync_driver_reflexes(&definitions);
        let device_states = sync_device_states(&partition.known_to_both, &definitions);

        self.dispatch_degraded_updates(&partition.degraded_updates)
            .await;

        SyncOutcome {
            device_states,
            driver_reflexes,
            partition,
        }
    }

    /// Applies only the degraded flags of a hub report; returns the devices whose code changed.
    #[instrument(name = "sync-degraded", skip_all, fields(hub = hub_id, place = %place_id))]
    pub async fn sync_degraded_devices(
        &self,
        hub_id: &str,
        place_id: Uuid,
        devices: &[Device],
        reported: &[Value],
    ) -> Vec<Device> {
        let by_protocol =
            hub_devices_by_protocol(hub_id, &self.settings.service.hub_protocols, devices);
        let mut updated: BTreeMap<ProtocolAddress, Device> = BTreeMap::new();
        for report in reported {
            let info: DegradedInfo = match serde_json::from_value(report.clone()) {
                Ok(info) => info,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed degraded report");
                    continue;
                }
            };
            let Some(protocol) = canonical_report_address(hub_id, &info.protocol) else {
                continue;
            };
            let Some(device) = updated.get(&protocol).or_else(|| by_protocol.get(&protocol))
            else {
                continue;
            };
            if let Some(code) = device.degraded_code.transition(info.degraded) {
                let mut device = device.clone();
                device.degraded_code = code;
                updated.insert(protocol, device);
            }
        }

        let updated: Vec<Device> = updated.into_values().collect();
        self.dispatch_degraded_updates(&updated).await;
        updated
    }

    async fn reconcile_known(
        &self,
        known: &KnownDevice,
        place_id: Uuid,
        population: &str,
        reflex_version: Option<u32>,
    ) -> HubResult<()> {
        let address = Address::Driver(known.device.address());
        let executor = self.registry.resolve(&address).await?;
        // held until every event for this device is enqueued
        let context = executor.context().lock().await;
        if context.is_tearing_down() {
            debug!(device = %address, "Device is being torn down, skipping sync");
            return Ok(());
        }

        if context.is_tombstoned() {
            drop(context);
            debug!(device = %address, "Sending ForceRemove request for tombstoned device");
            let request = PlatformMessage::request(
                Address::device_service(),
                address,
                MessageBody::new(names::FORCE_REMOVE),
            )
            .with_place(Some(place_id), Some(population.to_string()));
            return self.platform_bus.send(request).await;
        }

        match known.online {
            Some(online) if online != context.is_connected() => {
                let control = if online {
                    ControlEvent::DeviceOnline {
                        message: Some(HUB_SYNC_REASON.to_string()),
                    }
                } else {
                    ControlEvent::DeviceOffline {
                        message: Some(HUB_SYNC_REASON.to_string()),
                    }
                };
                let source = executor
                    .protocol_address()
                    .cloned()
                    .map(Address::Protocol)
                    .unwrap_or_else(|| address.clone());
                let message = ProtocolMessage::new(
                    source,
                    Address::Broadcast,
                    ProtocolPayload::Control(control),
                )
                .with_place(Some(place_id), Some(population.to_string()))
                .with_reflex_version(reflex_version);
                let _ = executor.fire(DriverEvent::Message(Message::Protocol(message)))?;
            }
            Some(_) => {}
            None => warn!(device = %address, "Device reported with unknown online state"),
        }

        if !known.attrs.is_empty() {
            let _ = executor.sync_attributes(known.attrs.clone(), reflex_version, false)?;
        }
        drop(context);
        Ok(())
    }

    /// Driver definitions of the known devices, loaded once per driver id.
    async fn load_definitions(
        &self,
        known: &[KnownDevice],
    ) -> BTreeMap<DriverId, Option<DriverDefinition>> {
        let mut definitions = BTreeMap::new();
        for driver_id in known.iter().filter_map(|k| k.device.driver_id.as_ref()) {
            if definitions.contains_key(driver_id) {
                continue;
            }
            let definition = match self.drivers.load_driver_by_id(driver_id).await {
                Ok(Some(driver)) => Some(driver.definition().clone()),
                Ok(None) => {
                    info!(driver = %driver_id, "Device has unknown driver definition");
                    None
                }
                Err(e) => {
                    info!(driver = %driver_id, error = %e, "Failed to load driver definition");
                    None
                }
            };
            definitions.insert(driver_id.clone(), definition);
        }
        definitions
    }

    async fn dispatch_degraded_updates(&self, updated: &[Device]) {
        for device in updated {
            let address = Address::Driver(device.address());
            let body = MessageBody::new(names::SET_ATTRIBUTES)
                .with(ATTR_DEGRADED_CODE, device.degraded_code.as_str());
            let request = PlatformMessage::request(Address::device_service(), address.clone(), body)
                .with_place(device.place_id, None);
            let dispatched = match self.registry.resolve(&address).await {
                Ok(executor) => executor
                    .fire(DriverEvent::Message(Message::Platform(request)))
                    .map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = dispatched {
                warn!(device = %address, error = %e, "Failed to dispatch degraded code update");
            }
        }
    }
}

/// Reflex bundles for every hub-executable driver in `definitions`.
pub fn sync_driver_reflexes(
    definitions: &BTreeMap<DriverId, Option<DriverDefinition>>,
) -> Vec<Value> {
    definitions
        .values()
        .flatten()
        .filter(|d| d.reflexes.mode != ReflexRunMode::Platform)
        .filter_map(|definition| {
            let mut json = match serde_json::to_value(&definition.reflexes) {
                Ok(json) => json,
                Err(e) => {
                    warn!(driver = %definition.driver_id(), error = %e, "Failed to encode reflexes");
                    return None;
                }
            };
            if let Value::Object(map) = &mut json {
                map.insert("driver".into(), Value::from(definition.name.clone()));
                map.insert(
                    "version".into(),
                    Value::from(definition.version.to_string()),
                );
                map.insert("hash".into(), Value::from(definition.hash.clone()));
            }
            Some(json)
        })
        .collect()
}

/// Platform view of every known device, with its driver's hash when available.
pub fn sync_device_states(
    known: &[KnownDevice],
    definitions: &BTreeMap<DriverId, Option<DriverDefinition>>,
) -> Vec<SyncDeviceState> {
    known
        .iter()
        .filter_map(|k| {
            let device = &k.device;
            let (Some(driver_id), Some(protocol)) = (&device.driver_id, &device.protocol_address)
            else {
                info!(device = %device.address(), "Skipping device state without driver or protocol");
                return None;
            };
            let hash = definitions
                .get(driver_id)
                .and_then(Option::as_ref)
                .map(|d| d.hash.clone())
                .unwrap_or_default();
            Some(SyncDeviceState {
                protocol: protocol.to_string(),
                platform: device.address().to_string(),
                driver: driver_id.name.clone(),
                version: driver_id.version.to_string(),
                hash,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ng_devhub_models::device::{DegradedCode, Version};
    use serde_json::json;

    const HUB: &str = "ABC-1234";

    fn hub_protocols() -> Vec<String> {
        vec!["ZIGB".into(), "ZWAV".into()]
    }

    fn device(protocol: &str, id: &str) -> Device {
        Device::new(
            Uuid::new_v4(),
            ProtocolAddress::new(Some(HUB.into()), protocol, id),
            DriverId::new("Drv", Version::new(1, 0)),
        )
    }

    #[test]
    fn partition_counts_add_up() {
        let a = device("ZIGB", "01");
        let b = device("ZWAV", "02");
        let c = device("ZIGB", "03");
        let ip = device("IPCD", "04");
        let devices = vec![a.clone(), b.clone(), c.clone(), ip];
        let reported = vec![
            json!({ "protocol": "PROT:ABC-1234:ZIGB:01", "online": true }),
            // unscoped form canonicalizes to the hub
            json!({ "protocol": "PROT::ZWAV:02", "online": false }),
            json!({ "protocol": "PROT:ABC-1234:ZIGB:99", "online": true }),
            json!({ "online": true }),
            json!({ "protocol": "garbage" }),
        ];

        let p = partition_devices(HUB, &hub_protocols(), &devices, &reported);
        assert_eq!(p.known_to_both.len(), 2);
        assert_eq!(
            p.unknown_to_hub,
            BTreeSet::from([c.protocol_address.clone().unwrap()])
        );
        assert_eq!(p.unknown_to_platform.len(), 1);
        assert_eq!(p.malformed, 2);

        let hub_local = 3;
        let reported_valid = 3;
        assert_eq!(
            p.unknown_to_hub.len() + p.unknown_to_platform.len() + p.known_to_both.len(),
            hub_local + reported_valid - p.known_to_both.len()
        );
    }

    #[test]
    fn degraded_codes_only_toggle_between_none_and_hub_firmware() {
        let clean = device("ZIGB", "01");
        let mut firmware = device("ZIGB", "02");
        firmware.degraded_code = DegradedCode::HubFirmware;
        let mut other = device("ZIGB", "03");
        other.degraded_code = DegradedCode::Other("battery.low".into());

        let reported = vec![
            json!({ "protocol": "PROT:ABC-1234:ZIGB:01", "degraded": true }),
            json!({ "protocol": "PROT:ABC-1234:ZIGB:02", "degraded": false }),
            json!({ "protocol": "PROT:ABC-1234:ZIGB:03", "degraded": true }),
        ];
        let p = partition_devices(
            HUB,
            &hub_protocols(),
            &[clean.clone(), firmware.clone(), other],
            &reported,
        );
        let updates: BTreeMap<Uuid, DegradedCode> = p
            .degraded_updates
            .iter()
            .map(|d| (d.id, d.degraded_code.clone()))
            .collect();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[&clean.id], DegradedCode::HubFirmware);
        assert_eq!(updates[&firmware.id], DegradedCode::None);
    }

    #[test]
    fn states_carry_empty_hash_for_unknown_driver() {
        let d = device("ZIGB", "01");
        let known = vec![KnownDevice {
            device: d.clone(),
            online: Some(true),
            degraded: false,
            attrs: AttributeMap::new(),
        }];
        let definitions = BTreeMap::from([(d.driver_id.clone().unwrap(), None)]);
        let states = sync_device_states(&known, &definitions);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].hash, "");
        assert_eq!(states[0].driver, "Drv");
        assert_eq!(states[0].version, "1.0");
        assert_eq!(states[0].platform, d.address().to_string());
    }
}
