//! ExecutorRegistry: the single owner of live driver executors.
//!
//! Two caches are kept coherent:
//! - driver address -> executor (the source of truth)
//! - protocol address -> driver address (a lookup index)
//!
//! Every executor eviction, whatever its cause, invalidates the matching
//! protocol entry and stops the evicted executor off the calling task.

use crate::{
    context::{ContextServices, DeviceDriverContext},
    driver::{DeviceDriver, DriverRegistry},
    executor::DriverExecutor,
};
use dashmap::DashMap;
use futures::FutureExt;
use ng_devhub_error::{HubError, HubResult};
use ng_devhub_models::{
    address::{Address, DriverAddress, ProtocolAddress},
    cache::{EvictionCause, EvictionListener, NGCache},
    dao::DriverState,
    device::{Device, DriverId},
    event::DriverEvent,
    services::{ScheduledTask, Scheduler},
    settings::Settings,
};
use ng_devhub_storage::cache::MokaCache;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, instrument, warn};

pub const EXECUTOR_CACHE_NAME: &str = "DriverExecutors";
pub const PROTOCOL_CACHE_NAME: &str = "ProtocolToDriver";

/// Hook run on a freshly associated executor before it becomes visible.
pub type ExecutorInitializer = Box<dyn FnOnce(&Arc<DriverExecutor>) + Send>;

type ExecutorCache = Arc<dyn NGCache<DriverAddress, Arc<DriverExecutor>>>;
type ProtocolCache = Arc<dyn NGCache<ProtocolAddress, DriverAddress>>;
type TombstoneTimers = Arc<DashMap<DriverAddress, (u64, ScheduledTask)>>;

/// How an executor is being loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Normal message delivery.
    Load,
    /// Resolving only to evict; never warms the executor cache.
    Remove,
    /// Loading to hard-delete; tombstoned devices are not started.
    Delete,
    /// Loading to tombstone; never started.
    Tombstone,
}

/// Snapshot of registry occupancy and mailbox backlog.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryStats {
    pub executors: u64,
    pub protocol_mappings: u64,
    pub backlog_min: usize,
    pub backlog_max: usize,
    pub backlog_mean: f64,
}

pub struct ExecutorRegistry {
    settings: Settings,
    drivers: Arc<dyn DriverRegistry>,
    scheduler: Arc<dyn Scheduler>,
    services: ContextServices,
    executor_cache: ExecutorCache,
    protocol_cache: ProtocolCache,
    tombstone_timers: TombstoneTimers,
}

impl ExecutorRegistry {
    pub fn new(
        settings: Settings,
        drivers: Arc<dyn DriverRegistry>,
        scheduler: Arc<dyn Scheduler>,
        services: ContextServices,
    ) -> Self {
        let protocol_cache: ProtocolCache = Arc::new(MokaCache::unbounded(PROTOCOL_CACHE_NAME));
        let tombstone_timers: TombstoneTimers = Arc::new(DashMap::new());

        let listener = Self::eviction_listener(
            Arc::clone(&protocol_cache),
            Arc::clone(&tombstone_timers),
            Arc::clone(&scheduler),
        );
        let executor_cache: ExecutorCache = Arc::new(MokaCache::new(
            EXECUTOR_CACHE_NAME,
            settings.driver.executor_cache_capacity,
            settings.driver.executor_idle_timeout(),
            Some(listener),
        ));

        Self {
            settings,
            drivers,
            scheduler,
            services,
            executor_cache,
            protocol_cache,
            tombstone_timers,
        }
    }

    fn eviction_listener(
        protocol_cache: ProtocolCache,
        tombstone_timers: TombstoneTimers,
        scheduler: Arc<dyn Scheduler>,
    ) -> EvictionListener<DriverAddress, Arc<DriverExecutor>> {
        Arc::new(move |address, executor, cause| {
            let protocol_cache = Arc::clone(&protocol_cache);
            let tombstone_timers = Arc::clone(&tombstone_timers);
            let scheduler = Arc::clone(&scheduler);
            async move {
                debug!(
                    device = %address,
                    instance = executor.instance_id(),
                    ?cause,
                    "Driver executor evicted"
                );
                let instance = executor.instance_id();
                if let Some((_, (_, timer))) =
                    tombstone_timers.remove_if(&address, |_, (owner, _)| *owner == instance)
                {
                    timer.cancel();
                }
                if let Some(protocol_address) = executor.protocol_address() {
                    protocol_cache.invalidate(protocol_address).await;
                }
                if cause == EvictionCause::Size {
                    info!(device = %address, "Driver executor evicted to stay under capacity");
                }
                scheduler.schedule_delayed(
                    async move {
                        let _ = executor.stop();
                    }
                    .boxed(),
                    Duration::ZERO,
                );
            }
            .boxed()
        })
    }

    // === Resolution ===

    /// Executor for a driver or protocol address, loading and starting it on a miss.
    pub async fn resolve(&self, address: &Address) -> HubResult<Arc<DriverExecutor>> {
        self.load(address, LoadMode::Load).await
    }

    /// Cached executor for `address` without loading anything.
    pub async fn get_if_present(&self, address: &Address) -> Option<Arc<DriverExecutor>> {
        match address {
            Address::Driver(d) => self.executor_cache.get(d).await,
            Address::Protocol(p) => {
                let driver_address = self.protocol_cache.get(p).await?;
                self.executor_cache.get(&driver_address).await
            }
            _ => None,
        }
    }

    async fn load(&self, address: &Address, mode: LoadMode) -> HubResult<Arc<DriverExecutor>> {
        let driver_address = match address {
            Address::Driver(d) => *d,
            Address::Protocol(p) => {
                self.protocol_cache
                    .get_or_load(p.clone(), self.load_driver_address(p, mode).boxed())
                    .await?
            }
            other => return Err(HubError::UnsupportedAddress(other.to_string())),
        };
        self.executor_cache
            .get_or_load(
                driver_address,
                self.load_executor_by_driver_address(driver_address, mode)
                    .boxed(),
            )
            .await
    }

    async fn load_driver_address(
        &self,
        address: &ProtocolAddress,
        mode: LoadMode,
    ) -> HubResult<DriverAddress> {
        let device = self
            .services
            .dao
            .find_by_protocol_address(address)
            .await?
            .ok_or_else(|| HubError::not_found(address))?;
        let driver_address = device.address();
        if mode != LoadMode::Remove {
            // warm the executor cache while the device record is at hand
            self.executor_cache
                .get_or_load(driver_address, self.load_executor(device, mode).boxed())
                .await
                .inspect_err(|e| {
                    warn!(device = %driver_address, error = %e, "Unable to load driver for device")
                })?;
        }
        Ok(driver_address)
    }

    async fn load_executor_by_driver_address(
        &self,
        address: DriverAddress,
        mode: LoadMode,
    ) -> HubResult<Arc<DriverExecutor>> {
        let device = self
            .services
            .dao
            .find_by_id(address.device_id())
            .await?
            .ok_or_else(|| HubError::not_found(address))?;
        self.load_executor(device, mode).await
    }

    async fn load_executor(&self, device: Device, mode: LoadMode) -> HubResult<Arc<DriverExecutor>> {
        let driver_id = device
            .driver_id
            .clone()
            .ok_or_else(|| HubError::InvalidState("Unable to load driver for device".into()))?;
        let driver = self.load_driver(&driver_id).await?;
        let state = self.services.dao.load_driver_state(&device).await?;
        let context =
            DeviceDriverContext::new(device, driver.definition(), state, self.services.clone());
        let start = match mode {
            LoadMode::Tombstone => false,
            // only cleaning out the tombstone
            LoadMode::Delete => !context.is_tombstoned(),
            LoadMode::Load | LoadMode::Remove => true,
        };
        self.create_executor(driver, context, start)
    }

    async fn load_driver(&self, driver_id: &DriverId) -> HubResult<Arc<dyn DeviceDriver>> {
        match self.drivers.load_driver_by_id(driver_id).await {
            Ok(Some(driver)) => return Ok(driver),
            Ok(None) => {
                warn!(driver = %driver_id, "Unable to load driver, using fallback driver instead")
            }
            Err(e) => {
                warn!(driver = %driver_id, error = %e, "Driver load failed, using fallback driver instead")
            }
        }
        self.drivers
            .fallback()
            .ok_or_else(|| HubError::DriverLoad(format!("Unable to load driver for id [{driver_id}]")))
    }

    fn create_executor(
        &self,
        driver: Arc<dyn DeviceDriver>,
        context: DeviceDriverContext,
        start: bool,
    ) -> HubResult<Arc<DriverExecutor>> {
        let tombstoned = context.is_tombstoned();
        let executor = DriverExecutor::spawn(driver, context, self.settings.driver.backlog_size);

        if tombstoned {
            if let Some(delay) = self.settings.driver.tombstone_timeout() {
                self.schedule_tombstone_eviction(&executor, delay);
            }
        }
        if start {
            executor.start()?;
        }
        Ok(executor)
    }

    fn schedule_tombstone_eviction(&self, executor: &Arc<DriverExecutor>, delay: Duration) {
        let address = executor.driver_address();
        let instance = executor.instance_id();
        let cache = Arc::clone(&self.executor_cache);
        let timer = self.scheduler.schedule_delayed(
            async move {
                let current = cache.get(&address).await;
                if current.is_some_and(|e| e.instance_id() == instance) {
                    debug!(device = %address, "Evicting tombstoned driver executor");
                    cache.invalidate(&address).await;
                }
            }
            .boxed(),
            delay,
        );
        if let Some((_, previous)) = self.tombstone_timers.insert(address, (instance, timer)) {
            previous.cancel();
        }
    }

    // === Association ===

    /// Binds `device` to `driver`, replacing any live executor for it.
    ///
    /// The old executor is drained and stopped first so no event interleaves
    /// with the state hand-off; its attributes are then migrated onto the new
    /// driver's capability set.
    #[instrument(name = "associate", skip_all, fields(device = %device.address()))]
    pub async fn associate(
        &self,
        mut device: Device,
        driver: Arc<dyn DeviceDriver>,
        initializer: Option<ExecutorInitializer>,
    ) -> HubResult<Arc<DriverExecutor>> {
        let address = device.address();
        let old = if device.driver_id.is_some() {
            match self.resolve(&Address::Driver(address)).await {
                Ok(executor) => Some(executor),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let definition = driver.definition();
        device.caps = definition.capability_namespaces();
        device.driver_id = Some(definition.driver_id());

        let previous = match &old {
            None => DriverState::default(),
            Some(old) => {
                // messages arriving mid-upgrade are rejected; the new driver
                // resynchronizes on its first connect
                if let Some(stopped) = old.stop() {
                    if let Err(e) = stopped
                        .wait_timeout(self.settings.driver.upgrade_timeout())
                        .await
                    {
                        warn!(error = %e, "Error shutting down old driver");
                    }
                }
                old.context().lock().await.driver_state()
            }
        };

        let context = DeviceDriverContext::migrated(
            device,
            definition,
            previous,
            self.services.clone(),
        );
        let executor = self.create_executor(driver, context, true)?;
        let _ = executor.upgraded(old.as_ref().map(|o| o.driver_id().clone()))?;
        if let Some(initializer) = initializer {
            initializer(&executor);
        }
        // replacing the entry evicts and stops the old executor
        self.executor_cache
            .insert(address, Arc::clone(&executor))
            .await;
        info!(driver = %executor.driver_id(), "Driver associated");
        Ok(executor)
    }

    // === Teardown ===

    /// Evicts the executor for `address`; the eviction cleans the protocol index.
    pub async fn remove(&self, address: &Address) -> HubResult<()> {
        let driver_address = match address {
            Address::Driver(d) => *d,
            Address::Protocol(p) => match self.protocol_cache.get(p).await {
                Some(d) => d,
                None => self.load_driver_address(p, LoadMode::Remove).await?,
            },
            other => return Err(HubError::UnsupportedAddress(other.to_string())),
        };
        self.executor_cache.invalidate(&driver_address).await;
        self.executor_cache.sync().await;
        Ok(())
    }

    /// Disassociates and hard-deletes the device. Returns `false` when it does not exist.
    pub async fn delete(&self, address: &Address) -> HubResult<bool> {
        self.teardown(address, LoadMode::Delete).await
    }

    /// Disassociates and tombstones the device. Returns `false` when it does not exist.
    pub async fn tombstone(&self, address: &Address) -> HubResult<bool> {
        self.teardown(address, LoadMode::Tombstone).await
    }

    async fn teardown(&self, address: &Address, mode: LoadMode) -> HubResult<bool> {
        let executor = match self.load(address, mode).await {
            Ok(executor) => executor,
            Err(e) if e.is_not_found() => {
                warn!(device = %address, ?mode, "Could not tear down device: not found");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        // enqueued under the context lock so a concurrent sync sees the flag
        // before it can fire anything behind Disassociated
        let fired = {
            let mut context = executor.context().lock().await;
            context.mark_tearing_down();
            executor.fire(DriverEvent::Disassociated)
        };
        let disassociated = match fired {
            Ok(handle) => {
                handle
                    .wait_timeout(self.settings.driver.disassociate_timeout())
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = disassociated {
            warn!(device = %address, error = %e, "Unable to disassociate driver");
        }

        {
            let mut context = executor.context().lock().await;
            let result = match mode {
                LoadMode::Delete => context.delete().await,
                _ => context.tombstone().await,
            };
            if let Err(e) = result {
                warn!(device = %address, ?mode, error = %e, "Failed to persist device removal");
            }
        }

        self.remove(&Address::Driver(executor.driver_address()))
            .await?;
        Ok(true)
    }

    // === Introspection ===

    pub fn stats(&self) -> RegistryStats {
        let backlogs: Vec<usize> = self
            .executor_cache
            .values()
            .iter()
            .map(|e| e.queued_count())
            .collect();
        let mut stats = RegistryStats {
            executors: self.executor_cache.entry_count(),
            protocol_mappings: self.protocol_cache.entry_count(),
            ..Default::default()
        };
        if !backlogs.is_empty() {
            stats.backlog_min = backlogs.iter().copied().min().unwrap_or_default();
            stats.backlog_max = backlogs.iter().copied().max().unwrap_or_default();
            stats.backlog_mean = backlogs.iter().sum::<usize>() as f64 / backlogs.len() as f64;
        }
        stats
    }

    /// Applies pending cache maintenance, delivering outstanding eviction notifications.
    pub async fn sync(&self) {
        self.executor_cache.sync().await;
        self.protocol_cache.sync().await;
    }
}
