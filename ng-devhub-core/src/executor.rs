//! Per-device event loop.
//!
//! A device's driver only ever sees one event at a time. Events are queued in
//! a bounded mailbox and handled by a single worker task in the order they were
//! accepted; a full mailbox rejects the caller instead of making it wait. The
//! worker owns the [`DeviceDriverContext`] behind an async mutex and commits it
//! after every event. Stopping enqueues `DriverStopped` behind the backlog, or
//! cancels the worker when even that does not fit.

use crate::{context::DeviceDriverContext, driver::DeviceDriver};
use ng_devhub_error::{HubError, HubResult};
use ng_devhub_models::{
    address::{DriverAddress, ProtocolAddress},
    attributes::AttributeMap,
    device::DriverId,
    event::DriverEvent,
};
use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot, Mutex,
    },
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExecutorState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl From<u8> for ExecutorState {
    fn from(value: u8) -> Self {
        match value {
            0 => ExecutorState::Created,
            1 => ExecutorState::Running,
            2 => ExecutorState::Stopping,
            _ => ExecutorState::Stopped,
        }
    }
}

struct Envelope {
    event: DriverEvent,
    done: oneshot::Sender<HubResult<()>>,
}

/// Completion of one fired event.
#[must_use = "dropping the handle does not cancel the event"]
pub struct FireHandle {
    rx: oneshot::Receiver<HubResult<()>>,
}

impl FireHandle {
    /// Waits until the worker has processed the event.
    pub async fn wait(self) -> HubResult<()> {
        self.rx
            .await
            .map_err(|_| HubError::ExecutorStopped("event discarded".to_string()))?
    }

    pub async fn wait_timeout(self, limit: Duration) -> HubResult<()> {
        timeout(limit, self.wait())
            .await
            .map_err(|_| HubError::Timeout(limit))?
    }
}

pub struct DriverExecutor {
    // === Identity ===
    instance_id: u64,
    driver_address: DriverAddress,
    protocol_address: Option<ProtocolAddress>,
    place_id: Option<Uuid>,
    driver_id: DriverId,
    supported: Arc<BTreeSet<String>>,

    // === Driver and state ===
    driver: Arc<dyn DeviceDriver>,
    context: Arc<Mutex<DeviceDriverContext>>,

    // === Mailbox ===
    mailbox: mpsc::Sender<Envelope>,

    // === Control ===
    state: Arc<AtomicU8>,
    shutdown_token: CancellationToken,
}

impl DriverExecutor {
    /// Creates the executor and spawns its worker. Events are accepted
    /// immediately; [`start`](Self::start) delivers `DriverStarted`.
    pub fn spawn(
        driver: Arc<dyn DeviceDriver>,
        context: DeviceDriverContext,
        backlog: usize,
    ) -> Arc<Self> {
        let (mailbox, rx) = mpsc::channel(backlog.max(1));
        let executor = Arc::new(Self {
            instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            driver_address: context.driver_address(),
            protocol_address: context.protocol_address().cloned(),
            place_id: context.place_id(),
            driver_id: context.driver_id().clone(),
            supported: context.supported_attributes(),
            driver,
            context: Arc::new(Mutex::new(context)),
            mailbox,
            state: Arc::new(AtomicU8::new(ExecutorState::Created as u8)),
            shutdown_token: CancellationToken::new(),
        });

        tokio::spawn(Self::run_worker(
            executor.driver_address,
            executor.instance_id,
            Arc::clone(&executor.driver),
            Arc::clone(&executor.context),
            rx,
            executor.shutdown_token.clone(),
            Arc::clone(&executor.state),
        ));
        executor
    }

    // === Accessors ===

    #[inline]
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    #[inline]
    pub fn driver_address(&self) -> DriverAddress {
        self.driver_address
    }

    #[inline]
    pub fn protocol_address(&self) -> Option<&ProtocolAddress> {
        self.protocol_address.as_ref()
    }

    #[inline]
    pub fn place_id(&self) -> Option<Uuid> {
        self.place_id
    }

    #[inline]
    pub fn driver_id(&self) -> &DriverId {
        &self.driver_id
    }

    #[inline]
    pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.driver
    }

    /// Context shared with the worker. Never hold the lock while waiting on a [`FireHandle`].
    #[inline]
    pub fn context(&self) -> &Arc<Mutex<DeviceDriverContext>> {
        &self.context
    }

    #[inline]
    pub fn state(&self) -> ExecutorState {
        ExecutorState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state() == ExecutorState::Running
    }

    /// Number of events waiting in the mailbox.
    #[inline]
    pub fn queued_count(&self) -> usize {
        self.mailbox.max_capacity() - self.mailbox.capacity()
    }

    // === Lifecycle ===

    /// Marks the executor running and delivers `DriverStarted`.
    pub fn start(&self) -> HubResult<()> {
        let started = self
            .state
            .compare_exchange(
                ExecutorState::Created as u8,
                ExecutorState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if started {
            debug!(device = %self.driver_address, instance = self.instance_id, "Starting driver executor");
            let _ = self.fire(DriverEvent::DriverStarted)?;
        }
        Ok(())
    }

    /// Announces the driver binding; `previous` is the driver it replaced.
    pub fn upgraded(&self, previous: Option<DriverId>) -> HubResult<FireHandle> {
        self.fire(DriverEvent::Associated { previous })
    }

    /// Stops accepting bus messages and queues the terminal `DriverStopped`.
    ///
    /// Everything already queued is processed first. Returns the handle of the
    /// terminal event, or `None` when already stopping or when the mailbox was
    /// full and the worker had to be cancelled outright. Idempotent.
    pub fn stop(&self) -> Option<FireHandle> {
        let transitioned = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s < ExecutorState::Stopping as u8).then_some(ExecutorState::Stopping as u8)
            })
            .is_ok();
        if !transitioned {
            return None;
        }

        debug!(device = %self.driver_address, instance = self.instance_id, "Stopping driver executor");
        let (done, rx) = oneshot::channel();
        match self.mailbox.try_send(Envelope {
            event: DriverEvent::DriverStopped,
            done,
        }) {
            Ok(()) => Some(FireHandle { rx }),
            Err(TrySendError::Full(_)) => {
                warn!(device = %self.driver_address, "Mailbox full on stop, cancelling worker");
                self.shutdown_token.cancel();
                None
            }
            Err(TrySendError::Closed(_)) => None,
        }
    }

    // === Dispatch ===

    /// Enqueues `event` without blocking.
    ///
    /// Fails with `QueueFull` when the mailbox is at capacity and with
    /// `ExecutorStopped` once the executor is stopping (lifecycle events aside).
    pub fn fire(&self, event: DriverEvent) -> HubResult<FireHandle> {
        if !event.is_lifecycle() && self.state() >= ExecutorState::Stopping {
            return Err(HubError::ExecutorStopped(self.driver_address.to_string()));
        }
        let (done, rx) = oneshot::channel();
        match self.mailbox.try_send(Envelope { event, done }) {
            Ok(()) => Ok(FireHandle { rx }),
            Err(TrySendError::Full(envelope)) => {
                warn!(
                    device = %self.driver_address,
                    event = envelope.event.name(),
                    "Driver mailbox full, rejecting event"
                );
                Err(HubError::QueueFull {
                    address: self.driver_address.to_string(),
                    capacity: self.mailbox.max_capacity(),
                })
            }
            Err(TrySendError::Closed(_)) => {
                Err(HubError::ExecutorStopped(self.driver_address.to_string()))
            }
        }
    }

    /// Fires the subset of `attributes` this driver supports as an `AttributesUpdated` event.
    ///
    /// Returns `None` when nothing in the report is supported.
    pub fn sync_attributes(
        &self,
        attributes: AttributeMap,
        reflex_version: Option<u32>,
        is_device_message: bool,
    ) -> HubResult<Option<FireHandle>> {
        let update: AttributeMap = attributes
            .into_iter()
            .filter(|(key, _)| {
                let supported = self.supported.contains(key);
                if !supported {
                    debug!(device = %self.driver_address, key, "Device reported unsupported attribute");
                }
                supported
            })
            .collect();
        if update.is_empty() {
            return Ok(None);
        }
        self.fire(DriverEvent::AttributesUpdated {
            attributes: update,
            reflex_version,
            is_device_message,
        })
        .map(Some)
    }

    // === Worker ===

    #[instrument(name = "driver-executor", skip_all, fields(device = %address, instance = instance))]
    async fn run_worker(
        address: DriverAddress,
        instance: u64,
        driver: Arc<dyn DeviceDriver>,
        context: Arc<Mutex<DeviceDriverContext>>,
        mut rx: mpsc::Receiver<Envelope>,
        token: CancellationToken,
        state: Arc<AtomicU8>,
    ) {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                envelope = rx.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let terminal = matches!(envelope.event, DriverEvent::DriverStopped);
            trace!(event = envelope.event.name(), "Processing driver event");
            let result = Self::process(&driver, &context, &envelope.event).await;
            if let Err(e) = &result {
                warn!(event = envelope.event.name(), error = %e, "Driver failed to handle event");
            }
            let _ = envelope.done.send(result);
            if terminal {
                break;
            }
        }

        state.store(ExecutorState::Stopped as u8, Ordering::Release);
        rx.close();
        while let Ok(envelope) = rx.try_recv() {
            let _ = envelope
                .done
                .send(Err(HubError::ExecutorStopped(address.to_string())));
        }
        debug!("Driver executor worker exited");
    }

    async fn process(
        driver: &Arc<dyn DeviceDriver>,
        context: &Mutex<DeviceDriverContext>,
        event: &DriverEvent,
    ) -> HubResult<()> {
        let mut context = context.lock().await;
        context.apply_builtin(event);
        let result = driver.handle(&mut context, event).await;
        context.commit().await;
        result
    }
}

impl std::fmt::Debug for DriverExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverExecutor")
            .field("instance_id", &self.instance_id)
            .field("driver_address", &self.driver_address)
            .field("driver_id", &self.driver_id)
            .field("state", &self.state())
            .finish()
    }
}
