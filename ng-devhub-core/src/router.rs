//! MessageRouter: consumes the protocol and platform buses and delivers each
//! message to the owning driver executor or to the device service.
//!
//! Messages are handed to a bounded worker pool; intake pauses while every
//! worker is busy. Ordering per device is provided by the executor mailbox,
//! not by the router.

use crate::{
    recovery::LostDeviceRecovery,
    registry::ExecutorRegistry,
    service::DeviceServiceHandler,
};
use ng_devhub_error::{HubError, HubResult};
use ng_devhub_models::{
    address::Address,
    attributes::AttributeMap,
    event::DriverEvent,
    message::{
        names, ControlEvent, Message, MessageBody, MessageHeader, PlatformMessage,
        ProtocolMessage, ProtocolPayload,
    },
    services::MessageBus,
    settings::Settings,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// What a protocol message asks the router to do.
#[derive(Debug, Clone, PartialEq)]
enum ProtocolRoute {
    /// Output of a reflex the hub already ran.
    Reflex(MessageBody),
    /// Legacy re-pair notice; ask the hub to describe the device.
    LegacyPaired,
    /// Legacy unpair notice; mark the device lost.
    LegacyUnpaired,
    Deliver,
}

fn classify(message: &ProtocolMessage) -> ProtocolRoute {
    if let ProtocolPayload::Reflex(body) = &message.payload {
        return ProtocolRoute::Reflex(body.clone());
    }
    if !matches!(message.header.source, Address::Protocol(_)) {
        return ProtocolRoute::Deliver;
    }
    match message.control() {
        Some(ControlEvent::DeviceOnline {
            message: Some(text),
        }) if text == names::LEGACY_PAIRED => ProtocolRoute::LegacyPaired,
        Some(ControlEvent::DeviceOffline {
            message: Some(text),
        }) if text == names::LEGACY_UNPAIRED => ProtocolRoute::LegacyUnpaired,
        _ => ProtocolRoute::Deliver,
    }
}

/// Broadcasts from the protocol side are routed by their source.
#[inline]
fn protocol_target(header: &MessageHeader) -> &Address {
    if header.destination.is_broadcast() {
        &header.source
    } else {
        &header.destination
    }
}

pub struct MessageRouter {
    settings: Settings,
    registry: Arc<ExecutorRegistry>,
    service: Arc<DeviceServiceHandler>,
    recovery: Arc<LostDeviceRecovery>,
    protocol_bus: Arc<dyn MessageBus<ProtocolMessage>>,
    platform_bus: Arc<dyn MessageBus<PlatformMessage>>,
    workers: Arc<Semaphore>,
    shutdown_token: CancellationToken,
}

impl MessageRouter {
    pub fn new(
        settings: Settings,
        registry: Arc<ExecutorRegistry>,
        service: Arc<DeviceServiceHandler>,
        recovery: Arc<LostDeviceRecovery>,
        protocol_bus: Arc<dyn MessageBus<ProtocolMessage>>,
        platform_bus: Arc<dyn MessageBus<PlatformMessage>>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(settings.service.max_workers.max(1)));
        Self {
            settings,
            registry,
            service,
            recovery,
            protocol_bus,
            platform_bus,
            workers,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Subscribes to both buses with the configured matchers and starts consuming.
    pub fn start(self: &Arc<Self>) -> HubResult<()> {
        let protocol_matchers = self.settings.service.protocol_address_matchers();
        let platform_matchers = self.settings.service.platform_address_matchers();
        info!(
            protocol = ?self.settings.service.protocol_matchers,
            platform = ?self.settings.service.platform_matchers,
            workers = self.settings.service.max_workers,
            "Starting message router"
        );
        let protocol_rx = self.protocol_bus.subscribe(protocol_matchers)?;
        let platform_rx = self.platform_bus.subscribe(platform_matchers)?;
        tokio::spawn(Arc::clone(self).consume(protocol_rx, "protocol"));
        tokio::spawn(Arc::clone(self).consume(platform_rx, "platform"));
        Ok(())
    }

    /// Stops consuming; messages already handed to workers still complete.
    pub fn stop(&self) {
        debug!("Stopping message router");
        self.shutdown_token.cancel();
    }

    #[instrument(name = "router-consume", skip_all, fields(bus = bus))]
    async fn consume<M>(self: Arc<Self>, mut rx: mpsc::Receiver<M>, bus: &'static str)
    where
        M: Into<Message> + Send + 'static,
    {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.shutdown_token.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            let permit = tokio::select! {
                biased;
                _ = self.shutdown_token.cancelled() => break,
                permit = Arc::clone(&self.workers).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let router = Arc::clone(&self);
            tokio::spawn(async move {
                router.deliver(message.into()).await;
                drop(permit);
            });
        }
        debug!("Bus consumer stopped");
    }

    /// Routes one message. Expired messages are dropped unprocessed.
    pub async fn deliver(&self, message: Message) {
        if message.header().is_expired() {
            debug!(source = %message.header().source, "Dropping expired message");
            return;
        }
        match message {
            Message::Protocol(message) => self.handle_protocol_message(message).await,
            Message::Platform(message) => self.handle_platform_message(message).await,
        }
    }

    // === Protocol side ===

    async fn handle_protocol_message(&self, message: ProtocolMessage) {
        trace!(source = %message.header.source, "Received protocol message");
        match classify(&message) {
            ProtocolRoute::Reflex(body) => {
                if let Err(e) = self.handle_reflex(&message, body).await {
                    warn!(source = %message.header.source, error = %e, "Failed to process reflex message");
                }
                return;
            }
            ProtocolRoute::LegacyPaired => {
                debug!(source = %message.header.source, "Legacy PAIRED message, attempting to re-add");
                if let Err(e) = self
                    .recovery
                    .send_get_device_info(&message.header.source, message.header.place_id)
                    .await
                {
                    warn!(source = %message.header.source, error = %e, "Failed to request device info");
                }
                return;
            }
            ProtocolRoute::LegacyUnpaired => {
                debug!(source = %message.header.source, "Legacy UNPAIRED message, marking as lost");
                let result = match self.registry.resolve(&message.header.source).await {
                    Ok(executor) => {
                        self.recovery
                            .send_lost_device(
                                &Address::Driver(executor.driver_address()),
                                executor.place_id(),
                            )
                            .await
                    }
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(source = %message.header.source, error = %e, "Failed to mark device lost");
                    self.send_error(&message.header, &e).await;
                }
                return;
            }
            ProtocolRoute::Deliver => {}
        }

        let header = message.header.clone();
        let target = protocol_target(&header);
        let delivered = match self.registry.resolve(target).await {
            Ok(executor) => executor
                .fire(DriverEvent::Message(Message::Protocol(message)))
                .map(|_| ()),
            Err(e) if e.is_not_found() => {
                warn!(source = %header.source, "Received protocol message for unrecognized address");
                if let Err(e) = self
                    .recovery
                    .try_restore(&header.source, header.place_id)
                    .await
                {
                    warn!(source = %header.source, error = %e, "Failed to restore lost device");
                }
                return;
            }
            Err(e) => Err(e),
        };
        if let Err(e) = delivered {
            warn!(source = %header.source, error = %e, "Error processing protocol message");
            self.send_error(&header, &e).await;
        }
    }

    async fn handle_reflex(&self, message: &ProtocolMessage, body: MessageBody) -> HubResult<()> {
        let executor = self
            .registry
            .resolve(protocol_target(&message.header))
            .await?;
        if !executor.driver().definition().reflexes.is_hub_local() {
            // some built-in drivers send reflex output regardless of driver version
            trace!(device = %executor.driver_address(), "Reflex message from driver with no reflexes, ignoring");
            return Ok(());
        }

        if body.message_type == names::SET_ATTRIBUTES {
            let attributes: AttributeMap = body.attributes.into_iter().collect();
            let _ = executor.sync_attributes(attributes, message.header.reflex_version, true)?;
            return Ok(());
        }

        let population = self.recovery.population_of(executor.place_id()).await;
        let event = PlatformMessage::broadcast(Address::Driver(executor.driver_address()), body)
            .with_place(executor.place_id(), Some(population))
            .with_actor(message.header.actor.clone());
        self.platform_bus.send(event).await
    }

    async fn send_error(&self, header: &MessageHeader, error: &HubError) {
        let population = match &header.population {
            Some(population) => population.clone(),
            None => self.recovery.population_of(header.place_id).await,
        };
        let reply = ProtocolMessage::new(
            Address::device_service(),
            header.source.clone(),
            ProtocolPayload::Control(ControlEvent::Error {
                code: error.code().to_string(),
                message: error.to_string(),
            }),
        )
        .with_place(header.place_id, Some(population));
        if let Err(e) = self.protocol_bus.send(reply).await {
            warn!(destination = %header.source, error = %e, "Unable to deliver protocol error");
        }
    }

    // === Platform side ===

    async fn handle_platform_message(&self, message: PlatformMessage) {
        trace!(
            destination = %message.header.destination,
            message_type = message.message_type(),
            "Received platform message"
        );
        if self.service.handles(&message) {
            match self.service.handle(&message).await {
                Ok(Some(body)) if message.header.is_request => self.reply(&message, body).await,
                Ok(_) => {}
                Err(e) => {
                    warn!(message_type = message.message_type(), error = %e, "Device service failed");
                    self.reply_error(&message, &e).await;
                }
            }
            return;
        }

        if !matches!(message.header.destination, Address::Driver(_)) {
            trace!(destination = %message.header.destination, "Ignoring platform message");
            return;
        }

        let delivered = match self.registry.resolve(&message.header.destination).await {
            Ok(executor) => executor
                .fire(DriverEvent::Message(Message::Platform(message.clone())))
                .map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = delivered {
            if e.is_not_found() {
                debug!(destination = %message.header.destination, "Platform message for unknown device");
            } else {
                warn!(destination = %message.header.destination, error = %e, "Error delivering platform message");
            }
            self.reply_error(&message, &e).await;
        }
    }

    async fn reply(&self, request: &PlatformMessage, body: MessageBody) {
        if let Err(e) = self.platform_bus.send(request.respond(body)).await {
            warn!(destination = %request.header.source, error = %e, "Unable to send response");
        }
    }

    async fn reply_error(&self, request: &PlatformMessage, error: &HubError) {
        if request.header.is_request {
            self.reply(request, MessageBody::error(error.code(), error.to_string()))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ng_devhub_models::address::ProtocolAddress;

    fn control(event: ControlEvent) -> ProtocolMessage {
        ProtocolMessage::new(
            Address::Protocol(ProtocolAddress::new(Some("HUB".into()), "ZIGB", "01")),
            Address::Broadcast,
            ProtocolPayload::Control(event),
        )
    }

    #[test]
    fn legacy_markers_are_recognized() {
        assert_eq!(
            classify(&control(ControlEvent::DeviceOnline {
                message: Some("PAIRED".into())
            })),
            ProtocolRoute::LegacyPaired
        );
        assert_eq!(
            classify(&control(ControlEvent::DeviceOffline {
                message: Some("UNPAIRED".into())
            })),
            ProtocolRoute::LegacyUnpaired
        );
        assert_eq!(
            classify(&control(ControlEvent::DeviceOnline { message: None })),
            ProtocolRoute::Deliver
        );
    }

    #[test]
    fn broadcasts_route_by_source() {
        let message = control(ControlEvent::DeviceOnline { message: None });
        assert_eq!(protocol_target(&message.header), &message.header.source);
    }
}
