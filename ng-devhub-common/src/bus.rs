use async_trait::async_trait;
use ng_devhub_error::HubResult;
use ng_devhub_models::{
    address::AddressMatcher,
    message::BusMessage,
    services::MessageBus,
};
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc,
};
use tracing::{debug, trace, warn};

/// In-process bus: one broadcast channel fanned out to address-filtered subscribers.
#[derive(Debug, Clone)]
pub struct NGMessageBus<M: BusMessage> {
    name: &'static str,
    sender: broadcast::Sender<M>,
    capacity: usize,
}

impl<M: BusMessage> NGMessageBus<M> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name,
            sender,
            capacity: capacity.max(1),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.name
    }

    #[inline]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl<M: BusMessage> MessageBus<M> for NGMessageBus<M> {
    async fn send(&self, message: M) -> HubResult<()> {
        if self.sender.send(message).is_err() {
            trace!(bus = self.name, "No subscribers, message dropped");
        }
        Ok(())
    }

    fn subscribe(&self, matchers: Vec<AddressMatcher>) -> HubResult<mpsc::Receiver<M>> {
        let mut source = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(self.capacity);
        let name = self.name;
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(message) => {
                        if !AddressMatcher::any_matches(&matchers, &message.header().destination) {
                            continue;
                        }
                        if tx.send(message).await.is_err() {
                            debug!(bus = name, "Subscriber dropped, stopping forwarder");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(bus = name, skipped, "Subscriber lagged, messages skipped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ng_devhub_models::{
        address::Address,
        message::{MessageBody, PlatformMessage},
    };
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn subscribers_only_see_matching_destinations() {
        let bus: NGMessageBus<PlatformMessage> = NGMessageBus::new("platform", 16);
        let mut services = bus
            .subscribe(vec![AddressMatcher::parse("SERV:*")])
            .unwrap();
        let mut everything = bus.subscribe(vec![AddressMatcher::Any]).unwrap();

        bus.send(PlatformMessage::broadcast(
            Address::device_service(),
            MessageBody::new("base:ValueChange"),
        ))
        .await
        .unwrap();
        bus.send(PlatformMessage::request(
            Address::hub_service("HUB-1"),
            Address::device_service(),
            MessageBody::new("devsvc:SyncDevices"),
        ))
        .await
        .unwrap();

        let first = timeout(Duration::from_secs(1), services.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.message_type(), "devsvc:SyncDevices");

        let a = timeout(Duration::from_secs(1), everything.recv())
            .await
            .unwrap()
            .unwrap();
        let b = timeout(Duration::from_secs(1), everything.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.message_type(), "base:ValueChange");
        assert_eq!(b.message_type(), "devsvc:SyncDevices");
    }
}
