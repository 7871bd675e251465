//! Collaborator seams the hub core depends on.

use crate::{address::AddressMatcher, message::BusMessage};
use async_trait::async_trait;
use futures::future::BoxFuture;
use ng_devhub_error::HubResult;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Handle to a task scheduled with a [`Scheduler`].
#[derive(Debug, Clone, Default)]
pub struct ScheduledTask {
    token: CancellationToken,
}

impl ScheduledTask {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Cancels the task if it has not run yet.
    #[inline]
    pub fn cancel(&self) {
        self.token.cancel()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub trait Scheduler: Send + Sync + 'static {
    /// Runs `task` after `delay` on a background task.
    fn schedule_delayed(&self, task: BoxFuture<'static, ()>, delay: Duration) -> ScheduledTask;
}

#[async_trait]
pub trait PopulationResolver: Send + Sync + 'static {
    async fn get_population_by_place_id(&self, place_id: Option<Uuid>) -> String;
}

/// Publish/subscribe bus for one message family.
#[async_trait]
pub trait MessageBus<M: BusMessage>: Send + Sync + 'static {
    async fn send(&self, message: M) -> HubResult<()>;

    /// Stream of messages whose destination matches any of `matchers`.
    fn subscribe(&self, matchers: Vec<AddressMatcher>) -> HubResult<mpsc::Receiver<M>>;
}
