use futures::future::BoxFuture;
use ng_devhub_models::services::{ScheduledTask, Scheduler};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Scheduler backed by detached tokio tasks.
#[derive(Debug, Clone, Default)]
pub struct TokioScheduler {
    /// Parent of every scheduled task; cancelling it drops all pending work.
    shutdown_token: CancellationToken,
}

impl TokioScheduler {
    pub fn new(shutdown_token: CancellationToken) -> Self {
        Self { shutdown_token }
    }

    pub fn shutdown(&self) {
        self.shutdown_token.cancel()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_delayed(&self, task: BoxFuture<'static, ()>, delay: Duration) -> ScheduledTask {
        let token = self.shutdown_token.child_token();
        let handle = ScheduledTask::new(token.clone());
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    trace!("Scheduled task cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    task.await;
                }
            }
        });
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    #[tokio::test(start_paused = true)]
    async fn runs_after_delay_unless_cancelled() {
        let scheduler = TokioScheduler::default();
        let ran = Arc::new(AtomicBool::new(false));
        let cancelled_ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        scheduler.schedule_delayed(
            async move { flag.store(true, Ordering::SeqCst) }.boxed(),
            Duration::from_secs(5),
        );
        let flag = Arc::clone(&cancelled_ran);
        let task = scheduler.schedule_delayed(
            async move { flag.store(true, Ordering::SeqCst) }.boxed(),
            Duration::from_secs(5),
        );
        task.cancel();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(ran.load(Ordering::SeqCst));
        assert!(!cancelled_ran.load(Ordering::SeqCst));
    }
}
