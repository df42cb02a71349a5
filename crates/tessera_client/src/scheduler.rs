//! Deferred flush scheduling on the tokio timer wheel.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Fires deferred flush tasks after a configured delay.
///
/// `stop` cancels every firing that has not happened yet; tasks already
/// past their delay run to completion. Registrations are cheap, so many
/// small timeouts may be outstanding at once.
pub struct FlushScheduler {
    shutdown: CancellationToken,
}

impl FlushScheduler {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
        }
    }

    /// Run `task` after `delay` unless the scheduler is stopped first.
    pub fn after<F>(&self, delay: Duration, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => task.await,
            }
        })
    }

    /// Cancel all pending firings.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Default for FlushScheduler {
    fn default() -> Self {
        Self::new()
    }
}
