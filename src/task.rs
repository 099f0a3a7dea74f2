//! Handle for long-running background task groups
//!
//! Spawning a component's background work returns a handle exposing a stop
//! request and a join rendezvous. The handle's presence inside a component's
//! status mutex is the "is running" witness.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) struct TaskHandle {
    cancel: CancellationToken,
    joins: Vec<JoinHandle<()>>,
}

impl TaskHandle {
    pub(crate) fn new(cancel: CancellationToken, joins: Vec<JoinHandle<()>>) -> Self {
        Self { cancel, joins }
    }

    /// Signal the task group to stop; does not wait
    pub(crate) fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for every task in the group to exit
    pub(crate) async fn await_stopped(self) {
        for join in self.joins {
            if let Err(err) = join.await {
                if err.is_panic() {
                    tracing::error!(error = %err, "background task panicked");
                }
            }
        }
    }

    /// Request stop and block until the whole group has exited
    pub(crate) async fn stop(self) {
        self.request_stop();
        self.await_stopped().await;
    }
}
