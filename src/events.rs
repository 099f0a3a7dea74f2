//! Lifecycle milestone events broadcast to collaborators
//!
//! Components publish coarse state transitions here so an upstream supervisor
//! can observe connection setup, registration progress, and restart requests
//! without being wired into each component directly.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default capacity of the event bus broadcast channel
const EVENT_BUS_CAPACITY: usize = 64;

/// Lifecycle milestones published by the selector, lifecycle manager and watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateEvent {
    /// Candidate endpoints supplied, no server selected yet
    ConfigurationPending,
    /// A reachable endpoint was selected as the active connection target
    Configured,
    /// Service lifecycle manager construction started
    CreatingService,
    /// Service lifecycle manager construction finished
    ServiceCreated,
    /// Service descriptor built and heartbeat task launched
    ServiceRegistered,
    /// Heartbeat task exited after issuing the remote deregister call
    ServiceDeregistered,
    /// A remote call failed in a way that suggests the session is unhealthy;
    /// an upstream supervisor may want to rebuild the connection
    RestartRequested,
}

impl StateEvent {
    /// Get a short description of the event type
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigurationPending => "configuration_pending",
            Self::Configured => "configured",
            Self::CreatingService => "creating_service",
            Self::ServiceCreated => "service_created",
            Self::ServiceRegistered => "service_registered",
            Self::ServiceDeregistered => "service_deregistered",
            Self::RestartRequested => "restart_requested",
        }
    }
}

/// Broadcast bus for lifecycle events
///
/// Cloning is cheap; all clones publish into the same channel. Publishing
/// never blocks and never fails: with no subscribers the event is dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StateEvent>,
}

impl EventBus {
    /// Create a bus with a custom channel capacity
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: StateEvent) {
        tracing::debug!(event = event.as_str(), "publishing lifecycle event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to lifecycle events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(EVENT_BUS_CAPACITY)
    }
}
