//! Presence and observation of a Consul-style coordination service
//!
//! Two long-running units built on a shared client abstraction:
//!
//! - [`ServiceLifecycleManager`] registers one local service instance and
//!   keeps it alive with TTL heartbeats, re-registering whenever the registry
//!   silently forgets it.
//! - [`SubtreeWatcher`] long-polls a key-value prefix and delivers debounced
//!   snapshots to a consumer, retrying transient failures forever.
//!
//! [`ServerSelector`] picks the connection target once, up front, by probing
//! every candidate endpoint for reachability and latency. Lifecycle
//! milestones are published on an [`EventBus`] for supervisory collaborators.

pub mod client;
pub mod error;
pub mod events;
pub mod http;
pub mod retry;
pub mod service;
pub mod watcher;

mod task;

pub use client::{
    CheckStatus, CoordinationClient, Endpoint, KvPair, KvSnapshot, ProbeResult, ServerSelector,
    ServiceCheck, ServiceDescriptor, ServiceSummary,
};
pub use error::{Error, Result};
pub use events::{EventBus, StateEvent};
pub use retry::RetryPolicy;
pub use service::{ServiceLifecycleManager, ServiceOptions};
pub use watcher::{SubtreeWatcher, WatcherOptions};
