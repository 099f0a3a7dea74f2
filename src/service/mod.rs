//! Service registration lifecycle
//!
//! Keeps one local service instance present in the remote registry for as
//! long as it is wanted. The registry can silently drop a registration (TTL
//! expiry, agent restart) without telling us, so the heartbeat task polls the
//! service listing on every tick and re-registers whenever the id has gone
//! missing, instead of relying on a push notification channel.

mod descriptor;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace, warn};

use descriptor::ttl_check_id;

use crate::client::{CheckStatus, CoordinationClient, ServiceDescriptor};
use crate::error::Result;
use crate::events::{EventBus, StateEvent};
use crate::task::TaskHandle;

/// Default advertised host
const DEFAULT_HOST: &str = "127.0.0.1";
/// Default advertised scheme
const DEFAULT_SCHEME: &str = "http";
/// Default grace before the registry drops a critical service
const DEFAULT_DEREGISTER_AFTER: Duration = Duration::from_secs(60);
/// Default heartbeat interval
const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
/// Default health-check timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a [`ServiceLifecycleManager`]
pub struct ServiceOptions {
    pub client: Arc<dyn CoordinationClient>,
    pub events: EventBus,
    pub name: String,
    /// Distinguishes multiple instances of the same service on one host
    pub qualifier: Option<String>,
    /// Caller metadata merged over the built-in build/platform facts
    pub extra_meta: HashMap<String, String>,
    pub tags: Vec<String>,
    /// Empty string selects the default scheme
    pub scheme: String,
    /// Empty string selects the default host
    pub host: String,
    pub port: u16,
    /// Serve the local `/health` endpoint and attach an HTTP check
    pub health_endpoint: bool,
    pub deregister_after: Option<Duration>,
    pub interval: Option<Duration>,
    pub timeout: Option<Duration>,
}

/// Maintains registry presence for one local service instance
pub struct ServiceLifecycleManager {
    client: Arc<dyn CoordinationClient>,
    events: EventBus,
    name: String,
    qualifier: Option<String>,
    extra_meta: HashMap<String, String>,
    tags: Vec<String>,
    scheme: String,
    host: String,
    port: u16,
    health_endpoint: bool,
    deregister_after: Duration,
    interval: Duration,
    timeout: Duration,

    heartbeat: Mutex<Option<TaskHandle>>,
    health_server: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceLifecycleManager {
    /// Create a manager, applying defaults for any unset option
    #[must_use]
    pub fn new(options: ServiceOptions) -> Self {
        options.events.publish(StateEvent::CreatingService);

        let manager = Self {
            client: options.client,
            events: options.events,
            name: options.name,
            qualifier: options.qualifier,
            extra_meta: options.extra_meta,
            tags: options.tags,
            scheme: if options.scheme.is_empty() {
                DEFAULT_SCHEME.to_string()
            } else {
                options.scheme
            },
            host: if options.host.is_empty() {
                DEFAULT_HOST.to_string()
            } else {
                options.host
            },
            port: options.port,
            health_endpoint: options.health_endpoint,
            deregister_after: options.deregister_after.unwrap_or(DEFAULT_DEREGISTER_AFTER),
            interval: options.interval.unwrap_or(DEFAULT_INTERVAL),
            timeout: options.timeout.unwrap_or(DEFAULT_TIMEOUT),
            heartbeat: Mutex::new(None),
            health_server: Mutex::new(None),
        };

        manager.events.publish(StateEvent::ServiceCreated);
        manager
    }

    /// Advertised `host:port` string
    #[must_use]
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Advertised full URL
    #[must_use]
    pub fn full_url(&self) -> String {
        format!("{}://{}", self.scheme, self.host_port())
    }

    /// Register this service and launch the heartbeat task
    ///
    /// Returns without blocking on network I/O: the remote registration
    /// happens inside the heartbeat task, and confirmation is eventually
    /// consistent. Fails only when the descriptor cannot be built (local
    /// hostname unresolvable). A second call while registered is a no-op.
    pub fn register(&self) -> Result<()> {
        {
            let mut heartbeat = self.heartbeat.lock();
            if heartbeat.is_some() {
                warn!(service = %self.name, "service already registered, ignoring");
                return Ok(());
            }

            let built = descriptor::build(&descriptor::DescriptorSpec {
                name: &self.name,
                qualifier: self.qualifier.as_deref(),
                extra_meta: &self.extra_meta,
                tags: &self.tags,
                scheme: &self.scheme,
                host: &self.host,
                port: self.port,
                http_check: self.health_endpoint,
                deregister_after: self.deregister_after,
                interval: self.interval,
                timeout: self.timeout,
            })?;

            if self.health_endpoint {
                *self.health_server.lock() = Some(crate::http::spawn(self.port));
            }

            let cancel = CancellationToken::new();
            let join = tokio::spawn(heartbeat_loop(
                self.client.clone(),
                self.events.clone(),
                built,
                self.interval,
                cancel.clone(),
            ));
            *heartbeat = Some(TaskHandle::new(cancel, vec![join]));
        }

        self.events.publish(StateEvent::ServiceRegistered);
        Ok(())
    }

    /// Stop the heartbeat task and remove the service from the registry
    ///
    /// Blocks until the heartbeat task has issued the remote deregister call
    /// and exited. Calling this without a live registration is a no-op.
    pub async fn deregister(&self) -> Result<()> {
        let handle = self.heartbeat.lock().take();
        let Some(handle) = handle else {
            warn!(service = %self.name, "this service is not registered");
            return Ok(());
        };

        handle.stop().await;

        if let Some(server) = self.health_server.lock().take() {
            server.abort();
        }

        self.events.publish(StateEvent::ServiceDeregistered);
        Ok(())
    }
}

/// Refresh the TTL check with a passing status and the current UTC timestamp
async fn pass_ttl(client: &Arc<dyn CoordinationClient>, check_id: &str) {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    if let Err(err) = client
        .update_ttl_check(check_id, &timestamp, CheckStatus::Passing)
        .await
    {
        error!(check_id = %check_id, error = %err, "unable to pass TTL check");
    }
}

/// Heartbeat loop: heal missing registrations, refresh the TTL, and
/// deregister on stop
async fn heartbeat_loop(
    client: Arc<dyn CoordinationClient>,
    events: EventBus,
    descriptor: ServiceDescriptor,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut service_id: Option<String> = None;
    let mut current_check_id: Option<String> = None;

    loop {
        let present = match &service_id {
            None => false,
            Some(id) => match client.list_services().await {
                Ok(services) => services.contains_key(id),
                Err(err) => {
                    error!(error = %err, "cannot retrieve list of services");
                    events.publish(StateEvent::RestartRequested);
                    false
                }
            },
        };

        if !present {
            match client.register_service(&descriptor).await {
                Ok(()) => {
                    trace!(
                        service = %descriptor.name,
                        service_id = %descriptor.id,
                        address = %descriptor.address,
                        "registered service"
                    );
                    for check in &descriptor.checks {
                        trace!(
                            check_id = %check.check_id,
                            service_id = %descriptor.id,
                            "registered check"
                        );
                    }
                    let check_id = ttl_check_id(&descriptor.id);
                    pass_ttl(&client, &check_id).await;
                    service_id = Some(descriptor.id.clone());
                    current_check_id = Some(check_id);
                }
                Err(err) => {
                    error!(
                        service = %descriptor.name,
                        error = %err,
                        "failed to register service in registry"
                    );
                    events.publish(StateEvent::RestartRequested);
                    service_id = None;
                    current_check_id = None;
                }
            }
        }

        tokio::select! {
            () = cancel.cancelled() => {
                if let Some(id) = &service_id {
                    trace!(service_id = %id, "deregistering service");
                    if let Err(err) = client.deregister_service(id).await {
                        error!(service_id = %id, error = %err, "failed to deregister service");
                    }
                }
                return;
            }
            () = tokio::time::sleep(interval) => {
                if let Some(check_id) = &current_check_id {
                    pass_ttl(&client, check_id).await;
                }
            }
        }
    }
}
