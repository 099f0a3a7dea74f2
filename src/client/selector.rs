//! Best-server selection over a set of candidate endpoints
//!
//! Consulted once per connection lifetime: probe every candidate, keep the
//! reachable ones, pick the lowest latency. The process cannot do anything
//! useful without a coordination-service connection, so total unreachability
//! exits instead of returning an error.

use futures::future::join_all;
use tracing::{error, info, warn};

use super::endpoint::{Endpoint, ProbeResult};
use crate::events::{EventBus, StateEvent};

/// Picks the active connection target from an ordered set of candidates
pub struct ServerSelector {
    endpoints: Vec<Endpoint>,
    events: EventBus,
}

impl ServerSelector {
    /// Create a selector over an ordered set of candidate endpoints
    ///
    /// Endpoints are normalized on the way in. Publishes
    /// `ConfigurationPending` until a server has been selected.
    #[must_use]
    pub fn new(endpoints: Vec<Endpoint>, events: EventBus) -> Self {
        events.publish(StateEvent::ConfigurationPending);
        Self {
            endpoints: endpoints.into_iter().map(Endpoint::normalized).collect(),
            events,
        }
    }

    #[must_use]
    pub fn is_single_server(&self) -> bool {
        self.endpoints.len() == 1
    }

    /// Select the reachable endpoint with the lowest round-trip latency
    ///
    /// Fatal when no endpoint is reachable: logs and terminates the process.
    pub async fn select_best_server(&self) -> Endpoint {
        match self.try_select().await {
            Some(endpoint) => {
                self.events.publish(StateEvent::Configured);
                endpoint
            }
            None => {
                error!("no alive coordination servers available to connect to");
                std::process::exit(1);
            }
        }
    }

    /// Probe all candidates and pick the best, or `None` if all unreachable
    ///
    /// This is the fallible core of [`Self::select_best_server`]; the fatal
    /// wrapper above only adds the exit.
    pub async fn try_select(&self) -> Option<Endpoint> {
        let results = join_all(self.endpoints.iter().map(Endpoint::probe)).await;

        for (endpoint, result) in self.endpoints.iter().zip(&results) {
            if !result.reachable {
                warn!(
                    server = %endpoint.host_port(),
                    "server is not available for connection"
                );
            }
        }

        let winner = pick_best(&results)?;
        let endpoint = self.endpoints[winner].clone();
        info!(
            server = %endpoint.host_port(),
            round_trip_ms = results[winner].round_trip_ms,
            "selected target server"
        );
        Some(endpoint)
    }
}

/// Index of the first reachable result with the strictly minimal round trip
fn pick_best(results: &[ProbeResult]) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;
    for (index, result) in results.iter().enumerate() {
        if !result.reachable {
            continue;
        }
        match best {
            Some((_, best_rtt)) if result.round_trip_ms >= best_rtt => {}
            _ => best = Some((index, result.round_trip_ms)),
        }
    }
    best.map(|(index, _)| index)
}
