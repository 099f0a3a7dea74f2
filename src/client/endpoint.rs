//! Candidate coordination-service endpoints and reachability probing

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{timeout, Instant};

/// Default scheme applied when none is configured
pub const DEFAULT_SCHEME: &str = "http";
/// Default host applied when none is configured
pub const DEFAULT_HOST: &str = "localhost";
/// Default port applied when none is configured
pub const DEFAULT_PORT: u16 = 8500;
/// Default data center applied when none is configured
pub const DEFAULT_DATA_CENTER: &str = "dc0";

/// Bound on the TCP connect check during probing
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// One candidate coordination-service endpoint
///
/// Immutable once a connection target has been chosen. Empty fields are
/// filled with compiled-in defaults by [`Endpoint::normalized`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub data_center: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_string(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            data_center: DEFAULT_DATA_CENTER.to_string(),
            access_token: None,
        }
    }
}

impl Endpoint {
    /// Create an endpoint for `host:port` with defaults for everything else
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Fill empty fields with the compiled-in defaults
    ///
    /// Pure normalization: the defaults are constants, not process state.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.scheme.is_empty() {
            self.scheme = DEFAULT_SCHEME.to_string();
        }
        if self.host.is_empty() {
            self.host = DEFAULT_HOST.to_string();
        }
        if self.port == 0 {
            self.port = DEFAULT_PORT;
        }
        if self.data_center.is_empty() {
            self.data_center = DEFAULT_DATA_CENTER.to_string();
        }
        self
    }

    /// `host:port` string for this endpoint
    #[must_use]
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Full URL for this endpoint
    #[must_use]
    pub fn full_url(&self) -> String {
        format!("{}://{}", self.scheme, self.host_port())
    }

    #[must_use]
    pub fn uses_access_token(&self) -> bool {
        self.access_token.as_deref().is_some_and(|token| !token.is_empty())
    }

    /// Bounded-time TCP connect check
    pub async fn is_available(&self) -> bool {
        matches!(
            timeout(PROBE_TIMEOUT, TcpStream::connect(self.host_port())).await,
            Ok(Ok(_))
        )
    }

    /// Measure DNS resolution time plus connection-establishment time, in ms
    ///
    /// Returns `None` when the endpoint cannot be resolved or connected to
    /// within the probe bound.
    pub async fn round_trip_ms(&self) -> Option<u64> {
        let probe = async {
            let dns_started = Instant::now();
            let mut addrs = lookup_host(self.host_port()).await.ok()?;
            let dns_elapsed = dns_started.elapsed();

            let addr = addrs.next()?;
            let connect_started = Instant::now();
            TcpStream::connect(addr).await.ok()?;
            let connect_elapsed = connect_started.elapsed();

            Some(u64::try_from((dns_elapsed + connect_elapsed).as_millis()).unwrap_or(u64::MAX))
        };

        timeout(PROBE_TIMEOUT, probe).await.ok().flatten()
    }

    /// Full probe: availability check, then latency measurement
    ///
    /// A single-endpoint configuration takes this same path so latency and
    /// availability logging are identical regardless of topology size.
    pub async fn probe(&self) -> ProbeResult {
        if !self.is_available().await {
            return ProbeResult {
                reachable: false,
                round_trip_ms: 0,
            };
        }
        match self.round_trip_ms().await {
            Some(rtt) => ProbeResult {
                reachable: true,
                round_trip_ms: rtt,
            },
            None => ProbeResult {
                reachable: false,
                round_trip_ms: 0,
            },
        }
    }
}

/// Outcome of probing one endpoint; discarded after the selection round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub reachable: bool,
    pub round_trip_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_endpoint() {
        let endpoint = Endpoint::default();
        assert_eq!(endpoint.scheme, "http");
        assert_eq!(endpoint.host, "localhost");
        assert_eq!(endpoint.port, 8500);
        assert_eq!(endpoint.data_center, "dc0");
        assert!(endpoint.access_token.is_none());
    }

    #[test]
    fn test_normalized_fills_empty_fields() {
        let endpoint = Endpoint {
            scheme: String::new(),
            host: String::new(),
            port: 0,
            data_center: String::new(),
            access_token: None,
        }
        .normalized();

        assert_eq!(endpoint, Endpoint::default());
    }

    #[test]
    fn test_normalized_keeps_configured_fields() {
        let endpoint = Endpoint {
            scheme: "https".to_string(),
            host: "10.0.0.5".to_string(),
            port: 8501,
            data_center: "dc1".to_string(),
            access_token: Some("secret".to_string()),
        }
        .normalized();

        assert_eq!(endpoint.scheme, "https");
        assert_eq!(endpoint.host, "10.0.0.5");
        assert_eq!(endpoint.port, 8501);
        assert_eq!(endpoint.data_center, "dc1");
        assert!(endpoint.uses_access_token());
    }

    #[test]
    fn test_derived_strings() {
        let endpoint = Endpoint::new("10.0.0.5", 8500);
        assert_eq!(endpoint.host_port(), "10.0.0.5:8500");
        assert_eq!(endpoint.full_url(), "http://10.0.0.5:8500");
    }

    #[test]
    fn test_empty_access_token_not_used() {
        let endpoint = Endpoint {
            access_token: Some(String::new()),
            ..Endpoint::default()
        };
        assert!(!endpoint.uses_access_token());
    }

    #[tokio::test]
    async fn test_probe_reachable_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let endpoint = Endpoint::new("127.0.0.1", port);
        let result = endpoint.probe().await;
        assert!(result.reachable);
    }

    #[tokio::test]
    async fn test_probe_unreachable_port() {
        // Bind then drop to get a port with no listener
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint::new("127.0.0.1", port);
        let result = endpoint.probe().await;
        assert!(!result.reachable);
    }
}
