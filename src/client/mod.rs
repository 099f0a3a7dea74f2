//! Coordination-service client boundary
//!
//! The wire protocol lives behind [`CoordinationClient`]; this crate only
//! consumes structured results. Endpoint modeling and server selection sit
//! alongside the trait because they decide which server the client talks to.

pub mod endpoint;
pub mod selector;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use endpoint::{Endpoint, ProbeResult};
pub use selector::ServerSelector;

/// One key-value entry under a watched prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    pub key: String,
    #[serde(default)]
    pub value: Vec<u8>,
    /// Index of the last write that touched this key
    #[serde(default)]
    pub modify_index: u64,
}

/// Result of one long-poll listing: the pairs plus the index to resume from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvSnapshot {
    pub pairs: Vec<KvPair>,
    pub index: u64,
}

/// Health check attached to a service registration
///
/// Mirrors the registry's check object: exactly one of the `ttl` / `http`
/// groups is populated per check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCheck {
    pub check_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deregister_critical_service_after: Option<String>,
}

impl ServiceCheck {
    /// TTL check: failing unless refreshed within `ttl`
    #[must_use]
    pub fn ttl(check_id: String, ttl: String, deregister_after: String) -> Self {
        Self {
            check_id,
            ttl: Some(ttl),
            http: None,
            interval: None,
            timeout: None,
            deregister_critical_service_after: Some(deregister_after),
        }
    }

    /// Interval-based HTTP check against `url`
    #[must_use]
    pub fn http(check_id: String, url: String, interval: String, timeout: String) -> Self {
        Self {
            check_id,
            ttl: None,
            http: Some(url),
            interval: Some(interval),
            timeout: Some(timeout),
            deregister_critical_service_after: None,
        }
    }
}

/// Service registration descriptor sent to the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: HashMap<String, String>,
    pub checks: Vec<ServiceCheck>,
}

/// Entry in the registry's service listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
}

/// TTL check status reported to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passing,
    Warning,
    Critical,
}

impl CheckStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Passing => "passing",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Request/response client for the coordination service
///
/// Implementations perform the actual HTTP calls; everything in this crate
/// goes through this trait so tests can substitute a scripted fake.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Blocking long-poll listing of a key prefix
    ///
    /// Blocks server-side until the subtree changes past `last_index` or
    /// `max_wait` elapses, whichever comes first.
    async fn list_subtree(
        &self,
        prefix: &str,
        last_index: u64,
        max_wait: Duration,
    ) -> Result<KvSnapshot>;

    /// List services currently known to the registry, keyed by service id
    async fn list_services(&self) -> Result<HashMap<String, ServiceSummary>>;

    /// Register (or re-register) a service instance
    async fn register_service(&self, descriptor: &ServiceDescriptor) -> Result<()>;

    /// Remove a service instance from the registry
    async fn deregister_service(&self, service_id: &str) -> Result<()>;

    /// Refresh a TTL check with the given status and timestamp
    async fn update_ttl_check(
        &self,
        check_id: &str,
        timestamp: &str,
        status: CheckStatus,
    ) -> Result<()>;
}
