//! Service registration descriptor construction

use std::collections::HashMap;
use std::time::Duration;

use crate::client::{ServiceCheck, ServiceDescriptor};
use crate::error::{Error, Result};

/// Inputs for one descriptor build, resolved from the manager's configuration
pub(crate) struct DescriptorSpec<'a> {
    pub name: &'a str,
    pub qualifier: Option<&'a str>,
    pub extra_meta: &'a HashMap<String, String>,
    pub tags: &'a [String],
    pub scheme: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub http_check: bool,
    pub deregister_after: Duration,
    pub interval: Duration,
    pub timeout: Duration,
}

/// TTL check id derived from a service id
pub(crate) fn ttl_check_id(service_id: &str) -> String {
    format!("{service_id}-ttl")
}

/// HTTP check id derived from a service id
pub(crate) fn http_check_id(service_id: &str) -> String {
    format!("{service_id}-http")
}

/// Deterministic service id: `name[-qualifier]-hostname-host`
///
/// Re-registering the same logical instance always produces the same id, so
/// the registry treats it as an update rather than a second instance. Fails
/// only when the local hostname cannot be determined.
pub(crate) fn generate_service_id(
    name: &str,
    qualifier: Option<&str>,
    host: &str,
) -> Result<String> {
    let hostname = hostname::get()
        .map_err(|err| Error::Configuration(format!("cannot determine local hostname: {err}")))?
        .to_string_lossy()
        .into_owned();

    Ok(match qualifier {
        Some(qualifier) if !qualifier.is_empty() => {
            format!("{name}-{qualifier}-{hostname}-{host}")
        }
        _ => format!("{name}-{hostname}-{host}"),
    })
}

/// Build the registration descriptor for one `register()` call
pub(crate) fn build(spec: &DescriptorSpec<'_>) -> Result<ServiceDescriptor> {
    let service_id = generate_service_id(spec.name, spec.qualifier, spec.host)?;

    let mut meta = HashMap::from([
        (
            "application_version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
        (
            "architecture".to_string(),
            std::env::consts::ARCH.to_string(),
        ),
        (
            "operating_system".to_string(),
            std::env::consts::OS.to_string(),
        ),
    ]);
    for (key, value) in spec.extra_meta {
        meta.insert(key.clone(), value.clone());
    }

    let mut checks = vec![ServiceCheck::ttl(
        ttl_check_id(&service_id),
        humantime::format_duration(spec.interval + Duration::from_secs(5)).to_string(),
        humantime::format_duration(spec.deregister_after).to_string(),
    )];

    // The registry agent cannot run HTTP checks on Windows hosts
    if spec.http_check && std::env::consts::OS != "windows" {
        checks.push(ServiceCheck::http(
            http_check_id(&service_id),
            format!("{}://{}:{}/health", spec.scheme, spec.host, spec.port),
            humantime::format_duration(spec.interval).to_string(),
            humantime::format_duration(spec.timeout).to_string(),
        ));
    }

    Ok(ServiceDescriptor {
        id: service_id,
        name: spec.name.to_string(),
        address: spec.host.to_string(),
        port: spec.port,
        tags: spec.tags.to_vec(),
        meta,
        checks,
    })
}
