//! Local health endpoint probed by the coordination service
//!
//! Served on the registered service's port so the registry's interval HTTP
//! check has something to talk to.

use axum::routing::get;
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, trace};

use crate::error::Result;

/// Body of the `GET /health` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: bool,
    pub timestamp: String,
    pub timezone: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: true,
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        timezone: "UTC".to_string(),
    })
}

/// Router exposing the health check route
#[must_use]
pub fn router() -> Router {
    trace!("registered health check route");
    Router::new().route("/health", get(handle_health))
}

/// Serve the health endpoint until the task is aborted
pub async fn serve(port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, router()).await?;
    Ok(())
}

/// Spawn the health endpoint server on the given port
pub(crate) fn spawn(port: u16) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = serve(port).await {
            error!(port = port, error = %err, "health endpoint server failed");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_response_shape() {
        let Json(body) = handle_health().await;
        assert!(body.status);
        assert_eq!(body.timezone, "UTC");
        // RFC3339 with explicit UTC marker
        assert!(body.timestamp.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&body.timestamp).is_ok());
    }

    #[test]
    fn test_health_response_serialization() {
        let body = HealthResponse {
            status: true,
            timestamp: "2026-08-30T12:00:00Z".to_string(),
            timezone: "UTC".to_string(),
        };
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(
            json,
            "{\"status\":true,\"timestamp\":\"2026-08-30T12:00:00Z\",\"timezone\":\"UTC\"}"
        );
    }
}
