//! # Prometheus Metrics
//!
//! Operational metrics for the signaling relay, scraped at the `/metrics`
//! HTTP endpoint on the configured metrics port.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] so
//! they do not collide with any default global registry consumers.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Holds all Prometheus metric handles for the relay.
///
/// Clone-friendly (prometheus handles are internally shared) so it can be
/// used from every client task.
#[derive(Clone)]
pub struct RelayMetrics {
    /// Prometheus registry that owns all metrics below.
    registry: Registry,
    /// Number of peers currently holding a claimed slot.
    pub connected_peers: IntGauge,
    /// Total frames forwarded between peers.
    pub frames_forwarded_total: IntCounter,
    /// Total dial attempts handled (successful or not).
    pub dials_total: IntCounter,
}

impl RelayMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("duet".into()), None)
            .expect("failed to create prometheus registry");

        let connected_peers = IntGauge::new(
            "connected_peers",
            "Number of peers currently holding a claimed slot",
        )
        .expect("metric creation");
        registry
            .register(Box::new(connected_peers.clone()))
            .expect("metric registration");

        let frames_forwarded_total = IntCounter::new(
            "frames_forwarded_total",
            "Total frames forwarded between peers",
        )
        .expect("metric creation");
        registry
            .register(Box::new(frames_forwarded_total.clone()))
            .expect("metric registration");

        let dials_total = IntCounter::new("dials_total", "Total dial attempts handled")
            .expect("metric creation");
        registry
            .register(Box::new(dials_total.clone()))
            .expect("metric registration");

        Self {
            registry,
            connected_peers,
            frames_forwarded_total,
            dials_total,
        }
    }

    /// Encodes all registered metrics into the Prometheus text exposition
    /// format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).expect("prometheus output is valid utf-8"))
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<RelayMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_encode_in_text_format() {
        let metrics = RelayMetrics::new();
        metrics.connected_peers.set(2);
        metrics.frames_forwarded_total.inc();

        let body = metrics.encode().unwrap();
        assert!(body.contains("duet_connected_peers 2"));
        assert!(body.contains("duet_frames_forwarded_total 1"));
    }
}
