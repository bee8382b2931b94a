use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::net::SocketAddr;
use tracing::info;

use crate::utils::EngineError;

/// Prometheus metrics describing engine admission activity.
#[derive(Clone)]
pub struct EngineMetrics {
    /// Live connections currently registered.
    pub population: IntGauge,
    /// Connections admitted since start.
    pub admitted: IntCounter,
    /// Connections refused because the engine was full.
    pub rejected: IntCounter,
    /// Connections removed from the registry, by disconnect or drain.
    pub removed: IntCounter,
    /// Prometheus registry used to store and manage the metrics.
    registry: Registry,
}

impl EngineMetrics {
    /// Creates the metrics in a registry private to this engine.
    pub fn new() -> Result<Self, EngineError> {
        let registry = Registry::new();
        let population = IntGauge::new("population", "Live connections")?;
        let admitted = IntCounter::new("admitted_total", "Connections admitted")?;
        let rejected = IntCounter::new("rejected_total", "Connections rejected at capacity")?;
        let removed = IntCounter::new("removed_total", "Connections removed")?;

        registry.register(Box::new(population.clone()))?;
        registry.register(Box::new(admitted.clone()))?;
        registry.register(Box::new(rejected.clone()))?;
        registry.register(Box::new(removed.clone()))?;

        Ok(Self {
            population,
            admitted,
            rejected,
            removed,
            registry,
        })
    }

    /// Encodes every registered metric in Prometheus text format.
    pub fn expose_metrics(&self) -> Result<String, EngineError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| EngineError::Metrics(e.to_string()))
    }
}

/// Serves `/metrics` on `port` until the server fails.
pub async fn serve_metrics_http(metrics: EngineMetrics, port: u16) -> Result<(), EngineError> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Metrics available on http://{}/metrics", addr);

    axum::Server::try_bind(&addr)
        .map_err(|e| EngineError::Metrics(e.to_string()))?
        .serve(app.into_make_service())
        .await
        .map_err(|e| EngineError::Metrics(e.to_string()))
}

async fn metrics_handler(State(metrics): State<EngineMetrics>) -> impl IntoResponse {
    match metrics.expose_metrics() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_population() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.population.set(3);
        metrics.admitted.inc();

        let body = metrics.expose_metrics().unwrap();
        assert!(body.contains("population 3"));
        assert!(body.contains("admitted_total 1"));
    }
}
