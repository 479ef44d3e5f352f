use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tracing::info;

use crate::config::RelayConfig;
use crate::registry::EndpointRegistry;

pub struct RelayState {
    pub config: RelayConfig,
    pub registry: Arc<EndpointRegistry>,
    metrics: Option<PrometheusHandle>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            registry: EndpointRegistry::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Prometheus text exposition; empty when no recorder is installed.
    pub fn render_metrics(&self) -> String {
        self.metrics
            .as_ref()
            .map(PrometheusHandle::render)
            .unwrap_or_default()
    }

    /// Stop accepting registrations and ask every client to come back later.
    pub fn drain(&self) -> usize {
        let retry_after = self.config.retry_after_secs();
        let closed = self.registry.drain(retry_after);
        info!(channels = closed, retry_after, "relay draining");
        closed
    }
}
