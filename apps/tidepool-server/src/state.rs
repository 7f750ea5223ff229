use std::time::Duration;

use metrics_exporter_prometheus::PrometheusHandle;
use tidepool_core::SessionStore;

#[derive(Clone)]
pub struct AppState {
    pub store: SessionStore,
    pub round_timeout: Duration,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(store: SessionStore, round_timeout: Duration, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            store,
            round_timeout,
            metrics,
        }
    }

    pub fn render_metrics(&self) -> String {
        self.metrics
            .as_ref()
            .map(PrometheusHandle::render)
            .unwrap_or_default()
    }
}
