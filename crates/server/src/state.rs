//! Shared application state handed to every handler.

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use stratus_core::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    /// Rendered at `/metrics`; absent when metrics are disabled.
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    #[must_use]
    pub fn new(scheduler: Arc<Scheduler>, prometheus: Option<PrometheusHandle>) -> Self {
        Self { scheduler, prometheus }
    }
}
