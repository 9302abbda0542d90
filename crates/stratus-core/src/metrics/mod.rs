//! Scheduler metrics.
//!
//! Thin wrappers over the `metrics` facade so call sites stay one-liners and
//! label names live in one place. The server binary installs the Prometheus
//! recorder at startup and serves its rendered output at `/metrics`.

use crate::types::{NodeType, RecordStatus, ReplicaStatus, ValidationStatus};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs the global Prometheus recorder.
///
/// # Errors
///
/// Fails if a recorder is already installed; the caller treats this as a
/// fatal init error.
pub fn install_prometheus() -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Records the terminal status of one audit.
pub fn record_validation_result(status: ValidationStatus) {
    counter!("stratus_validation_results_total", "status" => status.as_str()).increment(1);
}

/// Records a replica row reaching a new state.
pub fn record_replica_transition(status: ReplicaStatus) {
    counter!("stratus_replica_transitions_total", "status" => status.as_str()).increment(1);
}

/// Records a carfile record reaching a terminal state.
pub fn record_record_finished(status: RecordStatus) {
    counter!("stratus_carfile_records_finished_total", "status" => status.as_str()).increment(1);
}

/// Records a node connect.
pub fn record_node_connect(node_type: NodeType) {
    counter!("stratus_node_connects_total", "node_type" => node_type.as_str()).increment(1);
}

/// Publishes the current online node counts.
pub fn set_online_nodes(edges: usize, candidates: usize) {
    gauge!("stratus_online_nodes", "node_type" => "edge").set(edges as f64);
    gauge!("stratus_online_nodes", "node_type" => "candidate").set(candidates as f64);
}

/// Records a node quit event.
pub fn record_node_quit(count: usize) {
    counter!("stratus_node_quits_total").increment(count as u64);
}
