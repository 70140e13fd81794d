//! Prometheus recorder. The handle renders the text exposition served on
//! `GET /metrics`.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {}", e))?;
    describe();
    Ok(handle)
}

fn describe() {
    describe_counter!("relay_connections_total", "WebSocket connections accepted");
    describe_gauge!("relay_active_connections", "Open WebSocket connections on this gateway");
    describe_counter!("relay_admissions_total", "Admission attempts by outcome");
    describe_counter!("relay_client_events_total", "Client events by type and outcome");
    describe_counter!("relay_server_events_total", "Server events sent by type");
    describe_counter!("relay_dispatch_total", "Work items enqueued by kind and outcome");
    describe_counter!("relay_dead_letters_total", "Work items that exhausted their retries");
    describe_counter!("relay_cancellations_total", "Cancellations by scope");
    describe_counter!("relay_responses_total", "Finished responses by status");
    describe_counter!("relay_results_dropped_total", "Worker results discarded by the reorder buffer");
    describe_counter!("relay_partial_results_total", "Sequence gaps skipped by the reorder buffer");
    describe_counter!("relay_rate_limit_decisions_total", "Rate limit decisions by outcome");
    describe_counter!("relay_circuit_rejections_total", "Calls refused by an open breaker");
    describe_counter!("relay_session_update_conflicts_total", "Optimistic session updates that lost a race");
    describe_histogram!("relay_enqueue_seconds", Unit::Seconds, "Time to publish a work item");
    describe_histogram!("relay_rate_limit_check_seconds", Unit::Seconds, "Round trip of one rate limit check");
    describe_gauge!("relay_circuit_state", "Breaker state per dependency (0 closed, 1 half-open, 2 open)");
}
