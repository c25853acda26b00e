// ABOUTME: Named metric helpers over the metrics facade.
// ABOUTME: Callers never touch metric names directly; every series is defined here.

use metrics::{counter, gauge, histogram};

pub fn record_connection_opened() {
    counter!("switchboard_connections_opened_total").increment(1);
}

pub fn record_connection_closed() {
    counter!("switchboard_connections_closed_total").increment(1);
}

pub fn record_handshake(outcome: &'static str) {
    counter!("switchboard_handshakes_total", "outcome" => outcome).increment(1);
}

pub fn record_rpc_request(method: String, outcome: &'static str) {
    counter!("switchboard_rpc_requests_total", "method" => method, "outcome" => outcome)
        .increment(1);
}

pub fn record_run_started() {
    counter!("switchboard_runs_started_total").increment(1);
}

pub fn record_run_settled(outcome: &'static str) {
    counter!("switchboard_runs_settled_total", "outcome" => outcome).increment(1);
}

pub fn record_run_duration(seconds: f64) {
    histogram!("switchboard_run_duration_seconds").record(seconds);
}

pub fn record_dedupe_hit() {
    counter!("switchboard_dedupe_hits_total").increment(1);
}

pub fn set_active_runs(count: u64) {
    gauge!("switchboard_active_runs").set(count as f64);
}

pub fn set_active_connections(count: u64) {
    gauge!("switchboard_active_connections").set(count as f64);
}

pub fn set_providers_running(count: u64) {
    gauge!("switchboard_providers_running").set(count as f64);
}

pub fn record_provider_start(provider: String) {
    counter!("switchboard_provider_starts_total", "provider" => provider).increment(1);
}

pub fn record_provider_crash(provider: String) {
    counter!("switchboard_provider_crashes_total", "provider" => provider).increment(1);
}

pub fn record_reload(kind: &'static str) {
    counter!("switchboard_reloads_total", "kind" => kind).increment(1);
}

pub fn record_error(source: &'static str) {
    counter!("switchboard_errors_total", "source" => source).increment(1);
}

pub fn record_token_usage(input_tokens: u64, output_tokens: u64) {
    counter!("switchboard_input_tokens_total").increment(input_tokens);
    counter!("switchboard_output_tokens_total").increment(output_tokens);
}
