//! Integration tests for telemetry initialization and span helpers.

use claimq::model::{ItemId, ItemState, Owner};

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = claimq::telemetry::TelemetryConfig::new(None, "debug");
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let _guard = claimq::telemetry::init_telemetry(config);
}

#[test]
fn telemetry_config_follows_environment() {
    let config = claimq::config::Config::from_lookup(|name| match name {
        "CLAIMQ_ITEMS_DIR" => Some("/tmp/claimq-items".to_string()),
        "OTEL_ENDPOINT" => Some("http://localhost:4317".to_string()),
        "LOG_LEVEL" => Some("claimq=debug".to_string()),
        _ => None,
    })
    .unwrap();
    let telemetry = claimq::telemetry::TelemetryConfig::from(&config);
    assert_eq!(telemetry.endpoint.as_deref(), Some("http://localhost:4317"));
    assert_eq!(telemetry.default_level, "claimq=debug");
}

#[test]
fn lease_span_creates_and_records_transition() {
    let id = ItemId::new("bank_01/questionnaire_001.jsonl").unwrap();
    let owner = Owner::new("2023000001").unwrap();
    let span = claimq::telemetry::lease::start_lease_span("complete", Some(&id), &owner);
    claimq::telemetry::lease::record_transition(&span, ItemState::Claimed, ItemState::Done);
}

#[test]
fn claim_span_records_item_later() {
    let owner = Owner::new("2023000001").unwrap();
    let span = claimq::telemetry::lease::start_lease_span("claim", None, &owner);
    let id = ItemId::new("bank_01/questionnaire_002.jsonl").unwrap();
    claimq::telemetry::lease::record_item(&span, &id);
}

#[test]
fn metric_instruments_build_without_provider() {
    use opentelemetry::KeyValue;

    claimq::telemetry::metrics::lease_operations().add(
        1,
        &[
            KeyValue::new("operation", "claim"),
            KeyValue::new("result", "ok"),
        ],
    );
    claimq::telemetry::metrics::leases_reclaimed().add(2, &[KeyValue::new("backend", "fs")]);
    claimq::telemetry::metrics::operation_duration_ms()
        .record(1.5, &[KeyValue::new("operation", "lease.claim")]);
}
