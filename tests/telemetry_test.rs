//! Integration tests for telemetry initialization and span helpers.

use batchtrack::model::{ClaimState, GroupKey, Stage};
use batchtrack::telemetry::{self, TelemetryConfig, metrics, work};
use opentelemetry::{Key, Value};
use uuid::Uuid;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Only one global subscriber can be set per process; a second init
    // returns Err, which is acceptable here.
    let config = TelemetryConfig::new("batchtrack-test", "debug");
    if let Ok(guard) = telemetry::init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.shutdown().unwrap();
    }
}

#[test]
fn resource_names_the_run() {
    unsafe {
        std::env::set_var("AWS_BATCH_JOB_ID", "5f3c2a1e-job");
    }
    let resource = TelemetryConfig::new("batchtrack", "info")
        .with_command("work")
        .with_stage(Stage::Segmented)
        .with_group(GroupKey(7))
        .resource();
    unsafe {
        std::env::remove_var("AWS_BATCH_JOB_ID");
    }

    let get = |key: &'static str| resource.get(&Key::from_static_str(key));
    assert_eq!(get(telemetry::COMMAND_KEY), Some(Value::from("work")));
    assert_eq!(get(telemetry::STAGE_KEY), Some(Value::from("segmented")));
    assert_eq!(get(telemetry::GROUP_KEY), Some(Value::I64(7)));
    assert_eq!(get("aws.batch.job.id"), Some(Value::from("5f3c2a1e-job")));
    assert_eq!(get("service.name"), Some(Value::from("batchtrack")));
}

#[test]
fn resource_without_run_attributes_has_no_command() {
    let resource = TelemetryConfig::new("batchtrack", "info").resource();
    let get = |key: &'static str| resource.get(&Key::from_static_str(key));
    assert!(get(telemetry::COMMAND_KEY).is_none());
    assert!(get(telemetry::GROUP_KEY).is_none());
}

#[test]
fn group_span_creates_with_run_id() {
    let run_id = Uuid::new_v4();
    let span = work::start_group_span("dispatch", GroupKey(3), Stage::Segmented, &run_id);
    let _entered = span.enter();
}

#[test]
fn item_span_records_claim_transitions() {
    let span = work::start_item_span("A_0", Stage::Parcellated);
    work::record_claim_transition(&span, ClaimState::Idle, ClaimState::Claimed);
    work::record_claim_transition(&span, ClaimState::Claimed, ClaimState::Done);
}

#[test]
fn metric_instruments_build_without_provider() {
    metrics::items_written().add(1, &[]);
    metrics::stage_duration_ms().record(12.5, &[]);
}
