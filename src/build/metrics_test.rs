//! Tests for build metrics

use super::BuildMetrics;

#[test]
fn test_metrics_creation() {
    let metrics = BuildMetrics::new().expect("should create metrics");

    metrics.record_build_success(12.0);
    metrics.record_stage("Provisioning", 10.0);
    metrics.builds_in_flight.inc();

    let output = metrics.encode().expect("should encode metrics");
    assert!(output.contains("kube_eleven_builds_total"));
    assert!(output.contains("kube_eleven_build_duration_seconds"));
    assert!(output.contains("kube_eleven_stage_duration_seconds"));
    assert!(output.contains("kube_eleven_builds_in_flight 1"));
}

#[test]
fn test_record_build_outcomes() {
    let metrics = BuildMetrics::new().expect("should create metrics");

    metrics.record_build_success(1.0);
    metrics.record_build_success(2.0);
    metrics.record_build_failure(0.5);

    let output = metrics.encode().expect("should encode metrics");

    assert!(output.contains("kube_eleven_builds_total{result=\"success\"} 2"));
    assert!(output.contains("kube_eleven_builds_total{result=\"failed\"} 1"));
    assert!(output.contains("kube_eleven_build_duration_seconds_count{result=\"success\"} 2"));
}

#[test]
fn test_record_stages() {
    let metrics = BuildMetrics::new().expect("should create metrics");

    metrics.record_stage("Preparing", 0.01);
    metrics.record_stage("Rendering", 0.02);
    metrics.record_stage("Rendering", 0.03);

    let output = metrics.encode().expect("should encode metrics");

    assert!(output.contains("kube_eleven_stage_duration_seconds_count{stage=\"Preparing\"} 1"));
    assert!(output.contains("kube_eleven_stage_duration_seconds_count{stage=\"Rendering\"} 2"));
}

#[test]
fn test_registries_are_independent() {
    let a = BuildMetrics::new().expect("should create metrics");
    let b = BuildMetrics::new().expect("should create metrics");

    a.record_build_failure(1.0);

    let output = b.encode().expect("should encode metrics");
    assert!(!output.contains("kube_eleven_builds_total{result=\"failed\"}"));
}
