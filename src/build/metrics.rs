//! Prometheus metrics for cluster builds
//!
//! - Build counts by outcome
//! - Build and per-stage durations
//! - Builds currently in flight

use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

const DURATION_BUCKETS: &[f64] = &[0.1, 1.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1200.0, 3600.0];

/// Build metrics registry
///
/// Clone is cheap (the collectors are reference counted).
#[derive(Clone)]
pub struct BuildMetrics {
    registry: Registry,
    /// Total builds by result (success, failed)
    pub builds_total: IntCounterVec,
    /// Whole-build duration by result
    pub build_duration_seconds: HistogramVec,
    /// Duration of each build stage
    pub stage_duration_seconds: HistogramVec,
    /// Builds currently running
    pub builds_in_flight: IntGauge,
}

impl BuildMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let builds_total = IntCounterVec::new(
            Opts::new("kube_eleven_builds_total", "Total number of cluster builds"),
            &["result"],
        )?;
        registry.register(Box::new(builds_total.clone()))?;

        let build_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "kube_eleven_build_duration_seconds",
                "Duration of cluster builds in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["result"],
        )?;
        registry.register(Box::new(build_duration_seconds.clone()))?;

        let stage_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "kube_eleven_stage_duration_seconds",
                "Duration of individual build stages in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["stage"],
        )?;
        registry.register(Box::new(stage_duration_seconds.clone()))?;

        let builds_in_flight = IntGauge::new(
            "kube_eleven_builds_in_flight",
            "Number of cluster builds currently running",
        )?;
        registry.register(Box::new(builds_in_flight.clone()))?;

        Ok(Self {
            registry,
            builds_total,
            build_duration_seconds,
            stage_duration_seconds,
            builds_in_flight,
        })
    }

    pub fn record_stage(&self, stage: &str, duration_secs: f64) {
        self.stage_duration_seconds
            .with_label_values(&[stage])
            .observe(duration_secs);
    }

    pub fn record_build_success(&self, duration_secs: f64) {
        self.record_build("success", duration_secs);
    }

    pub fn record_build_failure(&self, duration_secs: f64) {
        self.record_build("failed", duration_secs);
    }

    fn record_build(&self, result: &str, duration_secs: f64) {
        self.builds_total.with_label_values(&[result]).inc();
        self.build_duration_seconds
            .with_label_values(&[result])
            .observe(duration_secs);
    }

    /// Encode all metrics to Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| {
            prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
        })
    }
}

#[cfg(test)]
#[path = "metrics_test.rs"]
mod tests;
