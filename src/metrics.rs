//! Rotation metrics with fixed names.
//!
//! [`PrometheusMetrics`] owns its own registry; the agent renders it in the
//! text exposition format and tests read values back through
//! [`PrometheusMetrics::snapshot`].

use std::collections::BTreeMap;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

pub const CERT_EXPIRATION_TIME: &str = "certrotate_agent_cert_expiration_time_seconds";
pub const RENEWAL_ATTEMPTS: &str = "certrotate_agent_cert_renewal_attempts_total";
pub const RENEWAL_SUCCESSES: &str = "certrotate_agent_cert_renewal_successes_total";
pub const RENEWAL_FAILURES: &str = "certrotate_agent_cert_renewal_failures_total";
pub const ROTATION_DURATION: &str = "certrotate_agent_cert_rotation_duration_seconds";

pub trait RotationMetrics: Send + Sync {
    fn set_cert_expiration_time(&self, unix_secs: i64);
    fn inc_renewal_attempts(&self);
    fn inc_renewal_successes(&self);
    fn inc_renewal_failures(&self, reason: &str);
    fn observe_rotation_duration(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl RotationMetrics for NoopMetrics {
    fn set_cert_expiration_time(&self, _unix_secs: i64) {}
    fn inc_renewal_attempts(&self) {}
    fn inc_renewal_successes(&self) {}
    fn inc_renewal_failures(&self, _reason: &str) {}
    fn observe_rotation_duration(&self, _duration: Duration) {}
}

pub struct PrometheusMetrics {
    registry: Registry,
    cert_expiration_time: IntGauge,
    renewal_attempts: IntCounter,
    renewal_successes: IntCounter,
    renewal_failures: IntCounterVec,
    rotation_duration: Histogram,
}

/// Point-in-time view of the recorded values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub cert_expiration_time: i64,
    pub renewal_attempts: u64,
    pub renewal_successes: u64,
    pub renewal_failures: BTreeMap<String, u64>,
    pub rotation_count: u64,
    pub rotation_duration_sum: f64,
}

impl PrometheusMetrics {
    /// Creates the rotation metrics and registers them in a fresh registry.
    ///
    /// # Errors
    /// Returns an error if a metric cannot be built or registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let cert_expiration_time = IntGauge::new(
            CERT_EXPIRATION_TIME,
            "Certificate expiration timestamp in Unix seconds",
        )?;
        let renewal_attempts = IntCounter::new(
            RENEWAL_ATTEMPTS,
            "Total number of certificate renewal attempts",
        )?;
        let renewal_successes = IntCounter::new(
            RENEWAL_SUCCESSES,
            "Total number of successful certificate renewals",
        )?;
        let renewal_failures = IntCounterVec::new(
            Opts::new(
                RENEWAL_FAILURES,
                "Total number of failed certificate renewals",
            ),
            &["reason"],
        )?;
        let rotation_duration = Histogram::with_opts(HistogramOpts::new(
            ROTATION_DURATION,
            "Time taken to complete certificate rotation in seconds",
        ))?;

        registry.register(Box::new(cert_expiration_time.clone()))?;
        registry.register(Box::new(renewal_attempts.clone()))?;
        registry.register(Box::new(renewal_successes.clone()))?;
        registry.register(Box::new(renewal_failures.clone()))?;
        registry.register(Box::new(rotation_duration.clone()))?;

        Ok(Self {
            registry,
            cert_expiration_time,
            renewal_attempts,
            renewal_successes,
            renewal_failures,
            rotation_duration,
        })
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Renders every registered metric in the text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut renewal_failures = BTreeMap::new();
        for family in self.renewal_failures.collect() {
            for metric in family.get_metric() {
                let reason = metric
                    .get_label()
                    .iter()
                    .find(|label| label.get_name() == "reason")
                    .map(|label| label.get_value().to_string())
                    .unwrap_or_default();
                renewal_failures.insert(reason, counter_value(metric.get_counter().get_value()));
            }
        }
        MetricsSnapshot {
            cert_expiration_time: self.cert_expiration_time.get(),
            renewal_attempts: self.renewal_attempts.get(),
            renewal_successes: self.renewal_successes.get(),
            renewal_failures,
            rotation_count: self.rotation_duration.get_sample_count(),
            rotation_duration_sum: self.rotation_duration.get_sample_sum(),
        }
    }
}

impl RotationMetrics for PrometheusMetrics {
    fn set_cert_expiration_time(&self, unix_secs: i64) {
        self.cert_expiration_time.set(unix_secs);
    }

    fn inc_renewal_attempts(&self) {
        self.renewal_attempts.inc();
    }

    fn inc_renewal_successes(&self) {
        self.renewal_successes.inc();
    }

    fn inc_renewal_failures(&self, reason: &str) {
        self.renewal_failures.with_label_values(&[reason]).inc();
    }

    fn observe_rotation_duration(&self, duration: Duration) {
        self.rotation_duration.observe(duration.as_secs_f64());
    }
}

// Integer counters are exported as whole, non-negative floats.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn counter_value(value: f64) -> u64 {
    value as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_values() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.set_cert_expiration_time(1_700_000_000);
        metrics.inc_renewal_attempts();
        metrics.inc_renewal_attempts();
        metrics.inc_renewal_successes();
        metrics.inc_renewal_failures("submission");
        metrics.inc_renewal_failures("submission");
        metrics.inc_renewal_failures("key_load");
        metrics.observe_rotation_duration(Duration::from_millis(1500));

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.cert_expiration_time, 1_700_000_000);
        assert_eq!(snapshot.renewal_attempts, 2);
        assert_eq!(snapshot.renewal_successes, 1);
        assert_eq!(snapshot.renewal_failures.get("submission"), Some(&2));
        assert_eq!(snapshot.renewal_failures.get("key_load"), Some(&1));
        assert_eq!(snapshot.rotation_count, 1);
        assert!((snapshot.rotation_duration_sum - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_histogram_memory_is_bounded_by_buckets() {
        let metrics = PrometheusMetrics::new().unwrap();
        for millis in 0..100_000_u64 {
            metrics.observe_rotation_duration(Duration::from_millis(millis % 20_000));
        }

        let families = metrics.registry().gather();
        let rotation = families
            .iter()
            .find(|family| family.get_name() == ROTATION_DURATION)
            .unwrap();
        let histogram = rotation.get_metric()[0].get_histogram();

        assert_eq!(histogram.get_sample_count(), 100_000);
        assert_eq!(histogram.get_bucket().len(), prometheus::DEFAULT_BUCKETS.len());
        assert_eq!(metrics.snapshot().rotation_count, 100_000);
    }

    #[test]
    fn test_render_uses_fixed_names() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.inc_renewal_attempts();
        metrics.inc_renewal_failures("key_load");
        metrics.observe_rotation_duration(Duration::from_secs(2));

        let text = metrics.render();

        assert!(text.contains("certrotate_agent_cert_renewal_attempts_total 1"));
        assert!(
            text.contains("certrotate_agent_cert_renewal_failures_total{reason=\"key_load\"} 1")
        );
        assert!(text.contains("certrotate_agent_cert_rotation_duration_seconds_count 1"));
        assert!(text.contains("certrotate_agent_cert_expiration_time_seconds 0"));
        assert!(text.contains("# TYPE certrotate_agent_cert_rotation_duration_seconds histogram"));
    }

    #[test]
    fn test_registries_are_independent() {
        let first = PrometheusMetrics::new().unwrap();
        let second = PrometheusMetrics::new().unwrap();

        first.inc_renewal_successes();

        assert_eq!(first.snapshot().renewal_successes, 1);
        assert_eq!(second.snapshot().renewal_successes, 0);
    }
}
