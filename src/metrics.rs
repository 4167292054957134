use crate::{CaptureError, ErrorCategory};
use metrics::{register_counter, register_histogram, Counter, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Installs the process-wide Prometheus recorder.
///
/// Handles registered before this call stay no-ops, so it must run before
/// [`Metrics::new`].
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, CaptureError> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| CaptureError::ConfigurationError(format!("metrics recorder: {e}")))
}

pub struct ModeMetrics {
    pub succeeded: Counter,
    pub failed: Counter,
    pub breaker_rejections: Counter,
    pub duration: Histogram,
}

impl ModeMetrics {
    fn register(mode: &'static str) -> Self {
        Self {
            succeeded: register_counter!("captures_succeeded_total", "mode" => mode),
            failed: register_counter!("captures_failed_total", "mode" => mode),
            breaker_rejections: register_counter!("breaker_rejections_total", "mode" => mode),
            duration: register_histogram!("capture_duration_seconds", "mode" => mode),
        }
    }
}

pub struct Metrics {
    pub network: ModeMetrics,
    pub process: ModeMetrics,
    pub rate_limited: Counter,
    pub invalid_requests: Counter,
    pub security_rejections: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            network: ModeMetrics::register("network"),
            process: ModeMetrics::register("process"),
            rate_limited: register_counter!("requests_rate_limited_total"),
            invalid_requests: register_counter!("requests_invalid_total"),
            security_rejections: register_counter!("security_rejections_total"),
        }
    }

    /// Per-mode handles, or `None` for requests refused before a mode was known.
    pub fn mode(&self, mode: &str) -> Option<&ModeMetrics> {
        match mode {
            "network" => Some(&self.network),
            "process" => Some(&self.process),
            _ => None,
        }
    }

    pub fn record_success(&self, mode: &str, duration: Duration) {
        if let Some(m) = self.mode(mode) {
            m.succeeded.increment(1);
            m.duration.record(duration.as_secs_f64());
        }
    }

    pub fn record_failure(&self, mode: &str, error: &CaptureError, duration: Duration) {
        match error.category() {
            ErrorCategory::Admission => {
                self.rate_limited.increment(1);
                return;
            }
            ErrorCategory::Validation => self.invalid_requests.increment(1),
            ErrorCategory::TrustBoundary => self.security_rejections.increment(1),
            ErrorCategory::BreakerOpen => {
                if let Some(m) = self.mode(mode) {
                    m.breaker_rejections.increment(1);
                }
            }
            ErrorCategory::Transient | ErrorCategory::Internal => {}
        }

        if let Some(m) = self.mode(mode) {
            m.failed.increment(1);
            m.duration.record(duration.as_secs_f64());
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = Metrics::new();
        metrics.record_success("network", Duration::from_millis(120));
        metrics.record_failure("process", &CaptureError::ForbiddenCharacters, Duration::from_millis(1));
        metrics.record_failure(
            "network",
            &CaptureError::RateLimited { retry_after: Duration::from_secs(1) },
            Duration::ZERO,
        );
        metrics.record_failure(
            "unknown",
            &CaptureError::InvalidRequest("bad body".into()),
            Duration::ZERO,
        );
    }

    #[test]
    fn test_unknown_mode_has_no_per_mode_bucket() {
        let metrics = Metrics::new();

        assert!(metrics.mode("unknown").is_none());
        assert!(std::ptr::eq(metrics.mode("network").unwrap(), &metrics.network));
        assert!(std::ptr::eq(metrics.mode("process").unwrap(), &metrics.process));
    }
}
