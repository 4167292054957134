use crate::{BreakerSnapshot, CircuitState};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Critical,
}

/// Served by `GET /health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthLevel,
    pub breakers: Vec<BreakerSnapshot>,
    pub tracked_identifiers: usize,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub fn new(breakers: Vec<BreakerSnapshot>, tracked_identifiers: usize) -> Self {
        Self {
            status: determine_overall_health(&breakers),
            breakers,
            tracked_identifiers,
            timestamp: Utc::now(),
        }
    }
}

/// Critical when every breaker is open, degraded when any is not closed.
pub fn determine_overall_health(breakers: &[BreakerSnapshot]) -> HealthLevel {
    let open = breakers.iter().filter(|b| b.state == CircuitState::Open).count();

    if !breakers.is_empty() && open == breakers.len() {
        HealthLevel::Critical
    } else if breakers.iter().any(|b| b.state != CircuitState::Closed) {
        HealthLevel::Degraded
    } else {
        HealthLevel::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(name: &str, state: CircuitState) -> BreakerSnapshot {
        BreakerSnapshot {
            name: name.to_string(),
            state,
            failure_count: 0,
            success_count: 0,
            retry_after_ms: None,
        }
    }

    #[test]
    fn test_overall_health() {
        let closed = vec![snapshot("network", CircuitState::Closed), snapshot("process", CircuitState::Closed)];
        assert_eq!(determine_overall_health(&closed), HealthLevel::Healthy);

        let one_open = vec![snapshot("network", CircuitState::Open), snapshot("process", CircuitState::Closed)];
        assert_eq!(determine_overall_health(&one_open), HealthLevel::Degraded);

        let half_open = vec![snapshot("network", CircuitState::HalfOpen), snapshot("process", CircuitState::Closed)];
        assert_eq!(determine_overall_health(&half_open), HealthLevel::Degraded);

        let all_open = vec![snapshot("network", CircuitState::Open), snapshot("process", CircuitState::Open)];
        assert_eq!(determine_overall_health(&all_open), HealthLevel::Critical);
    }

    #[test]
    fn test_report_serializes_states() {
        let report = HealthReport::new(vec![snapshot("network", CircuitState::HalfOpen)], 3);
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["status"], "degraded");
        assert_eq!(json["breakers"][0]["state"], "HALF_OPEN");
        assert_eq!(json["tracked_identifiers"], 3);
        assert!(json["timestamp"].is_string());
    }
}
