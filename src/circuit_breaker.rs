//! Circuit breaker guarding one class of capture operations.
//!
//! ```text
//! Closed   -> Open      failure_count reaches failure_threshold
//! Open     -> HalfOpen  first call at or after next_attempt
//! HalfOpen -> Closed    success_count reaches success_threshold
//! HalfOpen -> Open      any failure
//! ```

use crate::{BreakerSettings, CaptureError, Clock};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    next_attempt: Option<Instant>,
}

/// Point-in-time view of a breaker for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub retry_after_ms: Option<u64>,
}

pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            settings,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                next_attempt: None,
            }),
        }
    }

    /// Runs `operation` under the breaker.
    ///
    /// The operation races `request_timeout`; a timeout is recorded exactly
    /// like an error. When the breaker is open the operation is not invoked.
    /// On timeout the operation future is dropped, so anything it owns must
    /// release itself on drop. Validation and trust-boundary rejections leave
    /// the counters untouched.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, CaptureError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CaptureError>>,
    {
        self.admit()?;

        let outcome = match tokio::time::timeout(self.settings.request_timeout, operation()).await
        {
            Ok(result) => result,
            Err(_) => Err(CaptureError::Timeout(self.settings.request_timeout)),
        };

        match &outcome {
            Ok(_) => self.record_success(),
            Err(e) if e.counts_against_breaker() => self.record_failure(e),
            Err(e) => debug!(breaker = %self.name, error = %e, "Call rejected before running, not counted"),
        }
        outcome
    }

    fn admit(&self) -> Result<(), CaptureError> {
        let now = self.clock.now();
        let mut inner = self.lock();

        if inner.state != CircuitState::Open {
            return Ok(());
        }

        match inner.next_attempt {
            Some(next_attempt) if now < next_attempt => Err(CaptureError::CircuitOpen {
                breaker: self.name.clone(),
                retry_after: next_attempt - now,
            }),
            _ => {
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
                info!(breaker = %self.name, "Circuit breaker half-open, allowing trial call");

                if self.settings.success_threshold == 0 {
                    Self::close(&mut inner);
                    info!(breaker = %self.name, "Circuit breaker closed");
                }
                Ok(())
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.settings.success_threshold {
                    Self::close(&mut inner);
                    info!(breaker = %self.name, "Circuit breaker closed");
                }
            }
            _ => inner.failure_count = 0,
        }
    }

    fn record_failure(&self, error: &CaptureError) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.failure_count += 1;

        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            _ => inner.failure_count >= self.settings.failure_threshold,
        };

        if trip {
            inner.state = CircuitState::Open;
            inner.success_count = 0;
            inner.next_attempt = Some(now + self.settings.recovery_timeout);
            warn!(
                breaker = %self.name,
                failures = inner.failure_count,
                error = %error,
                "Circuit breaker opened for {:?}",
                self.settings.recovery_timeout
            );
        } else {
            debug!(breaker = %self.name, failures = inner.failure_count, "Recorded failure");
        }
    }

    fn close(inner: &mut BreakerInner) {
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.next_attempt = None;
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now();
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            retry_after_ms: inner
                .next_attempt
                .filter(|_| inner.state == CircuitState::Open)
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
        }
    }

    pub fn reset(&self) {
        Self::close(&mut self.lock());
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One breaker per capture mode so a failing mode cannot starve the other.
pub struct ModeBreakers {
    pub network: CircuitBreaker,
    pub process: CircuitBreaker,
}

impl ModeBreakers {
    pub fn new(network: BreakerSettings, process: BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            network: CircuitBreaker::new("network", network, clock.clone()),
            process: CircuitBreaker::new("process", process, clock),
        }
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        vec![self.network.snapshot(), self.process.snapshot()]
    }

    pub fn reset(&self) {
        self.network.reset();
        self.process.reset();
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
