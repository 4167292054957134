//! Per-identifier fixed-window admission control.
//!
//! The window does not slide: a client may send `max_requests` at the tail of
//! one window and another `max_requests` right after the boundary.

use crate::Clock;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Request count for one identifier within its current window
#[derive(Debug, Clone, Copy)]
pub struct RateLimitEntry {
    pub count: u32,
    pub reset_at: Instant,
}

pub struct RateLimiter {
    entries: DashMap<String, RateLimitEntry>,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            sweeper: Mutex::new(None),
        }
    }

    /// Counts one request for `identifier` and reports whether it is admitted.
    pub fn allow(&self, identifier: &str, max_requests: u32, window: Duration) -> bool {
        let now = self.clock.now();
        let fresh = RateLimitEntry {
            count: 1,
            reset_at: now + window,
        };

        match self.entries.entry(identifier.to_owned()) {
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                true
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if now > entry.reset_at {
                    *entry = fresh;
                    true
                } else if entry.count < max_requests {
                    entry.count += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Time left until the identifier's current window closes.
    pub fn retry_after(&self, identifier: &str) -> Option<Duration> {
        let now = self.clock.now();
        self.entries
            .get(identifier)
            .map(|entry| entry.reset_at.saturating_duration_since(now))
    }

    /// Drops every expired entry, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now <= entry.reset_at);
        before.saturating_sub(self.entries.len())
    }

    pub fn tracked_identifiers(&self) -> usize {
        self.entries.len()
    }

    /// Starts the periodic sweep on the current tokio runtime.
    ///
    /// The task only holds a weak reference, so it ends once the limiter is
    /// dropped and never keeps the runtime busy on its own.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let limiter = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                let removed = limiter.sweep();
                if removed > 0 {
                    debug!(removed, "Swept expired rate limit entries");
                }
            }
        });

        if let Some(previous) = self.lock_sweeper().replace(handle) {
            previous.abort();
        }
    }

    /// Clears every entry and stops the sweep task.
    pub fn reset(&self) {
        if let Some(handle) = self.lock_sweeper().take() {
            handle.abort();
        }
        self.entries.clear();
    }

    fn lock_sweeper(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.sweeper.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(handle) = self.lock_sweeper().take() {
            handle.abort();
        }
    }
}
