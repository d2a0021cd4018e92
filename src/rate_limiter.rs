//! Quota-aware sliding-window rate limiter
//!
//! Gmail meters API usage in "quota units" per user:
//! - Read operations: 5 units (messages.get, messages.list, history.list)
//! - Write operations: 50 units (messages.modify, messages.trash, labels.create)
//!
//! Every mailbox owns a sliding window of consumed units. A reservation
//! either records its units immediately (`Allowed`) or reports how long until
//! enough earlier reservations age out of the window (`MustWait`). The check
//! and the record happen under one lock, so concurrent callers can never
//! overshoot the window between reading and writing the counter.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::config::RateLimitConfig;
use crate::error::{Result, TriageError};

/// Gmail API quota costs for different operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaCost {
    /// messages.get, messages.list, history.list, labels.list, getProfile
    Read,
    /// messages.modify, messages.trash, messages.untrash, labels.create
    Write,
    /// Custom cost for special operations
    Custom(u32),
}

impl QuotaCost {
    /// Get the quota unit cost for this operation type
    pub fn units(&self) -> u32 {
        match self {
            QuotaCost::Read => 5,
            QuotaCost::Write => 50,
            QuotaCost::Custom(units) => *units,
        }
    }
}

/// Outcome of a single reservation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Allowed,
    MustWait(Duration),
}

#[derive(Debug, Default)]
struct Window {
    entries: VecDeque<(Instant, u32)>,
    used: u64,
    total_consumed: u64,
    total_operations: u64,
    total_waits: u64,
}

impl Window {
    fn prune(&mut self, now: Instant, span: Duration) {
        while let Some(&(at, units)) = self.entries.front() {
            if now.saturating_duration_since(at) >= span {
                self.entries.pop_front();
                self.used -= u64::from(units);
            } else {
                break;
            }
        }
    }

    /// Time until enough old entries expire for `units` to fit
    fn wait_for(&self, units: u32, capacity: u64, now: Instant, span: Duration) -> Duration {
        let mut remaining = self.used;
        for &(at, entry_units) in &self.entries {
            remaining -= u64::from(entry_units);
            if remaining + u64::from(units) <= capacity {
                return (at + span).saturating_duration_since(now);
            }
        }
        span
    }
}

/// Sliding-window limiter shared by every worker and every client
#[derive(Debug)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<String, Window>>>,
    capacity: u32,
    span: Duration,
    max_wait: Duration,
}

impl RateLimiter {
    pub fn new(capacity: u32, span: Duration, max_wait: Duration) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            capacity,
            span,
            max_wait,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.units_per_window,
            Duration::from_secs(config.window_secs),
            Duration::from_secs(config.max_wait_secs),
        )
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Try to reserve `cost` for the mailbox right now
    pub async fn reserve(&self, mailbox_id: &str, cost: QuotaCost) -> Reservation {
        self.reserve_at(mailbox_id, cost, Instant::now()).await
    }

    pub(crate) async fn reserve_at(
        &self,
        mailbox_id: &str,
        cost: QuotaCost,
        now: Instant,
    ) -> Reservation {
        let units = cost.units();
        let capacity = u64::from(self.capacity);
        let mut windows = self.windows.lock().await;
        let window = windows.entry(mailbox_id.to_string()).or_default();

        window.prune(now, self.span);

        trace!(
            mailbox_id,
            used = window.used,
            capacity,
            units,
            "Quota reservation requested"
        );

        if window.used + u64::from(units) <= capacity {
            window.entries.push_back((now, units));
            window.used += u64::from(units);
            window.total_consumed += u64::from(units);
            window.total_operations += 1;
            return Reservation::Allowed;
        }

        window.total_waits += 1;
        Reservation::MustWait(window.wait_for(units, capacity, now, self.span))
    }

    /// Reserve, sleeping on `MustWait` up to the configured bound
    ///
    /// Returns `QuotaWait` carrying the outstanding delay once the bound would
    /// be exceeded, so the caller can requeue the unit of work.
    pub async fn acquire(&self, mailbox_id: &str, cost: QuotaCost) -> Result<()> {
        if cost.units() > self.capacity {
            return Err(TriageError::RateLimitError(format!(
                "operation costs {} units but the window only holds {}",
                cost.units(),
                self.capacity
            )));
        }

        let mut waited = Duration::ZERO;
        loop {
            match self.reserve(mailbox_id, cost).await {
                Reservation::Allowed => return Ok(()),
                Reservation::MustWait(wait) => {
                    if waited + wait > self.max_wait {
                        debug!(
                            mailbox_id,
                            wait_ms = wait.as_millis() as u64,
                            "Quota wait exceeds bound, handing back to caller"
                        );
                        return Err(TriageError::QuotaWait {
                            mailbox_id: mailbox_id.to_string(),
                            wait,
                        });
                    }
                    debug!(
                        mailbox_id,
                        wait_ms = wait.as_millis() as u64,
                        units = cost.units(),
                        "Quota exhausted, waiting"
                    );
                    tokio::time::sleep(wait).await;
                    waited += wait;
                }
            }
        }
    }

    /// Get current statistics about quota usage for a mailbox
    pub async fn stats(&self, mailbox_id: &str) -> QuotaStats {
        let mut windows = self.windows.lock().await;
        let window = windows.entry(mailbox_id.to_string()).or_default();
        window.prune(Instant::now(), self.span);
        QuotaStats {
            used_units: window.used,
            capacity: self.capacity,
            window: self.span,
            total_consumed: window.total_consumed,
            total_operations: window.total_operations,
            total_waits: window.total_waits,
        }
    }
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self {
        Self {
            windows: Arc::clone(&self.windows),
            capacity: self.capacity,
            span: self.span,
            max_wait: self.max_wait,
        }
    }
}

/// Statistics about quota usage
#[derive(Debug, Clone)]
pub struct QuotaStats {
    /// Units consumed inside the current window
    pub used_units: u64,
    pub capacity: u32,
    pub window: Duration,
    /// Total quota units consumed since creation
    pub total_consumed: u64,
    /// Total operations admitted
    pub total_operations: u64,
    /// Reservations answered with MustWait
    pub total_waits: u64,
}
