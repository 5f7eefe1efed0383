//! Rate limiting of reconciles for a single deployment.
//!
//! A deployment that completed a reconcile at time T is not reconciled again before T + W,
//! where W is the configured meltdown duration. Watch events arriving inside the window are
//! deferred instead of dropped.
use std::time::Duration;

use k8s_openapi::chrono::{DateTime, Utc};

/// Interval `[start, start + duration)` during which reconciles are deferred.
#[derive(Debug, Clone, Copy)]
pub struct Window {
    start: Option<DateTime<Utc>>,
    duration: Duration,
}

impl Window {
    /// Window opened by the last completed reconcile, if any.
    pub fn new(duration: Duration, last_reconcile: Option<DateTime<Utc>>) -> Self {
        Self {
            start: last_reconcile,
            duration,
        }
    }

    /// Report whether `now` falls inside the window.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.remaining(now).is_some()
    }

    /// Time left until the window closes, None when `now` is outside of it.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let start = self.start?;
        // Negative elapsed time means a start in the future, never inside.
        let elapsed = (now - start).to_std().ok()?;
        self.duration
            .checked_sub(elapsed)
            .filter(|remaining| !remaining.is_zero())
    }
}
