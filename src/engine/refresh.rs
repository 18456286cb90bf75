//! Auto-refresh scheduler
//!
//! Fallback polling while the push channel is degraded. The scheduler is a
//! logical state machine pulled by timer ticks; the async driver owns the
//! actual timer. Two rules are enforced here: the timer is suppressed
//! entirely while the push channel is healthy, and at most one poll request
//! is in flight at a time; a tick that fires during an outstanding poll is
//! skipped, not queued. A timed-out poll gets no immediate retry; the next
//! tick retries.

use std::time::Duration;

/// What a timer tick resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Issue one poll request now
    Poll,
    /// A poll is already outstanding; this tick is skipped
    SkippedInFlight,
    /// The push channel is healthy; polling is suppressed
    Suppressed,
}

/// Periodic poll trigger, active only while the push channel is degraded
#[derive(Debug)]
pub struct RefreshScheduler {
    interval: Duration,
    poll_timeout: Duration,
    active: bool,
    in_flight: bool,
}

impl RefreshScheduler {
    /// Create a scheduler with the given tick interval and per-poll timeout
    pub fn new(interval: Duration, poll_timeout: Duration) -> Self {
        Self {
            interval,
            poll_timeout,
            active: false,
            in_flight: false,
        }
    }

    /// Tick interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Deadline applied to each poll request
    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// Arm the timer (push channel degraded)
    pub fn activate(&mut self) {
        if !self.active {
            tracing::debug!("auto-refresh armed");
        }
        self.active = true;
    }

    /// Disarm the timer (push channel healthy or recovering)
    pub fn suspend(&mut self) {
        if self.active {
            tracing::debug!("auto-refresh suspended");
        }
        self.active = false;
    }

    /// Whether the periodic timer is armed
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether a poll request is currently outstanding
    pub fn poll_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Resolve a timer tick
    ///
    /// Returns [`TickOutcome::Poll`] at most once per outstanding poll; the
    /// caller must report completion via [`poll_finished`].
    ///
    /// [`poll_finished`]: RefreshScheduler::poll_finished
    pub fn on_tick(&mut self) -> TickOutcome {
        if !self.active {
            return TickOutcome::Suppressed;
        }
        if self.in_flight {
            return TickOutcome::SkippedInFlight;
        }
        self.in_flight = true;
        TickOutcome::Poll
    }

    /// Claim the single in-flight poll slot outside the timer
    ///
    /// Used for the gap-fill poll issued on reconnect; returns false when a
    /// poll is already outstanding.
    pub fn begin_poll(&mut self) -> bool {
        if self.in_flight {
            return false;
        }
        self.in_flight = true;
        true
    }

    /// Release the in-flight slot after a response, failure, or timeout
    pub fn poll_finished(&mut self) {
        self.in_flight = false;
    }
}
