//! Reconnection backoff: policy, injectable clock and per-backend retry state.
//!
//! The schedule is `delay(n) = min(base × 2^(n−1), cap)` for the n-th
//! consecutive failure. [`RetryTracker`] walks the explicit state machine
//!
//! ```text
//! Idle ──begin──▶ Connecting ──connected──▶ Idle (attempt = 0)
//!                     │
//!                  failure
//!                     ▼
//!            BackingOff(attempt, ready_at) ──begin──▶ Connecting
//!                     │
//!              (max_attempts hit)
//!                     ▼
//!                  GaveUp
//! ```
//!
//! Time is read through [`Clock`] so the schedule can be exercised without
//! real waits.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::ReconnectConfig;

// ── Clock ─────────────────────────────────────────────────────────────────────

/// Source of "now" for retry bookkeeping.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// Reads the tokio clock, so paused-time tests advance it too.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// Hand-driven clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self { now: Mutex::new(Instant::now()) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// ── BackoffPolicy ─────────────────────────────────────────────────────────────

/// Exponential backoff with a ceiling on the delay and an optional ceiling on
/// the number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
    max_attempts: Option<u32>,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap: cap.max(base), max_attempts: None }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.cap_delay_ms),
        )
        .with_max_attempts(config.max_attempts)
    }

    /// Delay before retrying after the `attempt`-th consecutive failure.
    /// `attempt == 0` means nothing has failed yet.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = (attempt - 1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.cap, |d| d.min(self.cap))
    }

    /// `true` once `attempt` failures have used up the attempt ceiling.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

// ── RetryState ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Connecting,
    BackingOff { attempt: u32, ready_at: Instant },
    GaveUp { attempts: u32 },
}

/// Per-backend retry state machine.
pub struct RetryTracker {
    policy: BackoffPolicy,
    clock: Arc<dyn Clock>,
    state: RetryState,
    attempt: u32,
}

impl RetryTracker {
    pub fn new(policy: BackoffPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { policy, clock, state: RetryState::Idle, attempt: 0 }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    /// Consecutive failures since the last successful connect.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn begin_attempt(&mut self) {
        if !matches!(self.state, RetryState::GaveUp { .. }) {
            self.state = RetryState::Connecting;
        }
    }

    pub fn on_connected(&mut self) {
        self.attempt = 0;
        self.state = RetryState::Idle;
    }

    /// Record a failed connect or a closed session and return the next state.
    pub fn on_failure(&mut self) -> RetryState {
        self.attempt = self.attempt.saturating_add(1);
        self.state = if self.policy.exhausted(self.attempt) {
            RetryState::GaveUp { attempts: self.attempt }
        } else {
            RetryState::BackingOff {
                attempt: self.attempt,
                ready_at: self.clock.now() + self.policy.delay(self.attempt),
            }
        };
        self.state
    }

    /// Time left before the next attempt may start; zero when ready.
    /// `None` when not backing off.
    pub fn remaining(&self) -> Option<Duration> {
        match self.state {
            RetryState::BackingOff { ready_at, .. } => {
                Some(ready_at.saturating_duration_since(self.clock.now()))
            }
            _ => None,
        }
    }
}
