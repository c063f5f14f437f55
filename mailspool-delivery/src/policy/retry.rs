//! Retry scheduling for transient delivery failures.
//!
//! [`RetryPolicy::record_failure`] is a pure function of the entry's current
//! retry state, the current time and a source of randomness. It either
//! returns the state to persist or tells the caller to give up.

use std::time::{Duration, SystemTime};

use mailspool_spool::RetryState;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Persist this state and try again once it is due
    Keep(RetryState),
    /// The retry budget is spent, delete the entry
    Discard,
}

/// Exponential backoff with additive jitter.
///
/// The first failure schedules the next attempt after
/// `initial_delay + random(0, jitter_max)`. Failure number `k > 1` schedules it
/// after `growth_base^k * initial_delay + random(0, jitter_max)`, optionally
/// capped at `max_delay`. A failure once `max_retries` retries have been
/// recorded discards the entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry (in milliseconds).
    ///
    /// Default: 300000 (5 minutes)
    #[serde(default = "defaults::initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound of the random delay added to every retry (in milliseconds).
    ///
    /// Default: 300000 (5 minutes)
    #[serde(default = "defaults::jitter_max_ms")]
    pub jitter_max_ms: u64,

    /// Number of retries before an entry is discarded.
    ///
    /// Default: 12
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Base of the exponential growth curve.
    ///
    /// Default: e
    #[serde(default = "defaults::growth_base")]
    pub growth_base: f64,

    /// Cap on the backoff before jitter (in milliseconds), if any.
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: defaults::initial_delay_ms(),
            jitter_max_ms: defaults::jitter_max_ms(),
            max_retries: defaults::max_retries(),
            growth_base: defaults::growth_base(),
            max_delay_ms: None,
        }
    }
}

impl RetryPolicy {
    /// Record a transient failure at `now`
    #[must_use]
    pub fn record_failure(&self, current: Option<RetryState>, now: SystemTime) -> RetryDecision {
        self.record_failure_with(current, now, &mut rand::rng())
    }

    /// [`RetryPolicy::record_failure`] with an explicit random source
    #[must_use]
    pub fn record_failure_with<R: Rng + ?Sized>(
        &self,
        current: Option<RetryState>,
        now: SystemTime,
        rng: &mut R,
    ) -> RetryDecision {
        let retry_count = match current {
            None => 1,
            Some(state) if state.retry_count >= self.max_retries => return RetryDecision::Discard,
            Some(state) => state.retry_count + 1,
        };

        let jitter = Duration::from_millis(rng.random_range(0..=self.jitter_max_ms));
        let delay = self.backoff(retry_count).saturating_add(jitter);

        RetryDecision::Keep(RetryState {
            retry_count,
            next_attempt_at: saturating_add(now, delay),
        })
    }

    /// Backoff before jitter for the `retry_count`th retry
    #[must_use]
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let initial = Duration::from_millis(self.initial_delay_ms);

        let delay = if retry_count <= 1 {
            initial
        } else {
            let exponent = i32::try_from(retry_count.min(self.max_retries)).unwrap_or(i32::MAX);
            #[allow(clippy::cast_precision_loss)]
            let millis = self.growth_base.powi(exponent) * self.initial_delay_ms as f64;

            Duration::try_from_secs_f64(millis / 1000.0).unwrap_or(Duration::MAX)
        };

        self.max_delay_ms
            .map_or(delay, |max| delay.min(Duration::from_millis(max)))
    }
}

/// `now + delay`, clamped to the latest representable time
fn saturating_add(now: SystemTime, mut delay: Duration) -> SystemTime {
    loop {
        if let Some(at) = now.checked_add(delay) {
            return at;
        }
        delay /= 2;
    }
}

mod defaults {
    pub const fn initial_delay_ms() -> u64 {
        300_000 // 5 minutes
    }

    pub const fn jitter_max_ms() -> u64 {
        300_000 // 5 minutes
    }

    pub const fn max_retries() -> u32 {
        12
    }

    pub const fn growth_base() -> f64 {
        std::f64::consts::E
    }
}
