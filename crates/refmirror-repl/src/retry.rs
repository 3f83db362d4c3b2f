//! Retry policy for failed push attempts.
//!
//! The interval between attempts comes from the destination configuration;
//! how it grows from one attempt to the next is a pluggable [`BackoffStrategy`].

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Computes the wait before a retry.
pub trait BackoffStrategy: Debug + Send + Sync {
    /// Delay before retry number `retry` (1-based), given the configured base interval.
    fn delay(&self, base: Duration, retry: u32) -> Duration;
}

/// Same interval before every retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedBackoff;

impl BackoffStrategy for FixedBackoff {
    fn delay(&self, base: Duration, _retry: u32) -> Duration {
        base
    }
}

/// Interval multiplied on every retry, capped, with optional jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Growth factor per retry.
    pub multiplier: f64,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
    /// Add up to 10% random jitter.
    pub jitter: bool,
}

impl ExponentialBackoff {
    /// Doubling backoff capped at `max_delay`, without jitter.
    pub fn new(max_delay: Duration) -> Self {
        Self {
            multiplier: 2.0,
            max_delay,
            jitter: false,
        }
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self, base: Duration, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let computed = base.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = computed.min(self.max_delay.as_secs_f64());
        let mut delay = Duration::from_secs_f64(capped.max(0.0));
        if self.jitter && !delay.is_zero() {
            let extra_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 10);
            delay += Duration::from_millis(extra_ms);
        }
        delay
    }
}

/// Which backoff strategy a destination uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackoffKind {
    /// [`FixedBackoff`].
    #[default]
    Fixed,
    /// [`ExponentialBackoff`].
    Exponential,
}

/// Retry settings of one destination.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base interval between attempts.
    pub interval: Duration,
    /// Retries allowed after the first attempt; `None` retries forever.
    pub max_retries: Option<u32>,
    /// Growth of the interval.
    pub backoff: Arc<dyn BackoffStrategy>,
}

impl RetryPolicy {
    /// Fixed-interval policy.
    pub fn fixed(interval: Duration, max_retries: Option<u32>) -> Self {
        Self {
            interval,
            max_retries,
            backoff: Arc::new(FixedBackoff),
        }
    }

    /// Whether a task that has already made `attempts` attempts may try again.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        match self.max_retries {
            None => true,
            Some(max) => attempts <= max,
        }
    }

    /// Delay before the attempt that follows `attempts` failed ones.
    pub fn delay_after(&self, attempts: u32) -> Duration {
        self.backoff.delay(self.interval, attempts.max(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(60), None)
    }
}
