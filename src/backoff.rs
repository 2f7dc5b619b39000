//! Wait durations between attempts.
//!
//! A [`BackoffStrategy`] maps the zero-based index of the attempt that just
//! failed to the time to wait before the next one. Strategies are pure; the
//! jittered variants draw from a shared [`JitterSource`].

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

use crate::util::lock_unpoisoned;

const DEFAULT_CONSTANT_BACKOFF: Duration = Duration::from_secs(1);

pub trait BackoffStrategy: Send + Sync {
    fn wait(&self, attempt: u32) -> Duration;
}

impl<F> BackoffStrategy for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn wait(&self, attempt: u32) -> Duration {
        self(attempt)
    }
}

/// Random source for jittered backoff, safe to share between concurrent
/// retry loops.
pub struct JitterSource {
    rng: Mutex<StdRng>,
}

impl JitterSource {
    /// Seeds from the wall clock.
    pub fn from_time() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default();
        Self::seeded(seed)
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// `seconds` randomized by +/- a third, never below one millisecond.
    pub(crate) fn jitter(&self, seconds: u64) -> Duration {
        let millis = seconds.saturating_mul(1000).min(i64::MAX as u64) as i64;
        let spread = millis / 3;
        let offset = if spread > 0 {
            lock_unpoisoned(&self.rng).random_range(-spread..spread)
        } else {
            0
        };
        let jittered = millis.saturating_add(offset).max(1);
        Duration::from_millis(jittered as u64)
    }
}

impl Default for JitterSource {
    fn default() -> Self {
        Self::from_time()
    }
}

impl std::fmt::Debug for JitterSource {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("JitterSource").finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConstantBackoff {
    delay: Duration,
}

impl ConstantBackoff {
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for ConstantBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_CONSTANT_BACKOFF)
    }
}

impl BackoffStrategy for ConstantBackoff {
    fn wait(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// `2^attempt` seconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExponentialBackoff;

impl BackoffStrategy for ExponentialBackoff {
    fn wait(&self, attempt: u32) -> Duration {
        Duration::from_secs(exponential_seconds(attempt))
    }
}

/// `attempt` seconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinearBackoff;

impl BackoffStrategy for LinearBackoff {
    fn wait(&self, attempt: u32) -> Duration {
        Duration::from_secs(u64::from(attempt))
    }
}

#[derive(Clone, Debug)]
pub struct ExponentialJitterBackoff {
    jitter: Arc<JitterSource>,
}

impl ExponentialJitterBackoff {
    pub fn new(jitter: Arc<JitterSource>) -> Self {
        Self { jitter }
    }
}

impl BackoffStrategy for ExponentialJitterBackoff {
    fn wait(&self, attempt: u32) -> Duration {
        self.jitter.jitter(exponential_seconds(attempt))
    }
}

#[derive(Clone, Debug)]
pub struct LinearJitterBackoff {
    jitter: Arc<JitterSource>,
}

impl LinearJitterBackoff {
    pub fn new(jitter: Arc<JitterSource>) -> Self {
        Self { jitter }
    }
}

impl BackoffStrategy for LinearJitterBackoff {
    fn wait(&self, attempt: u32) -> Duration {
        self.jitter.jitter(u64::from(attempt))
    }
}

fn exponential_seconds(attempt: u32) -> u64 {
    1_u64.checked_shl(attempt).unwrap_or(u64::MAX)
}
