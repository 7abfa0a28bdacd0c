//! Per-transport reconnect back-off.
//!
//! Each configured transport is tracked under its own identity
//! (`name@index`), so a flapping transport does not slow down retries of a
//! healthy one.

use std::collections::HashMap;
use std::time::Duration;

use el_domain::config::ConnectivityMethod;

/// Controls how long the orchestrator waits after a failed attempt.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Wait after the first failure.
    pub initial_delay: Duration,
    /// Cap on any single wait.
    pub max_delay: Duration,
    /// Multiplier applied after each consecutive failure.
    pub backoff_factor: f64,
    /// Extra random-ish share of the wait in `[0, jitter)`.  `0.0` disables.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    pub fn from_method(method: &ConnectivityMethod) -> Self {
        Self {
            initial_delay: method.initial_backoff(),
            max_delay: method.max_backoff(),
            backoff_factor: method.backoff_factor,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    fn grow(&self, current: Duration) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let next = current.as_secs_f64() * self.backoff_factor;
        Duration::from_secs_f64(next.min(max))
    }
}

#[derive(Debug)]
struct Entry {
    next_wait: Duration,
    failures: u32,
}

/// Back-off bookkeeping for every transport identity.
#[derive(Debug, Default)]
pub struct BackoffState {
    entries: HashMap<String, Entry>,
}

impl BackoffState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure for `id` and return how long to wait before the
    /// next attempt.  The first failure waits `initial_delay`; each further
    /// failure multiplies by `backoff_factor`, capped at `max_delay`.
    pub fn next(&mut self, id: &str, policy: &BackoffPolicy) -> Duration {
        let entry = self.entries.entry(id.to_string()).or_insert_with(|| Entry {
            next_wait: policy.initial_delay.min(policy.max_delay),
            failures: 0,
        });
        let wait = entry.next_wait;
        entry.failures = entry.failures.saturating_add(1);
        entry.next_wait = policy.grow(wait);

        if policy.jitter > 0.0 {
            let extra = wait.as_secs_f64() * policy.jitter * pseudo_random_fraction(entry.failures);
            wait + Duration::from_secs_f64(extra)
        } else {
            wait
        }
    }

    /// Forget the failure history of `id` after a successful connection.
    pub fn reset(&mut self, id: &str) {
        self.entries.remove(id);
    }

    /// Consecutive failures recorded for `id`.
    pub fn failures(&self, id: &str) -> u32 {
        self.entries.get(id).map_or(0, |e| e.failures)
    }
}

/// Cheap deterministic "random" fraction [0, 1) based on attempt number.
/// Not cryptographically secure; only spreads reconnect storms.
fn pseudo_random_fraction(attempt: u32) -> f64 {
    let hash = attempt.wrapping_mul(2654435761); // Knuth multiplicative hash
    (hash as f64) / (u32::MAX as f64 + 1.0)
}
