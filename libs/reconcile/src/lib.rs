//! Reconciliation loop primitives.
//!
//! Helpers shared by every waiting step of the serving reconciler:
//!
//! - [`Deadline`]: an absolute point after which a phase gives up.
//! - [`Backoff`]: exponential delays between retry attempts.
//! - [`SpecHash`]: a stable digest of a desired state, stamped onto cluster
//!   resources so a live object can be traced to the config that produced it.
//!
//! # Invariants
//!
//! - Every wait is bounded: loops built from these types always terminate
//!   once their [`Deadline`] passes.
//! - Time is read from `tokio::time`, so paused-clock tests drive the same
//!   code paths as production.

use std::time::Duration;

use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// Default interval between cluster polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default number of create attempts before a conflict is considered exhausted.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// An absolute deadline for a bounded phase.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    /// Start a deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    /// The configured budget.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time spent since the deadline was started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before expiry (zero once expired).
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.elapsed() >= self.budget
    }

    /// Sleep for `interval`, clamped so we never oversleep the deadline.
    ///
    /// Returns `false` without sleeping if the deadline already passed.
    pub async fn sleep_within(&self, interval: Duration) -> bool {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return false;
        }
        tokio::time::sleep(interval.min(remaining)).await;
        true
    }
}

/// Exponential backoff: `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: false,
        }
    }

    /// Add up to 25% random jitter on top of each delay.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after the given (zero-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let extra_ms = rand::rng().random_range(0..=delay.as_millis() as u64 / 4);
        (delay + Duration::from_millis(extra_ms)).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(16))
    }
}

/// A spec hash for deterministic comparison of desired states.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let digest = Sha256::digest(canonical.as_bytes());
        // 16 bytes keeps the hash short enough for a label value.
        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", serde_json::Value::from(k.as_str()), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}
