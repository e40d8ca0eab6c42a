//! Fixed-Window Rate Limiting
//!
//! Process-local counters keyed by (action, credential). Uses DashMap for
//! concurrent access without blocking; counters are eventually consistent
//! across threads, which is the guarantee the gate makes.
//!
//! This is a hot path component - runs on every tool call.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Separator between the scope name and the subject in bucket keys.
/// A unit separator cannot appear in either half.
const KEY_SEP: char = '\u{1f}';

#[derive(Debug, Clone)]
struct Bucket {
    count: u32,
    reset_at_ms: i64,
}

/// Registered per-action window configuration.
#[derive(Debug, Clone, Copy)]
struct WindowLimit {
    max: u32,
    window_ms: i64,
}

/// Fixed-window rate limiter.
///
/// Actions are registered at startup with a `(max, window)` pair; checks
/// for unregistered actions always pass. Constraint-declared quotas
/// (per-minute/hour/day) go through the `quota` variants, which carry the
/// window inline instead of a registration.
pub struct RateLimiter {
    limits: DashMap<String, WindowLimit>,
    buckets: DashMap<String, Bucket>,

    checks: AtomicU64,
    exceeded: AtomicU64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            limits: DashMap::new(),
            buckets: DashMap::new(),
            checks: AtomicU64::new(0),
            exceeded: AtomicU64::new(0),
        }
    }

    fn bucket_key(scope: &str, subject: &str) -> String {
        format!("{scope}{KEY_SEP}{subject}")
    }

    /// Register an action limit. Replaces any prior registration.
    pub fn register(&self, action: &str, max: u32, window_ms: i64) {
        self.limits
            .insert(action.to_string(), WindowLimit { max, window_ms });
    }

    /// Would a call for `(action, subject)` be admitted at `now_ms`?
    ///
    /// Does not consume a slot; pair with `increment` after the overall
    /// decision is a permit.
    pub fn check(&self, action: &str, subject: &str, now_ms: i64) -> bool {
        let limit = match self.limits.get(action) {
            Some(l) => *l,
            None => return true,
        };
        self.check_window(&Self::bucket_key(action, subject), limit, now_ms)
    }

    /// Consume a slot for `(action, subject)`.
    pub fn increment(&self, action: &str, subject: &str, now_ms: i64) {
        let limit = match self.limits.get(action) {
            Some(l) => *l,
            None => return,
        };
        self.increment_window(&Self::bucket_key(action, subject), limit, now_ms);
    }

    /// Check a constraint-declared quota without prior registration.
    pub fn check_quota(&self, scope: &str, subject: &str, max: u32, window_ms: i64, now_ms: i64) -> bool {
        self.check_window(
            &Self::bucket_key(scope, subject),
            WindowLimit { max, window_ms },
            now_ms,
        )
    }

    /// Consume a slot in a constraint-declared quota window.
    pub fn increment_quota(&self, scope: &str, subject: &str, max: u32, window_ms: i64, now_ms: i64) {
        self.increment_window(
            &Self::bucket_key(scope, subject),
            WindowLimit { max, window_ms },
            now_ms,
        );
    }

    /// Drop the bucket for `(scope, subject)`.
    pub fn reset(&self, scope: &str, subject: &str) {
        self.buckets.remove(&Self::bucket_key(scope, subject));
    }

    fn check_window(&self, key: &str, limit: WindowLimit, now_ms: i64) -> bool {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let allowed = match self.buckets.get(key) {
            Some(bucket) if bucket.reset_at_ms > now_ms => bucket.count < limit.max,
            _ => true,
        };
        if !allowed {
            self.exceeded.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    fn increment_window(&self, key: &str, limit: WindowLimit, now_ms: i64) {
        let mut entry = self.buckets.entry(key.to_string()).or_insert(Bucket {
            count: 0,
            reset_at_ms: now_ms + limit.window_ms,
        });
        if entry.reset_at_ms <= now_ms {
            entry.count = 0;
            entry.reset_at_ms = now_ms + limit.window_ms;
        }
        entry.count += 1;
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            buckets: self.buckets.len(),
            checks: self.checks.load(Ordering::Relaxed),
            exceeded: self.exceeded.load(Ordering::Relaxed),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub buckets: usize,
    pub checks: u64,
    pub exceeded: u64,
}

/// Running cumulative-cost totals per (action, credential).
///
/// Lives alongside the rate limiter with the same lifetime and keying; the
/// credential itself stays immutable.
pub struct CumulativeCostTracker {
    totals: DashMap<String, i64>,
}

impl CumulativeCostTracker {
    pub fn new() -> Self {
        Self {
            totals: DashMap::new(),
        }
    }

    fn key(action: &str, subject: &str) -> String {
        format!("{action}{KEY_SEP}{subject}")
    }

    /// Current total without mutating.
    pub fn peek(&self, action: &str, subject: &str) -> i64 {
        self.totals
            .get(&Self::key(action, subject))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Add spend after a permitted call.
    pub fn add(&self, action: &str, subject: &str, amount: i64) {
        *self.totals.entry(Self::key(action, subject)).or_insert(0) += amount;
    }

    pub fn reset(&self, action: &str, subject: &str) {
        self.totals.remove(&Self::key(action, subject));
    }
}

impl Default for CumulativeCostTracker {
    fn default() -> Self {
        Self::new()
    }
}
