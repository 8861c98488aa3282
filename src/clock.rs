//! Clock and ID generation — component A.
//!
//! Every timestamp and identifier in the rest of the crate flows through
//! these two traits instead of calling `Utc::now()` / `Uuid::new_v4()`
//! directly, so breaker cooldown windows and JWT claim arithmetic can be
//! driven by a fixed clock in tests.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use uuid::Uuid;

/// Source of truth for "now", injectable for deterministic tests.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;

    /// Current time as an RFC 3339 string (UTC).
    fn now_rfc3339(&self) -> String;

    /// Current time in whole seconds since the Unix epoch, for JWT claims.
    fn now_unix_seconds(&self) -> i64 {
        self.now_millis() / 1000
    }
}

/// Wall-clock implementation backed by `chrono::Utc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn now_rfc3339(&self) -> String {
        Utc::now().to_rfc3339()
    }
}

/// A clock fixed at construction time, with an atomic counter so tests can
/// advance it explicitly (`advance_millis`) to exercise cooldown/timeout
/// boundaries without sleeping.
#[derive(Debug)]
pub struct FixedClock {
    millis: AtomicI64,
}

impl FixedClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(start_millis),
        }
    }

    pub fn advance_millis(&self, delta: i64) {
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_millis(&self, value: i64) {
        self.millis.store(value, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }

    fn now_rfc3339(&self) -> String {
        chrono::DateTime::from_timestamp_millis(self.now_millis())
            .unwrap_or_default()
            .to_rfc3339()
    }
}

/// Generates identifiers for tasks, agents, and push configs.
pub trait IdGenerator: Send + Sync {
    fn new_id(&self) -> String;
}

/// Production generator — random UUID v4 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn new_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Deterministic generator for tests — `prefix-1`, `prefix-2`, ...
#[derive(Debug)]
pub struct SequentialIds {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl IdGenerator for SequentialIds {
    fn new_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{n}", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_advances_explicitly() {
        let clock = FixedClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        clock.advance_millis(500);
        assert_eq!(clock.now_millis(), 1_500);
        assert_eq!(clock.now_unix_seconds(), 1);
    }

    #[test]
    fn sequential_ids_increment() {
        let gen = SequentialIds::new("task");
        assert_eq!(gen.new_id(), "task-1");
        assert_eq!(gen.new_id(), "task-2");
    }
}
