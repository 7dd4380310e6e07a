//! Log-carried time.
//!
//! The apply path never reads the wall clock. Every committed entry carries a
//! leader-assigned timestamp, and those timestamps are the sole time source
//! for session expiry. The leader samples a [`LogClock`] when appending;
//! monotonicity across committed entries is enforced at append time.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A leader-assigned timestamp carried inside a log entry.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogTime {
    /// Milliseconds since an epoch (implementation-defined).
    pub ms: u64,
}

impl LogTime {
    /// Create a timestamp with the given millisecond value.
    pub const fn new(ms: u64) -> Self {
        Self { ms }
    }

    /// The zero timestamp.
    pub const fn zero() -> Self {
        Self { ms: 0 }
    }

    /// Add milliseconds.
    pub const fn add_ms(self, ms: u64) -> Self {
        Self { ms: self.ms + ms }
    }

    /// Check whether this time is at or after the deadline.
    pub const fn is_at_or_after(self, deadline: LogTime) -> bool {
        self.ms >= deadline.ms
    }

    /// Milliseconds elapsed since `earlier`, saturating at zero.
    pub fn since(self, earlier: LogTime) -> u64 {
        self.ms.saturating_sub(earlier.ms)
    }

    /// The later of two timestamps.
    pub fn max(self, other: LogTime) -> LogTime {
        if other.ms > self.ms {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for LogTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.ms)
    }
}

/// Source of leader-side timestamps.
///
/// Only consulted when appending entries, never during apply.
pub trait LogClock: Send + Sync {
    /// Sample the current time.
    fn now(&self) -> LogTime;
}

/// Wall-clock backed [`LogClock`] (default for real deployments).
#[derive(Debug, Default)]
pub struct WallClock;

impl LogClock for WallClock {
    fn now(&self) -> LogTime {
        let ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        LogTime::new(ms)
    }
}

/// Manually driven [`LogClock`] for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicU64,
}

impl ManualClock {
    /// Create a clock starting at the given millisecond value.
    pub fn new(ms: u64) -> Self {
        Self {
            ms: AtomicU64::new(ms),
        }
    }

    /// Set the current time.
    pub fn set(&self, ms: u64) {
        self.ms.store(ms, Ordering::Release);
    }

    /// Advance the current time.
    pub fn advance(&self, ms: u64) {
        self.ms.fetch_add(ms, Ordering::AcqRel);
    }
}

impl LogClock for ManualClock {
    fn now(&self) -> LogTime {
        LogTime::new(self.ms.load(Ordering::Acquire))
    }
}
