//! Millisecond clock with an injectable test variant.
//!
//! Timestamps, rate-limit refill, and dedupe TTLs all read the same
//! [`Clock`] handle, so tests can pin and advance time deterministically.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A cheaply cloneable source of milliseconds since the Unix epoch.
///
/// The system-backed clock is *monotonic-ish*: it never steps backwards
/// across reads from the same handle, even if the wall clock does.
///
/// # Examples
///
/// ```
/// use beacon::util::Clock;
///
/// let clock = Clock::manual(1_000);
/// assert_eq!(clock.now_millis(), 1_000);
/// clock.advance(500);
/// assert_eq!(clock.now_millis(), 1_500);
/// ```
#[derive(Debug, Clone)]
pub struct Clock {
    inner: Inner,
}

#[derive(Debug, Clone)]
enum Inner {
    System { last: Arc<AtomicU64> },
    Manual { now: Arc<AtomicU64> },
}

impl Clock {
    /// Wall-clock backed clock that never goes backwards.
    pub fn system() -> Self {
        Self {
            inner: Inner::System {
                last: Arc::new(AtomicU64::new(0)),
            },
        }
    }

    /// Manually advanced clock, for tests. Starts at `start_ms`.
    pub fn manual(start_ms: u64) -> Self {
        Self {
            inner: Inner::Manual {
                now: Arc::new(AtomicU64::new(start_ms)),
            },
        }
    }

    /// Current time in milliseconds since the Unix epoch.
    pub fn now_millis(&self) -> u64 {
        match &self.inner {
            Inner::System { last } => {
                let wall = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                // Pin to the highest value observed so far.
                let prev = last.fetch_max(wall, Ordering::Relaxed);
                wall.max(prev)
            }
            Inner::Manual { now } => now.load(Ordering::Relaxed),
        }
    }

    /// Advances a manual clock by `ms`. Has no effect on the system clock.
    pub fn advance(&self, ms: u64) {
        if let Inner::Manual { now } = &self.inner {
            now.fetch_add(ms, Ordering::Relaxed);
        }
    }

    /// Sets a manual clock to an absolute value. Has no effect on the system clock.
    pub fn set(&self, ms: u64) {
        if let Inner::Manual { now } = &self.inner {
            now.store(ms, Ordering::Relaxed);
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}
