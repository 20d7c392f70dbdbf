//! Deduplication middleware.
//!
//! Suppresses repeats of the same record inside a TTL window, keyed by a
//! stable fingerprint of the record's content. The first occurrence
//! passes; identical records drop until the window expires, after which
//! one more passes and opens a fresh window.
//!
//! The cache is a TTL-bounded, capacity-bounded LRU approximated by an
//! insertion-ordered map: every touch re-inserts the entry at the tail,
//! and eviction removes from the head.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;

use super::{KeyFn, Middleware, Next};
use crate::envelope::{Envelope, Record};
use crate::error::MiddlewareError;
use crate::util::Clock;
use crate::util::json::{UNDEFINED_SENTINEL, stable_string};

/// Cleanup runs once per this many envelopes.
const DEFAULT_CLEANUP_EVERY: u64 = 200;

/// Hard cap on cached fingerprints.
const DEFAULT_MAX_SIZE: usize = 10_000;

/// Depth cap handed to the stable serializer.
const DEFAULT_MAX_DEPTH: usize = 10;

/// Fingerprints longer than this are truncated.
const DEFAULT_MAX_FINGERPRINT_LENGTH: usize = 2_048;

/// Derives a fingerprint from a record. Records with equal fingerprints
/// are considered duplicates of each other.
pub type FingerprintFn = Arc<dyn Fn(&Record) -> String + Send + Sync>;

#[derive(Debug)]
struct Entry {
    expires_at: u64,
    last_seen: u64,
}

#[derive(Debug, Default)]
struct Entries {
    map: IndexMap<String, Entry>,
    ops: u64,
}

/// Middleware that drops duplicate records within a TTL window.
///
/// The default fingerprint covers a log's level, message, data, and error
/// (or an event's name and props), with mapping contents canonicalized by
/// [`stable_string`] so key order never affects equality.
///
/// # Examples
///
/// ```rust,no_run
/// use beacon::middleware::dedupe::DedupeMiddleware;
///
/// // Suppress repeats for 30 seconds, per user.
/// let dedupe = DedupeMiddleware::new(30_000)
///     .key(|env| env.ctx.get("user_id").and_then(|v| v.as_str()).map(str::to_owned));
/// ```
pub struct DedupeMiddleware {
    ttl_ms: u64,
    max_size: usize,
    cleanup_every: u64,
    max_depth: usize,
    max_fingerprint_length: usize,
    key: Option<KeyFn>,
    fingerprint: Option<FingerprintFn>,
    clock: Clock,
    entries: Mutex<Entries>,
}

impl DedupeMiddleware {
    /// Creates a deduper with the given suppression window.
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            max_size: DEFAULT_MAX_SIZE,
            cleanup_every: DEFAULT_CLEANUP_EVERY,
            max_depth: DEFAULT_MAX_DEPTH,
            max_fingerprint_length: DEFAULT_MAX_FINGERPRINT_LENGTH,
            key: None,
            fingerprint: None,
            clock: Clock::system(),
            entries: Mutex::new(Entries::default()),
        }
    }

    /// Cache capacity. Defaults to 10 000.
    #[must_use]
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// How many envelopes between cleanup sweeps. Defaults to 200.
    #[must_use]
    pub fn cleanup_every(mut self, cleanup_every: u64) -> Self {
        self.cleanup_every = cleanup_every.max(1);
        self
    }

    /// Depth cap for fingerprint serialization. Defaults to 10.
    #[must_use]
    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Fingerprint truncation length in characters. Defaults to 2048.
    #[must_use]
    pub fn max_fingerprint_length(mut self, length: usize) -> Self {
        self.max_fingerprint_length = length;
        self
    }

    /// Scopes the cache by a key derived from the envelope; absent keys
    /// share the `"global"` scope.
    #[must_use]
    pub fn key(mut self, key: impl Fn(&Envelope) -> Option<String> + Send + Sync + 'static) -> Self {
        self.key = Some(Arc::new(key));
        self
    }

    /// Replaces the default fingerprint derivation.
    #[must_use]
    pub fn fingerprint(mut self, fingerprint: impl Fn(&Record) -> String + Send + Sync + 'static) -> Self {
        self.fingerprint = Some(Arc::new(fingerprint));
        self
    }

    /// Replaces the clock. Tests pin this to a manual clock.
    #[must_use]
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn fingerprint_of(&self, record: &Record) -> String {
        let mut fp = match &self.fingerprint {
            Some(custom) => custom(record),
            None => self.default_fingerprint(record),
        };
        if fp.chars().count() > self.max_fingerprint_length {
            fp = fp.chars().take(self.max_fingerprint_length).collect();
        }
        fp
    }

    fn default_fingerprint(&self, record: &Record) -> String {
        let stable_opt = |value: &Option<Value>| match value {
            Some(value) => stable_string(value, self.max_depth),
            // Absent fields render the undefined sentinel, quoted the way
            // stable_string renders any string scalar.
            None => format!("\"{UNDEFINED_SENTINEL}\""),
        };
        match record {
            Record::Log(log) => format!(
                "log:{}:{}|data={}|err={}",
                log.level,
                log.msg,
                stable_opt(&log.data),
                stable_opt(&log.err),
            ),
            Record::Event(event) => {
                format!("event:{}|props={}", event.name, stable_opt(&event.props))
            }
        }
    }

    fn scope_key(&self, envelope: &Envelope) -> String {
        self.key
            .as_ref()
            .and_then(|key_fn| key_fn(envelope))
            .unwrap_or_else(|| "global".to_owned())
    }

    /// Returns `true` when the envelope should pass (first sighting or
    /// expired window).
    fn check(&self, id: String, now: u64) -> bool {
        let mut state = self.entries.lock();
        state.ops += 1;
        if state.ops % self.cleanup_every == 0 {
            self.cleanup(&mut state, now);
        }

        match state.map.shift_remove(&id) {
            // First sighting: open a window and pass.
            None => {
                state.map.insert(
                    id,
                    Entry {
                        expires_at: now + self.ttl_ms,
                        last_seen: now,
                    },
                );
                while state.map.len() > self.max_size {
                    state.map.shift_remove_index(0);
                }
                true
            }
            // Inside the window: refresh recency only, drop.
            Some(mut entry) if now < entry.expires_at => {
                entry.last_seen = now;
                state.map.insert(id, entry);
                false
            }
            // Window expired: open a new one, pass.
            Some(mut entry) => {
                entry.expires_at = now + self.ttl_ms;
                entry.last_seen = now;
                state.map.insert(id, entry);
                true
            }
        }
    }

    fn cleanup(&self, state: &mut Entries, now: u64) {
        state.map.retain(|_, entry| now < entry.expires_at);
        while state.map.len() > self.max_size {
            state.map.shift_remove_index(0);
        }
    }
}

impl Middleware for DedupeMiddleware {
    fn handle(
        &self,
        envelope: Envelope,
        next: Next,
    ) -> Pin<Box<dyn Future<Output = Result<(), MiddlewareError>> + Send>> {
        let id = format!(
            "{}::{}",
            self.scope_key(&envelope),
            self.fingerprint_of(&envelope.record)
        );
        let pass = self.check(id, self.clock.now_millis());
        Box::pin(async move {
            if pass {
                next.run(envelope).await
            } else {
                Ok(())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Ctx, EventRecord, Level, LogRecord};
    use crate::middleware::MiddlewareHandler;
    use crate::middleware::from_middleware;
    use crate::middleware::test_support::{log_envelope, passes};
    use serde_json::json;

    fn handler(mw: DedupeMiddleware) -> MiddlewareHandler {
        from_middleware(Arc::new(mw))
    }

    fn log_with_data(msg: &str, data: Value) -> Envelope {
        Envelope::new(
            1,
            Ctx::new(),
            Record::Log(LogRecord::new(Level::Info, msg).with_data(data)),
        )
    }

    #[tokio::test]
    async fn ttl_window_boundary() {
        let clock = Clock::manual(0);
        let h = handler(DedupeMiddleware::new(1_000).clock(clock.clone()));

        let mut passed = 0;
        for i in 0..3 {
            if passes(&h, log_envelope(i, Level::Info, "hello")).await {
                passed += 1;
            }
        }
        assert_eq!(passed, 1);

        // One millisecond short of expiry: still suppressed.
        clock.set(999);
        if passes(&h, log_envelope(10, Level::Info, "hello")).await {
            passed += 1;
        }
        assert_eq!(passed, 1);

        // Exactly at expiry: passes and opens a new window.
        clock.set(1_000);
        if passes(&h, log_envelope(11, Level::Info, "hello")).await {
            passed += 1;
        }
        assert_eq!(passed, 2);
    }

    #[tokio::test]
    async fn within_window_touch_does_not_extend_expiry() {
        let clock = Clock::manual(0);
        let h = handler(DedupeMiddleware::new(1_000).clock(clock.clone()));

        assert!(passes(&h, log_envelope(0, Level::Info, "x")).await);
        clock.set(900);
        assert!(!passes(&h, log_envelope(1, Level::Info, "x")).await);
        // The 900ms touch must not push expiry past 1000.
        clock.set(1_000);
        assert!(passes(&h, log_envelope(2, Level::Info, "x")).await);
    }

    #[tokio::test]
    async fn lru_eviction_forgets_oldest() {
        let clock = Clock::manual(0);
        let h = handler(
            DedupeMiddleware::new(10_000)
                .max_size(2)
                .cleanup_every(1)
                .clock(clock),
        );

        let mut passed = 0;
        for msg in ["a", "b", "c"] {
            if passes(&h, log_envelope(0, Level::Info, msg)).await {
                passed += 1;
            }
        }
        assert_eq!(passed, 3);

        // "a" was evicted to make room for "c", so it passes again.
        if passes(&h, log_envelope(1, Level::Info, "a")).await {
            passed += 1;
        }
        assert_eq!(passed, 4);
    }

    #[tokio::test]
    async fn distinct_payloads_are_not_duplicates() {
        let h = handler(DedupeMiddleware::new(10_000).clock(Clock::manual(0)));

        assert!(passes(&h, log_with_data("m", json!({"n": 1}))).await);
        assert!(passes(&h, log_with_data("m", json!({"n": 2}))).await);
        assert!(!passes(&h, log_with_data("m", json!({"n": 1}))).await);
    }

    #[tokio::test]
    async fn absent_payload_is_not_a_null_payload() {
        let h = handler(DedupeMiddleware::new(10_000).clock(Clock::manual(0)));

        // No data at all vs an explicit JSON null: different fingerprints.
        assert!(passes(&h, log_envelope(0, Level::Info, "m")).await);
        assert!(passes(&h, log_with_data("m", json!(null))).await);
        assert!(!passes(&h, log_envelope(1, Level::Info, "m")).await);
    }

    #[tokio::test]
    async fn fingerprint_ignores_key_order() {
        let h = handler(DedupeMiddleware::new(10_000).clock(Clock::manual(0)));

        assert!(passes(&h, log_with_data("m", json!({"a": 1, "b": 2}))).await);
        // Same content, different construction order: a duplicate.
        assert!(!passes(&h, log_with_data("m", json!({"b": 2, "a": 1}))).await);
    }

    #[tokio::test]
    async fn events_fingerprint_on_name_and_props() {
        let clock = Clock::manual(0);
        let h = handler(DedupeMiddleware::new(10_000).clock(clock));

        let event = |name: &str, props: Value| {
            Envelope::new(
                0,
                Ctx::new(),
                Record::Event(EventRecord::new(name).with_props(props)),
            )
        };

        assert!(passes(&h, event("click", json!({"x": 1}))).await);
        assert!(!passes(&h, event("click", json!({"x": 1}))).await);
        assert!(passes(&h, event("click", json!({"x": 2}))).await);
        assert!(passes(&h, event("tap", json!({"x": 1}))).await);
    }

    #[tokio::test]
    async fn scope_key_isolates_caches() {
        let h = handler(
            DedupeMiddleware::new(10_000)
                .key(|env| env.ctx.get("user").and_then(|v| v.as_str()).map(str::to_owned))
                .clock(Clock::manual(0)),
        );

        let for_user = |user: &str| {
            let mut env = log_envelope(0, Level::Info, "same");
            env.ctx.set("user", user);
            env
        };

        assert!(passes(&h, for_user("alice")).await);
        assert!(!passes(&h, for_user("alice")).await);
        assert!(passes(&h, for_user("bob")).await);
    }

    #[tokio::test]
    async fn custom_fingerprint_overrides_default() {
        // Collapse everything to one fingerprint: only the first passes.
        let h = handler(
            DedupeMiddleware::new(10_000)
                .fingerprint(|_| "all-the-same".to_owned())
                .clock(Clock::manual(0)),
        );

        assert!(passes(&h, log_envelope(0, Level::Info, "one")).await);
        assert!(!passes(&h, log_envelope(1, Level::Error, "two")).await);
    }

    #[tokio::test]
    async fn long_fingerprints_are_truncated() {
        let clock = Clock::manual(0);
        let h = handler(
            DedupeMiddleware::new(10_000)
                .max_fingerprint_length(32)
                .clock(clock),
        );

        // These two differ only past the truncation point, so they collide.
        let long_a = format!("{}A", "p".repeat(100));
        let long_b = format!("{}B", "p".repeat(100));

        assert!(passes(&h, log_envelope(0, Level::Info, &long_a)).await);
        assert!(!passes(&h, log_envelope(1, Level::Info, &long_b)).await);
    }
}
