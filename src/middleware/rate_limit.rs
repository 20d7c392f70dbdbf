//! Token-bucket rate limiting middleware.
//!
//! One bucket per (scope, rule) pair. A rule names a sustained limit over
//! an interval plus an optional burst capacity; buckets refill
//! continuously at `limit / interval_ms` tokens per millisecond and start
//! full, so a fresh actor gets its whole burst immediately. Envelopes
//! that find an empty bucket are dropped silently.
//!
//! Buckets live in an insertion-ordered map re-inserted on every touch,
//! so map order approximates recency: cleanup evicts idle buckets by TTL
//! and the oldest buckets once the map outgrows its cap.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::{KeyFn, Middleware, Next};
use crate::envelope::{Envelope, Level, Record};
use crate::error::MiddlewareError;
use crate::util::Clock;

/// Idle buckets older than this are evicted. 10 minutes.
const DEFAULT_BUCKET_TTL_MS: u64 = 10 * 60 * 1000;

/// Cleanup runs once per this many envelopes.
const DEFAULT_CLEANUP_EVERY: u64 = 200;

/// Hard cap on tracked buckets.
const DEFAULT_MAX_BUCKETS: usize = 10_000;

/// A sustained rate with an optional burst capacity.
///
/// # Examples
///
/// ```
/// use beacon::middleware::rate_limit::RateRule;
///
/// // 5 per second sustained, bursts of up to 20.
/// let rule = RateRule::new(5, 1_000).with_burst(20);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    /// Tokens granted per interval.
    pub limit: u32,
    /// Refill interval in milliseconds.
    pub interval_ms: u64,
    /// Bucket capacity; defaults to `limit`.
    pub burst: Option<u32>,
}

impl RateRule {
    /// A rule allowing `limit` envelopes per `interval_ms`.
    pub fn new(limit: u32, interval_ms: u64) -> Self {
        Self {
            limit,
            interval_ms,
            burst: None,
        }
    }

    /// Overrides the bucket capacity.
    #[must_use]
    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = Some(burst);
        self
    }

    fn capacity(&self) -> f64 {
        f64::from(self.burst.unwrap_or(self.limit))
    }

    /// Tokens per millisecond.
    fn refill_rate(&self) -> f64 {
        if self.interval_ms == 0 {
            return f64::INFINITY;
        }
        f64::from(self.limit) / self.interval_ms as f64
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: u64,
    last_seen: u64,
}

#[derive(Debug, Default)]
struct Buckets {
    map: IndexMap<String, Bucket>,
    ops: u64,
}

/// Middleware that rate-limits envelopes with per-(scope, rule) token
/// buckets.
///
/// Rule resolution: logs use the level's rule, then
/// [`default_log`](Self::default_log); events use the name's rule, then
/// the `"*"` wildcard, then [`default_event`](Self::default_event).
/// Records without a rule pass unlimited. The bucket is keyed by the
/// record's own level or name, so events sharing a wildcard rule still
/// meter independently per name.
///
/// # Examples
///
/// ```rust,no_run
/// use beacon::envelope::Level;
/// use beacon::middleware::rate_limit::{RateLimitMiddleware, RateRule};
///
/// let limiter = RateLimitMiddleware::new()
///     .log_rule(Level::Debug, RateRule::new(10, 1_000))
///     .event_rule("*", RateRule::new(100, 60_000))
///     .key(|env| env.ctx.get("user_id").and_then(|v| v.as_str()).map(str::to_owned));
/// ```
pub struct RateLimitMiddleware {
    log_rules: HashMap<Level, RateRule>,
    default_log: Option<RateRule>,
    event_rules: HashMap<String, RateRule>,
    default_event: Option<RateRule>,
    key: Option<KeyFn>,
    clock: Clock,
    bucket_ttl_ms: u64,
    max_buckets: usize,
    cleanup_every: u64,
    buckets: Mutex<Buckets>,
}

impl Default for RateLimitMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitMiddleware {
    /// Creates a limiter with no rules: everything passes until configured.
    pub fn new() -> Self {
        Self {
            log_rules: HashMap::new(),
            default_log: None,
            event_rules: HashMap::new(),
            default_event: None,
            key: None,
            clock: Clock::system(),
            bucket_ttl_ms: DEFAULT_BUCKET_TTL_MS,
            max_buckets: DEFAULT_MAX_BUCKETS,
            cleanup_every: DEFAULT_CLEANUP_EVERY,
            buckets: Mutex::new(Buckets::default()),
        }
    }

    /// Sets the rule for one log level.
    #[must_use]
    pub fn log_rule(mut self, level: Level, rule: RateRule) -> Self {
        self.log_rules.insert(level, rule);
        self
    }

    /// Fallback rule for log levels without a specific rule.
    #[must_use]
    pub fn default_log(mut self, rule: RateRule) -> Self {
        self.default_log = Some(rule);
        self
    }

    /// Sets the rule for one event name; `"*"` matches any event without
    /// a specific rule.
    #[must_use]
    pub fn event_rule(mut self, name: impl Into<String>, rule: RateRule) -> Self {
        self.event_rules.insert(name.into(), rule);
        self
    }

    /// Fallback rule for events matching neither a name nor the wildcard.
    #[must_use]
    pub fn default_event(mut self, rule: RateRule) -> Self {
        self.default_event = Some(rule);
        self
    }

    /// Scopes buckets by a key derived from the envelope; absent keys
    /// share the `"global"` scope.
    #[must_use]
    pub fn key(mut self, key: impl Fn(&Envelope) -> Option<String> + Send + Sync + 'static) -> Self {
        self.key = Some(Arc::new(key));
        self
    }

    /// Replaces the clock. Tests pin this to a manual clock.
    #[must_use]
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Idle-bucket eviction horizon. Defaults to 10 minutes.
    #[must_use]
    pub fn bucket_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.bucket_ttl_ms = ttl_ms;
        self
    }

    /// Bucket-count cap enforced during cleanup. Defaults to 10 000.
    #[must_use]
    pub fn max_buckets(mut self, max_buckets: usize) -> Self {
        self.max_buckets = max_buckets;
        self
    }

    /// How many envelopes between cleanup sweeps. Defaults to 200.
    #[must_use]
    pub fn cleanup_every(mut self, cleanup_every: u64) -> Self {
        self.cleanup_every = cleanup_every.max(1);
        self
    }

    fn resolve(&self, record: &Record) -> Option<(RateRule, String)> {
        match record {
            Record::Log(log) => self
                .log_rules
                .get(&log.level)
                .or(self.default_log.as_ref())
                .map(|rule| (*rule, format!("log:{}", log.level))),
            Record::Event(event) => self
                .event_rules
                .get(&event.name)
                .or_else(|| self.event_rules.get("*"))
                .or(self.default_event.as_ref())
                .map(|rule| (*rule, format!("event:{}", event.name))),
        }
    }

    fn scope_key(&self, envelope: &Envelope) -> String {
        self.key
            .as_ref()
            .and_then(|key_fn| key_fn(envelope))
            .unwrap_or_else(|| "global".to_owned())
    }

    /// Refills and decrements the bucket for `id`, creating it full if
    /// absent or individually stale. Returns whether a token was taken.
    fn acquire(&self, id: &str, rule: RateRule, now: u64) -> bool {
        let mut state = self.buckets.lock();
        state.ops += 1;
        if state.ops % self.cleanup_every == 0 {
            self.cleanup(&mut state, now);
        }

        let capacity = rule.capacity();
        let mut bucket = match state.map.shift_remove(id) {
            Some(bucket) if now.saturating_sub(bucket.last_seen) <= self.bucket_ttl_ms => bucket,
            _ => Bucket {
                tokens: capacity,
                last_refill: now,
                last_seen: now,
            },
        };

        let elapsed = now.saturating_sub(bucket.last_refill) as f64;
        bucket.tokens = (bucket.tokens + elapsed * rule.refill_rate()).min(capacity);
        bucket.last_refill = now;
        bucket.last_seen = now;

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }
        // Tail re-insert: map order approximates recency.
        state.map.insert(id.to_owned(), bucket);
        allowed
    }

    fn cleanup(&self, state: &mut Buckets, now: u64) {
        let ttl = self.bucket_ttl_ms;
        state
            .map
            .retain(|_, bucket| now.saturating_sub(bucket.last_seen) <= ttl);
        while state.map.len() > self.max_buckets {
            state.map.shift_remove_index(0);
        }
    }
}

impl Middleware for RateLimitMiddleware {
    fn handle(
        &self,
        envelope: Envelope,
        next: Next,
    ) -> Pin<Box<dyn Future<Output = Result<(), MiddlewareError>> + Send>> {
        let allowed = match self.resolve(&envelope.record) {
            None => true, // unlimited
            Some((rule, rule_id)) => {
                let scope = self.scope_key(&envelope);
                let id = format!("{scope}::{rule_id}");
                self.acquire(&id, rule, self.clock.now_millis())
            }
        };
        Box::pin(async move {
            if allowed {
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
    use crate::middleware::from_middleware;
    use crate::middleware::test_support::{event_envelope, log_envelope, passes};
    use crate::middleware::MiddlewareHandler;

    fn handler(mw: RateLimitMiddleware) -> MiddlewareHandler {
        from_middleware(Arc::new(mw))
    }

    #[tokio::test]
    async fn burst_then_refill_for_logs() {
        let clock = Clock::manual(0);
        let h = handler(
            RateLimitMiddleware::new()
                .log_rule(Level::Debug, RateRule::new(2, 1_000))
                .clock(clock.clone()),
        );

        let mut passed = 0;
        for i in 0..3 {
            if passes(&h, log_envelope(i, Level::Debug, "m")).await {
                passed += 1;
            }
        }
        assert_eq!(passed, 2);

        // Half the interval refills one token.
        clock.set(500);
        for i in 0..2 {
            if passes(&h, log_envelope(10 + i, Level::Debug, "m")).await {
                passed += 1;
            }
        }
        assert_eq!(passed, 3);

        clock.set(1_000);
        if passes(&h, log_envelope(20, Level::Debug, "m")).await {
            passed += 1;
        }
        assert_eq!(passed, 4);
    }

    #[tokio::test]
    async fn wildcard_and_specific_event_rules_meter_separately() {
        let clock = Clock::manual(0);
        let h = handler(
            RateLimitMiddleware::new()
                .event_rule("*", RateRule::new(1, 1_000))
                .event_rule("page_view", RateRule::new(2, 1_000))
                .clock(clock.clone()),
        );

        let mut passed = 0;
        for i in 0..3 {
            if passes(&h, event_envelope(i, "page_view")).await {
                passed += 1;
            }
        }
        assert_eq!(passed, 2);

        for i in 0..2 {
            if passes(&h, event_envelope(10 + i, "click")).await {
                passed += 1;
            }
        }
        assert_eq!(passed, 3);

        clock.advance(1_000);
        if passes(&h, event_envelope(20, "click")).await {
            passed += 1;
        }
        assert_eq!(passed, 4);
    }

    #[tokio::test]
    async fn burst_capacity_overrides_limit() {
        let h = handler(
            RateLimitMiddleware::new()
                .log_rule(Level::Info, RateRule::new(1, 1_000).with_burst(3))
                .clock(Clock::manual(0)),
        );

        let mut passed = 0;
        for i in 0..4 {
            if passes(&h, log_envelope(i, Level::Info, "m")).await {
                passed += 1;
            }
        }
        // Full burst available up front; the fourth drops.
        assert_eq!(passed, 3);
    }

    #[tokio::test]
    async fn refill_clamps_at_capacity() {
        let clock = Clock::manual(0);
        let h = handler(
            RateLimitMiddleware::new()
                .log_rule(Level::Info, RateRule::new(2, 1_000))
                .clock(clock.clone()),
        );

        // Drain the bucket.
        assert!(passes(&h, log_envelope(0, Level::Info, "m")).await);
        assert!(passes(&h, log_envelope(1, Level::Info, "m")).await);
        assert!(!passes(&h, log_envelope(2, Level::Info, "m")).await);

        // A long idle period refills to capacity, not beyond.
        clock.advance(60_000);
        let mut passed = 0;
        for i in 0..3 {
            if passes(&h, log_envelope(10 + i, Level::Info, "m")).await {
                passed += 1;
            }
        }
        assert_eq!(passed, 2);
    }

    #[tokio::test]
    async fn records_without_rules_pass_unlimited() {
        let h = handler(
            RateLimitMiddleware::new()
                .log_rule(Level::Debug, RateRule::new(1, 1_000))
                .clock(Clock::manual(0)),
        );
        for i in 0..10 {
            assert!(passes(&h, log_envelope(i, Level::Error, "m")).await);
        }
    }

    #[tokio::test]
    async fn default_log_rule_applies_to_unlisted_levels() {
        let h = handler(
            RateLimitMiddleware::new()
                .default_log(RateRule::new(1, 1_000))
                .clock(Clock::manual(0)),
        );
        assert!(passes(&h, log_envelope(0, Level::Warn, "m")).await);
        assert!(!passes(&h, log_envelope(1, Level::Warn, "m")).await);
        // Levels bucket separately even under the shared default rule.
        assert!(passes(&h, log_envelope(2, Level::Error, "m")).await);
    }

    #[tokio::test]
    async fn scope_key_isolates_actors() {
        let h = handler(
            RateLimitMiddleware::new()
                .event_rule("*", RateRule::new(1, 1_000))
                .key(|env| env.ctx.get("user").and_then(|v| v.as_str()).map(str::to_owned))
                .clock(Clock::manual(0)),
        );

        let for_user = |user: &str, ts: u64| {
            let mut env = event_envelope(ts, "click");
            env.ctx.set("user", user);
            env
        };

        assert!(passes(&h, for_user("alice", 0)).await);
        assert!(!passes(&h, for_user("alice", 1)).await);
        // Bob has his own bucket.
        assert!(passes(&h, for_user("bob", 2)).await);
    }

    #[tokio::test]
    async fn stale_bucket_is_reset_on_access() {
        let clock = Clock::manual(0);
        let h = handler(
            RateLimitMiddleware::new()
                .log_rule(Level::Info, RateRule::new(1, 1_000))
                .bucket_ttl_ms(5_000)
                .clock(clock.clone()),
        );

        assert!(passes(&h, log_envelope(0, Level::Info, "m")).await);
        assert!(!passes(&h, log_envelope(1, Level::Info, "m")).await);

        // Past the TTL the bucket is recreated with a full burst.
        clock.advance(6_000);
        assert!(passes(&h, log_envelope(2, Level::Info, "m")).await);
    }

    #[tokio::test]
    async fn cleanup_evicts_oldest_past_max_buckets() {
        let clock = Clock::manual(0);
        let mw = RateLimitMiddleware::new()
            .event_rule("*", RateRule::new(1, 1_000))
            .key(|env| env.ctx.get("user").and_then(|v| v.as_str()).map(str::to_owned))
            .max_buckets(2)
            .cleanup_every(1)
            .clock(clock.clone());
        let h = handler(mw);

        for (i, user) in ["a", "b", "c"].iter().enumerate() {
            let mut env = event_envelope(i as u64, "click");
            env.ctx.set("user", *user);
            assert!(passes(&h, env).await);
        }

        // "a" was evicted, so it gets a fresh full bucket.
        let mut env = event_envelope(10, "click");
        env.ctx.set("user", "a");
        assert!(passes(&h, env).await);
    }
}
