//! Probabilistic sampling middleware.
//!
//! Drops a configurable fraction of envelopes by log level or event name.
//! With a key function configured, the keep/drop decision is derived from
//! an FNV-1a hash of the key instead of a random draw, so all envelopes
//! sharing a key (one user, one request) are kept or dropped together.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::{KeyFn, Middleware, Next};
use crate::envelope::{Envelope, Level, Record};
use crate::error::MiddlewareError;

/// Draws a uniform value in `[0, 1)`. Injectable for deterministic tests.
pub type RandomFn = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Middleware that passes each envelope with a configured probability.
///
/// Rate resolution: logs use the level's rate, defaulting to 1 (keep);
/// events use the name's rate, then the `"*"` wildcard, then 1. Rates are
/// clamped to `[0, 1]` and NaN is treated as 0.
///
/// # Examples
///
/// ```rust,no_run
/// use beacon::envelope::Level;
/// use beacon::middleware::sample::SampleMiddleware;
///
/// // Keep 10% of debug logs and 50% of all events.
/// let sample = SampleMiddleware::new()
///     .log_rate(Level::Debug, 0.1)
///     .event_rate("*", 0.5);
/// ```
pub struct SampleMiddleware {
    log_rates: HashMap<Level, f64>,
    event_rates: HashMap<String, f64>,
    key: Option<KeyFn>,
    random: RandomFn,
}

impl Default for SampleMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleMiddleware {
    /// Creates a sampler that keeps everything until rates are configured.
    pub fn new() -> Self {
        Self {
            log_rates: HashMap::new(),
            event_rates: HashMap::new(),
            key: None,
            random: Arc::new(rand::random::<f64>),
        }
    }

    /// Sets the keep rate for a log level.
    #[must_use]
    pub fn log_rate(mut self, level: Level, rate: f64) -> Self {
        self.log_rates.insert(level, rate);
        self
    }

    /// Sets the keep rate for an event name; `"*"` applies to any event
    /// without a specific rate.
    #[must_use]
    pub fn event_rate(mut self, name: impl Into<String>, rate: f64) -> Self {
        self.event_rates.insert(name.into(), rate);
        self
    }

    /// Keys the decision: envelopes mapping to the same key share one
    /// keep/drop outcome for a fixed rate.
    #[must_use]
    pub fn key(mut self, key: impl Fn(&Envelope) -> Option<String> + Send + Sync + 'static) -> Self {
        self.key = Some(Arc::new(key));
        self
    }

    /// Replaces the RNG used for unkeyed decisions.
    #[must_use]
    pub fn random(mut self, random: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        self.random = Arc::new(random);
        self
    }

    fn resolve_rate(&self, record: &Record) -> f64 {
        let rate = match record {
            Record::Log(log) => self.log_rates.get(&log.level).copied().unwrap_or(1.0),
            Record::Event(event) => self
                .event_rates
                .get(&event.name)
                .or_else(|| self.event_rates.get("*"))
                .copied()
                .unwrap_or(1.0),
        };
        if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) }
    }

    fn keep(&self, envelope: &Envelope) -> bool {
        let rate = self.resolve_rate(&envelope.record);
        if rate >= 1.0 {
            return true;
        }
        if rate <= 0.0 {
            return false;
        }
        if let Some(key_fn) = &self.key {
            if let Some(key) = key_fn(envelope) {
                return key_uniform(&key) < rate;
            }
        }
        (self.random)() < rate
    }
}

impl Middleware for SampleMiddleware {
    fn handle(
        &self,
        envelope: Envelope,
        next: Next,
    ) -> Pin<Box<dyn Future<Output = Result<(), MiddlewareError>> + Send>> {
        let keep = self.keep(&envelope);
        Box::pin(async move {
            if keep {
                next.run(envelope).await
            } else {
                Ok(())
            }
        })
    }
}

/// Maps a key to a deterministic uniform value in `[0, 1)` via the 32-bit
/// FNV-1a hash.
fn key_uniform(key: &str) -> f64 {
    // Dividing by 2^32 keeps the result strictly below 1.
    f64::from(fnv1a32(key)) / 4_294_967_296.0
}

fn fnv1a32(input: &str) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let mut hash = OFFSET_BASIS;
    for byte in input.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
