//! Secret masking middleware.
//!
//! Replaces values under sensitive keys, in place, across the envelope's
//! context and record payloads before anything reaches a sink. Matching
//! is key-based and case-insensitive; a matching key's entire subtree is
//! replaced wholesale, whatever its type.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use super::{Middleware, Next};
use crate::envelope::{Ctx, Envelope, Record};
use crate::error::MiddlewareError;

/// The four envelope sub-trees the masker can visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskTarget {
    /// The envelope context.
    Ctx,
    /// `data` of log records.
    LogData,
    /// `err` of log records.
    LogErr,
    /// `props` of event records.
    EventProps,
}

impl MaskTarget {
    /// All four targets, the default masking surface.
    pub const ALL: [MaskTarget; 4] = [
        MaskTarget::Ctx,
        MaskTarget::LogData,
        MaskTarget::LogErr,
        MaskTarget::EventProps,
    ];
}

/// Middleware that masks sensitive values by key.
///
/// A key matches when its lowercased form contains (default) or equals
/// one of the configured tokens. The matched value — scalar, object, or
/// array — is replaced with the replacement value and never descended
/// into, which also makes the middleware idempotent.
///
/// # Examples
///
/// ```rust,no_run
/// use beacon::middleware::secret::SecretMiddleware;
///
/// let secret = SecretMiddleware::new()
///     .token("password")
///     .token("authorization");
/// ```
pub struct SecretMiddleware {
    tokens: Vec<String>,
    match_substring: bool,
    replacement: Value,
    max_depth: usize,
    targets: Vec<MaskTarget>,
}

impl Default for SecretMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretMiddleware {
    /// Creates a masker with no tokens, substring matching, the
    /// `"[MASKED]"` replacement, depth 20, and all four targets.
    pub fn new() -> Self {
        Self {
            tokens: Vec::new(),
            match_substring: true,
            replacement: Value::String("[MASKED]".to_owned()),
            max_depth: 20,
            targets: MaskTarget::ALL.to_vec(),
        }
    }

    /// Adds a case-insensitive token to match keys against.
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.tokens.push(token.into().to_lowercase());
        self
    }

    /// When `true` (default), a key matches if it *contains* a token;
    /// when `false`, only exact case-insensitive matches count.
    #[must_use]
    pub fn match_substring(mut self, substring: bool) -> Self {
        self.match_substring = substring;
        self
    }

    /// Value substituted for matched subtrees. Defaults to `"[MASKED]"`.
    #[must_use]
    pub fn replacement(mut self, replacement: impl Into<Value>) -> Self {
        self.replacement = replacement.into();
        self
    }

    /// Maximum recursion depth. Defaults to 20.
    #[must_use]
    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Restricts masking to a subset of the four targets.
    #[must_use]
    pub fn targets(mut self, targets: &[MaskTarget]) -> Self {
        self.targets = targets.to_vec();
        self
    }

    fn key_matches(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        if self.match_substring {
            self.tokens.iter().any(|token| key.contains(token))
        } else {
            self.tokens.iter().any(|token| &key == token)
        }
    }

    /// Masks matching keys inside `value`. Matched subtrees are replaced
    /// wholesale and not descended into.
    fn mask_value(&self, value: &mut Value, depth: usize) {
        if depth >= self.max_depth {
            return;
        }
        match value {
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    if self.key_matches(key) {
                        *child = self.replacement.clone();
                    } else {
                        self.mask_value(child, depth + 1);
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.mask_value(item, depth + 1);
                }
            }
            _ => {}
        }
    }

    /// Masks the context: its own keys are candidates, and non-matching
    /// values are traversed.
    fn mask_ctx(&self, ctx: &mut Ctx) {
        let keys: Vec<String> = ctx.keys().map(str::to_owned).collect();
        for key in keys {
            if self.key_matches(&key) {
                ctx.set(key, self.replacement.clone());
            } else if let Some(value) = ctx.get(&key) {
                let mut value = value.clone();
                self.mask_value(&mut value, 1);
                ctx.set(key, value);
            }
        }
    }

    fn wants(&self, target: MaskTarget) -> bool {
        self.targets.contains(&target)
    }
}

impl Middleware for SecretMiddleware {
    fn handle(
        &self,
        mut envelope: Envelope,
        next: Next,
    ) -> Pin<Box<dyn Future<Output = Result<(), MiddlewareError>> + Send>> {
        if self.wants(MaskTarget::Ctx) {
            self.mask_ctx(&mut envelope.ctx);
        }
        match &mut envelope.record {
            Record::Log(log) => {
                if self.wants(MaskTarget::LogData) {
                    if let Some(data) = log.data.as_mut() {
                        self.mask_value(data, 0);
                    }
                }
                if self.wants(MaskTarget::LogErr) {
                    if let Some(err) = log.err.as_mut() {
                        self.mask_value(err, 0);
                    }
                }
            }
            Record::Event(event) => {
                if self.wants(MaskTarget::EventProps) {
                    if let Some(props) = event.props.as_mut() {
                        self.mask_value(props, 0);
                    }
                }
            }
        }
        Box::pin(async move { next.run(envelope).await })
    }
}
