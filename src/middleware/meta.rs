//! Metadata enrichment middleware.
//!
//! Adds static fields, provider-computed fields, and record-derived fields
//! to the envelope context. Metadata generation must never break the
//! pipeline: provider panics are caught and ignored.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use super::{Middleware, Next};
use crate::envelope::{Ctx, Envelope, Record};
use crate::error::MiddlewareError;

/// Computes a context fragment. Later providers override earlier ones;
/// returning `None` contributes nothing.
pub type Provider = Arc<dyn Fn() -> Option<Ctx> + Send + Sync>;

/// Middleware that enriches the envelope context.
///
/// The computed mapping is assembled in option order — static `meta`
/// first, then providers, then the timestamp and record info flags — and
/// merged into `ctx` (default) or stored under a namespace key.
///
/// # Examples
///
/// ```rust,no_run
/// use beacon::envelope::Ctx;
/// use beacon::middleware::meta::MetaMiddleware;
///
/// let meta = MetaMiddleware::new()
///     .meta(Ctx::new().with("host", "web-1"))
///     .provider(|| Some(Ctx::new().with("mem_mb", 512)))
///     .include_record_info(true);
/// ```
pub struct MetaMiddleware {
    meta: Ctx,
    providers: Vec<Provider>,
    include_timestamp: bool,
    include_record_info: bool,
    merge_into_ctx: bool,
    namespace_key: String,
}

impl Default for MetaMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaMiddleware {
    /// Creates a middleware that adds nothing until configured.
    pub fn new() -> Self {
        Self {
            meta: Ctx::new(),
            providers: Vec::new(),
            include_timestamp: false,
            include_record_info: false,
            merge_into_ctx: true,
            namespace_key: "meta".to_owned(),
        }
    }

    /// Static fields merged into every envelope.
    #[must_use]
    pub fn meta(mut self, meta: Ctx) -> Self {
        self.meta = meta;
        self
    }

    /// Appends a dynamic provider. Providers run in registration order;
    /// later providers override earlier ones key-by-key.
    #[must_use]
    pub fn provider(mut self, provider: impl Fn() -> Option<Ctx> + Send + Sync + 'static) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Adds `timestamp` (the envelope's creation time) to the computed mapping.
    #[must_use]
    pub fn include_timestamp(mut self, include: bool) -> Self {
        self.include_timestamp = include;
        self
    }

    /// Adds `kind`, plus `level` for logs or `name` for events.
    #[must_use]
    pub fn include_record_info(mut self, include: bool) -> Self {
        self.include_record_info = include;
        self
    }

    /// When `false`, the computed mapping is stored under
    /// [`namespace_key`](Self::namespace_key) instead of being merged into
    /// the context top level.
    #[must_use]
    pub fn merge_into_ctx(mut self, merge: bool) -> Self {
        self.merge_into_ctx = merge;
        self
    }

    /// Context key used when [`merge_into_ctx`](Self::merge_into_ctx) is
    /// `false`. Defaults to `"meta"`.
    #[must_use]
    pub fn namespace_key(mut self, key: impl Into<String>) -> Self {
        self.namespace_key = key.into();
        self
    }

    fn computed(&self, envelope: &Envelope) -> Ctx {
        let mut out = self.meta.clone();

        for provider in &self.providers {
            // A panicking provider contributes nothing; telemetry keeps flowing.
            if let Ok(Some(fragment)) = catch_unwind(AssertUnwindSafe(|| provider())) {
                out.merge_from(&fragment);
            }
        }

        if self.include_timestamp {
            out.set("timestamp", envelope.ts());
        }
        if self.include_record_info {
            out.set("kind", envelope.record.kind());
            match &envelope.record {
                Record::Log(log) => out.set("level", log.level.as_str()),
                Record::Event(event) => out.set("name", event.name.clone()),
            }
        }
        out
    }
}

impl Middleware for MetaMiddleware {
    fn handle(
        &self,
        mut envelope: Envelope,
        next: Next,
    ) -> Pin<Box<dyn Future<Output = Result<(), MiddlewareError>> + Send>> {
        let computed = self.computed(&envelope);

        if self.merge_into_ctx {
            envelope.ctx.merge_from(&computed);
        } else {
            // Merge into an existing sub-mapping under the namespace key.
            let mut sub = match envelope.ctx.get(&self.namespace_key) {
                Some(Value::Object(existing)) => existing.clone(),
                _ => serde_json::Map::new(),
            };
            for (key, value) in computed.iter() {
                sub.insert(key.to_owned(), value.clone());
            }
            envelope.ctx.set(self.namespace_key.clone(), Value::Object(sub));
        }

        Box::pin(async move { next.run(envelope).await })
    }
}
