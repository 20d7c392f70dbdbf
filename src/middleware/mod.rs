//! Middleware pipeline — composable envelope transformers.
//!
//! This module defines the core types for building an ordered middleware
//! chain. Each middleware receives the envelope and a [`Next`] cursor; it
//! may mutate the envelope, forward it, or drop it, without coupling
//! emitters to volume-control policy.
//!
//! ## Core types
//!
//! - [`Middleware`] — trait implemented by all middleware.
//! - [`Next`] — cursor into the remaining chain; call [`Next::run`] to
//!   forward the envelope. When the chain is exhausted, `run` delivers the
//!   envelope to every registered sink.
//! - [`MiddlewareHandler`] — type-erased, cheaply-cloneable middleware
//!   function.
//! - [`from_middleware`] — converts a [`Middleware`] trait object into a
//!   [`MiddlewareHandler`].
//!
//! ## Pass/drop contract
//!
//! A middleware that calls `next.run(envelope)` passes the envelope
//! forward **exactly once**: `run` consumes the cursor, so a second pass
//! is a compile error rather than a runtime bug. A middleware that returns
//! without calling `next` drops the envelope. Returning an error also
//! drops it and surfaces the failure to the pipeline's error hook.

pub mod dedupe;
pub mod meta;
pub mod rate_limit;
pub mod sample;
pub mod secret;

use std::{future::Future, pin::Pin, sync::Arc};

use crate::envelope::Envelope;
use crate::error::MiddlewareError;

/// A cursor into the remaining middleware chain for a single envelope.
///
/// `Next` is passed to each middleware's [`Middleware::handle`]
/// implementation. Calling [`Next::run`] advances the cursor by one
/// position and invokes the next middleware, or — once the chain is
/// exhausted — the terminal sink fan-out.
///
/// `Next` is consumed by [`run`](Self::run), so it cannot be invoked more
/// than once per middleware invocation.
///
/// # Examples
///
/// ```rust,no_run
/// use std::pin::Pin;
/// use beacon::envelope::Envelope;
/// use beacon::error::MiddlewareError;
/// use beacon::middleware::{Middleware, Next};
///
/// struct PassThrough;
///
/// impl Middleware for PassThrough {
///     fn handle(
///         &self,
///         envelope: Envelope,
///         next: Next,
///     ) -> Pin<Box<dyn std::future::Future<Output = Result<(), MiddlewareError>> + Send>> {
///         Box::pin(async move { next.run(envelope).await })
///     }
/// }
/// ```
pub struct Next {
    middlewares: Vec<MiddlewareHandler>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
    terminal: Terminal,
}

/// A type-erased, reference-counted middleware function.
///
/// Every entry in the middleware chain is stored as a
/// `MiddlewareHandler`. The [`Arc`] wrapper makes handlers cheap to clone
/// so that [`Next`] can advance through the chain without copying
/// closures.
///
/// Construct one with [`from_middleware`] or by wrapping a closure
/// directly:
///
/// ```rust,no_run
/// use std::{pin::Pin, sync::Arc};
/// use beacon::envelope::Envelope;
/// use beacon::middleware::{MiddlewareHandler, Next};
///
/// let handler: MiddlewareHandler = Arc::new(|envelope: Envelope, next: Next| {
///     Box::pin(async move { next.run(envelope).await })
/// });
/// ```
pub type MiddlewareHandler = Arc<
    dyn Fn(Envelope, Next) -> Pin<Box<dyn Future<Output = Result<(), MiddlewareError>> + Send>>
        + Send
        + Sync
        + 'static,
>;

/// The terminal step of a chain: delivers the envelope to the sink layer.
pub type Terminal =
    Arc<dyn Fn(Envelope) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static>;

/// Derives a scope key from an envelope, isolating volume-control state
/// per logical actor (user, request, tenant). Returning `None` places the
/// envelope in the shared `"global"` scope.
pub type KeyFn = Arc<dyn Fn(&Envelope) -> Option<String> + Send + Sync>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + ?Sized + 'static,
{
    Arc::new(move |envelope: Envelope, next: Next| middleware.handle(envelope, next))
}

/// Wraps a closure as a [`MiddlewareHandler`], so one-off middleware can
/// be mounted without a named type.
///
/// # Examples
///
/// ```rust,no_run
/// use beacon::envelope::Envelope;
/// use beacon::middleware::{Next, from_fn};
///
/// let stamp = from_fn(|mut envelope: Envelope, next: Next| {
///     Box::pin(async move {
///         envelope.ctx.set("stamped", true);
///         next.run(envelope).await
///     })
/// });
/// ```
pub fn from_fn<F>(f: F) -> MiddlewareHandler
where
    F: Fn(Envelope, Next) -> Pin<Box<dyn Future<Output = Result<(), MiddlewareError>> + Send>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

impl Next {
    /// Creates a `Next` positioned at the start of the given chain, ending
    /// at `terminal`.
    pub fn new(middlewares: Vec<MiddlewareHandler>, terminal: Terminal) -> Self {
        Self {
            middlewares,
            index: 0,
            terminal,
        }
    }

    /// Forwards the envelope to the next middleware in the chain, or to
    /// the sink fan-out when the chain is exhausted.
    ///
    /// Consumes the cursor: each middleware invocation can pass the
    /// envelope forward at most once.
    pub async fn run(mut self, envelope: Envelope) -> Result<(), MiddlewareError> {
        if self.index < self.middlewares.len() {
            let handler = self.middlewares[self.index].clone();
            self.index += 1;
            handler(envelope, self).await
        } else {
            (self.terminal)(envelope).await;
            Ok(())
        }
    }
}

/// The core trait for all pipeline middleware.
///
/// Implementors receive an [`Envelope`] and a [`Next`] cursor. They may:
///
/// - **Pass through** — call `next.run(envelope).await`, with or without
///   mutating the envelope first.
/// - **Drop** — return `Ok(())` without calling `next`.
/// - **Fail** — return an error; the pipeline drops the envelope and
///   reports the failure to the error hook. Application code never sees it.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because middleware is
///   shared across tokio tasks.
/// - `handle` **must** return a pinned, `Send` future so it can be awaited
///   across `.await` points in multi-threaded runtimes.
/// - Implementations **should not** hold locks across an `.await` point.
pub trait Middleware: Send + Sync {
    /// Handle the envelope and optionally delegate to the next middleware.
    fn handle(
        &self,
        envelope: Envelope,
        next: Next,
    ) -> Pin<Box<dyn Future<Output = Result<(), MiddlewareError>> + Send>>;
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fixtures for middleware tests.

    use super::*;
    use crate::envelope::{Ctx, EventRecord, Level, LogRecord, Record};
    use parking_lot::Mutex;

    /// Terminal that records every envelope reaching the sink layer.
    pub fn collecting_terminal() -> (Terminal, Arc<Mutex<Vec<Envelope>>>) {
        let seen: Arc<Mutex<Vec<Envelope>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let terminal: Terminal = Arc::new(move |envelope| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.lock().push(envelope);
            })
        });
        (terminal, seen)
    }

    /// Runs a single envelope through one handler and reports whether it
    /// reached the terminal.
    pub async fn passes(handler: &MiddlewareHandler, envelope: Envelope) -> bool {
        let (terminal, seen) = collecting_terminal();
        let next = Next::new(Vec::new(), terminal);
        handler(envelope, next).await.unwrap();
        let count = seen.lock().len();
        count == 1
    }

    pub fn log_envelope(ts: u64, level: Level, msg: &str) -> Envelope {
        Envelope::new(ts, Ctx::new(), Record::Log(LogRecord::new(level, msg)))
    }

    pub fn event_envelope(ts: u64, name: &str) -> Envelope {
        Envelope::new(ts, Ctx::new(), Record::Event(EventRecord::new(name)))
    }
}
