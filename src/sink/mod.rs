//! Sink layer — terminal consumers of envelopes.
//!
//! A sink receives every envelope that survives the middleware chain.
//! The pipeline fans out to all registered sinks concurrently and absorbs
//! each sink's failures independently, so one broken sink never starves
//! the others and nothing reaches the emitting thread.

pub mod console;
pub mod http;

use std::{future::Future, pin::Pin};

use crate::envelope::Envelope;
use crate::error::SinkError;

/// A terminal consumer of envelopes.
///
/// # Contract
///
/// - `deliver` receives an owned envelope; implementations clone whatever
///   internal state the returned future needs (the future must be
///   `'static`).
/// - Failures are returned, not panicked; the pipeline reports them to the
///   error hook. A panicking sink is still isolated, but it is a bug.
/// - `deliver` must not block the pipeline worker on unbounded work:
///   long-running delivery belongs behind an internal queue, as the HTTP
///   batch sink does.
pub trait Sink: Send + Sync {
    /// Short diagnostic name used in error-hook reports, e.g. `"http"`.
    fn name(&self) -> &'static str;

    /// Delivers one envelope.
    fn deliver(
        &self,
        envelope: Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send>>;
}
