//! Error taxonomy and the diagnostic hook.
//!
//! The cardinal rule of the crate: telemetry must not throw into
//! application code. Every failure listed here is absorbed at a pipeline
//! boundary and, at most, reported to a single user-supplied
//! [`ErrorHook`]. Nothing propagates to the emitting thread.

use std::sync::Arc;

use thiserror::Error;

/// A failure returned by a middleware's `handle` implementation.
///
/// Built-in middlewares never fail — they absorb their own errors. This is
/// the escape hatch for custom middlewares; the pipeline treats it as a
/// drop and reports it to the error hook.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct MiddlewareError(String);

impl MiddlewareError {
    /// Creates a middleware error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A failure inside a sink's delivery path.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The underlying HTTP transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Any other sink-specific failure.
    #[error("{0}")]
    Other(String),
}

/// A failure at the HTTP transport layer (connection refused, DNS, TLS,
/// timeout). Treated as retryable by the batch sink.
#[derive(Debug, Error)]
#[error("network: {0}")]
pub struct TransportError(pub String);

/// Everything the pipeline can absorb and report to the [`ErrorHook`].
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A middleware returned an error; the envelope was dropped.
    #[error("middleware failed: {0}")]
    Middleware(#[from] MiddlewareError),

    /// Envelope processing panicked; the envelope was dropped.
    #[error("pipeline task panicked: {0}")]
    Panic(String),

    /// A sink failed to deliver; other sinks were unaffected.
    #[error("sink {name} failed: {source}")]
    Sink {
        /// The failing sink's diagnostic name.
        name: String,
        /// The underlying failure.
        #[source]
        source: SinkError,
    },
}

/// A single user-supplied callback receiving every absorbed error.
///
/// The hook runs on the pipeline worker; it must not block and must not
/// panic. The default hook logs through `tracing`.
pub type ErrorHook = Arc<dyn Fn(&TelemetryError) + Send + Sync>;

/// The default hook: a `tracing::warn!` line per absorbed error.
pub fn default_error_hook() -> ErrorHook {
    Arc::new(|err| {
        tracing::warn!(error = %err, "telemetry error absorbed");
    })
}
