//! # beacon
//!
//! A client-side telemetry pipeline for Rust hosts: structured logs and
//! events are enriched with ambient context, filtered by volume-control
//! middleware (sampling, rate limiting, deduplication, secret masking),
//! and delivered best-effort to one or more sinks — without ever
//! blocking, slowing, or crashing the application emitting them.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use beacon::{Ctx, Telemetry};
//! use beacon::sink::console::ConsoleSink;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let telemetry = Telemetry::builder().app("checkout").version("1.2.3").build();
//!     telemetry.add_transport(Arc::new(ConsoleSink::new()));
//!
//!     telemetry.info("service started", None);
//!     telemetry
//!         .with_scope(Ctx::new().with("request_id", "r1"), async {
//!             telemetry.track("page_view", Some(json!({"path": "/"})));
//!         })
//!         .await;
//! }
//! ```
//!
//! ## Architecture
//!
//! An emit call snapshots the effective context (global ⊕ scope ⊕
//! per-call), wraps the record in an [`Envelope`], and hands it to the
//! [`pipeline`]: middlewares run in registration order, each passing the
//! envelope forward or dropping it, and survivors fan out concurrently to
//! every registered [`sink`]. All failures are absorbed at pipeline
//! boundaries; at most they reach a diagnostic
//! [`ErrorHook`](error::ErrorHook).

pub mod context;
pub mod envelope;
pub mod error;
pub mod facade;
pub mod middleware;
pub mod pipeline;
pub mod sink;
pub mod util;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use context::ScopeBackend;
pub use envelope::{Ctx, Envelope, EventRecord, Level, LogRecord, Record};
pub use error::{ErrorHook, TelemetryError};
pub use facade::Telemetry;
