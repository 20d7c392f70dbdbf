//! Envelope dispatch: the middleware chain and the sink fan-out.
//!
//! The pipeline owns an ordered middleware list and a sink set. Dispatch
//! is fire-and-forget: the emitting thread hands the envelope to an
//! unbounded channel and returns immediately; a worker task runs the
//! chain. Envelopes are processed strictly in production order, so
//! everything emitted from one scope reaches the sink layer in order.
//!
//! Failure containment:
//!
//! - A middleware error drops the envelope and notifies the error hook.
//! - A panic anywhere in per-envelope processing is caught at a spawned
//!   task boundary; the worker survives and moves on.
//! - Each sink's failure (error or panic) is absorbed independently of
//!   its siblings.

use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::envelope::Envelope;
use crate::error::{ErrorHook, SinkError, TelemetryError};
use crate::middleware::{Middleware, MiddlewareHandler, Next, Terminal, from_middleware};
use crate::sink::Sink;

/// The dispatch pipeline: ordered middlewares terminating at a fan-out to
/// all registered sinks.
///
/// Cloning is cheap; clones share the same worker, middleware list, and
/// sink set. Registration via [`use_middleware`](Self::use_middleware) /
/// [`add_sink`](Self::add_sink) affects subsequent dispatches only.
///
/// Must be created inside a tokio runtime — construction spawns the
/// worker task. The worker exits when every `Pipeline` clone is dropped.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Envelope>,
}

struct Shared {
    middlewares: RwLock<Vec<MiddlewareHandler>>,
    sinks: RwLock<Vec<Arc<dyn Sink>>>,
    hook: ErrorHook,
}

impl Pipeline {
    /// Creates an empty pipeline and spawns its worker task.
    pub fn new(hook: ErrorHook) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            middlewares: RwLock::new(Vec::new()),
            sinks: RwLock::new(Vec::new()),
            hook,
        });
        tokio::spawn(worker(Arc::clone(&shared), rx));
        Self { shared, tx }
    }

    /// Hands an envelope to the worker. Never blocks; if the worker is
    /// gone (runtime shutting down), the envelope is silently dropped.
    pub fn dispatch(&self, envelope: Envelope) {
        if self.tx.send(envelope).is_err() {
            debug!("pipeline worker gone; envelope dropped");
        }
    }

    /// Appends a middleware to the end of the chain.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.use_handler(from_middleware(middleware));
    }

    /// Appends a type-erased handler to the end of the chain.
    pub fn use_handler(&self, handler: MiddlewareHandler) {
        self.shared.middlewares.write().push(handler);
    }

    /// Registers a sink. Registering the same sink twice delivers every
    /// envelope to it twice; duplicates are not collapsed.
    pub fn add_sink(&self, sink: Arc<dyn Sink>) {
        self.shared.sinks.write().push(sink);
    }
}

async fn worker(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    debug!("pipeline worker started");
    while let Some(envelope) = rx.recv().await {
        // Snapshot per envelope: registrations take effect between
        // envelopes, never mid-chain.
        let middlewares = shared.middlewares.read().clone();
        let sinks = shared.sinks.read().clone();
        let hook = Arc::clone(&shared.hook);

        let next = Next::new(middlewares, fanout(sinks, Arc::clone(&hook)));
        match tokio::spawn(next.run(envelope)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => hook(&TelemetryError::Middleware(err)),
            Err(join) => hook(&TelemetryError::Panic(join.to_string())),
        }
    }
    debug!("pipeline worker stopped");
}

/// Builds the terminal step: concurrent delivery to every sink, each
/// failure absorbed independently.
fn fanout(sinks: Vec<Arc<dyn Sink>>, hook: ErrorHook) -> Terminal {
    Arc::new(move |envelope: Envelope| {
        let sinks = sinks.clone();
        let hook = Arc::clone(&hook);
        Box::pin(async move {
            if sinks.is_empty() {
                return;
            }
            // One task per sink so a panicking sink cannot take its
            // siblings down with it.
            let handles: Vec<_> = sinks
                .iter()
                .map(|sink| tokio::spawn(sink.deliver(envelope.clone())))
                .collect();
            for (sink, outcome) in sinks.iter().zip(join_all(handles).await) {
                let source = match outcome {
                    Ok(Ok(())) => continue,
                    Ok(Err(source)) => source,
                    Err(join) => SinkError::Other(format!("delivery panicked: {join}")),
                };
                hook(&TelemetryError::Sink {
                    name: sink.name().to_owned(),
                    source,
                });
            }
        })
    })
}
