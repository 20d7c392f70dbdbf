//! The telemetry facade — the handle application code talks to.
//!
//! [`Telemetry`] owns the pipeline, the scope store, and a per-instance
//! global base context. Emit calls are synchronous and non-blocking: they
//! snapshot the effective context, stamp a timestamp, and hand the
//! envelope to the pipeline worker. Nothing on the emit path waits on
//! I/O, and no failure anywhere downstream reaches the caller.
//!
//! Multiple independent instances can coexist in one process; nothing is
//! stored in process-wide state except the scope frames themselves.

use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::context::{ScopeBackend, ScopeStore};
use crate::envelope::{Ctx, Envelope, EventRecord, Level, LogRecord, Record};
use crate::error::{ErrorHook, default_error_hook};
use crate::middleware::{Middleware, MiddlewareHandler};
use crate::pipeline::Pipeline;
use crate::sink::Sink;
use crate::util::Clock;

/// Builder for [`Telemetry`].
pub struct TelemetryBuilder {
    app: Option<String>,
    version: Option<String>,
    global: Ctx,
    backend: ScopeBackend,
    clock: Clock,
    hook: Option<ErrorHook>,
}

impl TelemetryBuilder {
    /// Seeds `app` in the global base context.
    #[must_use]
    pub fn app(mut self, app: impl Into<String>) -> Self {
        self.app = Some(app.into());
        self
    }

    /// Seeds `version` in the global base context.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Merges additional seed keys into the global base context.
    #[must_use]
    pub fn global_context(mut self, ctx: Ctx) -> Self {
        self.global.merge_from(&ctx);
        self
    }

    /// Selects the scope propagation backend. Defaults to
    /// [`ScopeBackend::TaskLocal`].
    #[must_use]
    pub fn scope_backend(mut self, backend: ScopeBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Replaces the clock. Tests pin this to a manual clock.
    #[must_use]
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Installs the diagnostic hook receiving absorbed errors. Defaults
    /// to a `tracing::warn!` line per error.
    #[must_use]
    pub fn error_hook(mut self, hook: impl Fn(&crate::error::TelemetryError) + Send + Sync + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Builds the facade and spawns the pipeline worker. Must be called
    /// inside a tokio runtime.
    pub fn build(self) -> Telemetry {
        let mut global = Ctx::new();
        if let Some(app) = self.app {
            global.set("app", app);
        }
        if let Some(version) = self.version {
            global.set("version", version);
        }
        global.merge_from(&self.global);

        Telemetry {
            inner: Arc::new(Inner {
                pipeline: Pipeline::new(self.hook.unwrap_or_else(default_error_hook)),
                scope: ScopeStore::new(self.backend),
                global: RwLock::new(global),
                clock: self.clock,
            }),
        }
    }
}

/// The user-facing telemetry handle.
///
/// Cloning is cheap; clones share the same pipeline and global context.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use beacon::{Ctx, Telemetry};
/// use beacon::sink::console::ConsoleSink;
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() {
///     let telemetry = Telemetry::builder().app("checkout").version("1.2.3").build();
///     telemetry.add_transport(Arc::new(ConsoleSink::new()));
///
///     telemetry.info("service started", None);
///     telemetry
///         .with_scope(Ctx::new().with("request_id", "r1"), async {
///             telemetry.track("page_view", Some(json!({"path": "/"})));
///         })
///         .await;
/// }
/// ```
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<Inner>,
}

struct Inner {
    pipeline: Pipeline,
    scope: ScopeStore,
    global: RwLock<Ctx>,
    clock: Clock,
}

impl Telemetry {
    /// Starts configuring a telemetry instance.
    pub fn builder() -> TelemetryBuilder {
        TelemetryBuilder {
            app: None,
            version: None,
            global: Ctx::new(),
            backend: ScopeBackend::default(),
            clock: Clock::system(),
            hook: None,
        }
    }

    // ── Emit API ─────────────────────────────────────────────────────────

    /// Emits a debug log.
    pub fn debug(&self, msg: impl Into<String>, data: Option<Value>) {
        self.log(Level::Debug, msg, data, None);
    }

    /// Emits an info log.
    pub fn info(&self, msg: impl Into<String>, data: Option<Value>) {
        self.log(Level::Info, msg, data, None);
    }

    /// Emits a warn log.
    pub fn warn(&self, msg: impl Into<String>, data: Option<Value>) {
        self.log(Level::Warn, msg, data, None);
    }

    /// Emits an error log, optionally carrying a captured error value
    /// (see [`error_value`](crate::util::json::error_value)).
    pub fn error(&self, msg: impl Into<String>, data: Option<Value>, err: Option<Value>) {
        self.log(Level::Error, msg, data, err);
    }

    /// Emits a log at an explicit level.
    pub fn log(&self, level: Level, msg: impl Into<String>, data: Option<Value>, err: Option<Value>) {
        self.log_with(level, msg, data, err, None);
    }

    /// Emits a log with per-call context merged on top of global and
    /// scope context.
    pub fn log_with(
        &self,
        level: Level,
        msg: impl Into<String>,
        data: Option<Value>,
        err: Option<Value>,
        ctx: Option<Ctx>,
    ) {
        let mut record = LogRecord::new(level, msg);
        record.data = data;
        record.err = err;
        self.emit(Record::Log(record), ctx);
    }

    /// Emits a named event.
    pub fn track(&self, name: impl Into<String>, props: Option<Value>) {
        self.track_with(name, props, None);
    }

    /// Emits a named event with per-call context.
    pub fn track_with(&self, name: impl Into<String>, props: Option<Value>, ctx: Option<Ctx>) {
        let mut record = EventRecord::new(name);
        record.props = props;
        self.emit(Record::Event(record), ctx);
    }

    // ── Context ──────────────────────────────────────────────────────────

    /// Runs `fut` with `ctx` overlaid on the current scope. Emits inside
    /// carry the merged context, across `.await` points on the task-local
    /// backend.
    pub async fn with_scope<F: Future>(&self, ctx: Ctx, fut: F) -> F::Output {
        self.inner.scope.scope(ctx, fut).await
    }

    /// Synchronous variant of [`with_scope`](Self::with_scope).
    pub fn with_scope_sync<R>(&self, ctx: Ctx, f: impl FnOnce() -> R) -> R {
        self.inner.scope.scope_sync(ctx, f)
    }

    /// Monotonically merges `ctx` into this instance's global base
    /// context. Existing keys are overwritten; nothing is removed.
    pub fn set_global_context(&self, ctx: Ctx) {
        self.inner.global.write().merge_from(&ctx);
    }

    /// Returns a snapshot of the global base context.
    pub fn get_global_context(&self) -> Ctx {
        self.inner.global.read().clone()
    }

    // ── Pipeline wiring ──────────────────────────────────────────────────

    /// Appends a middleware. Takes effect on subsequent emits only.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.inner.pipeline.use_middleware(middleware);
    }

    /// Appends a type-erased middleware handler.
    pub fn use_handler(&self, handler: MiddlewareHandler) {
        self.inner.pipeline.use_handler(handler);
    }

    /// Registers a sink. Takes effect on subsequent emits only;
    /// registering the same sink twice delivers twice.
    pub fn add_transport(&self, sink: Arc<dyn Sink>) {
        self.inner.pipeline.add_sink(sink);
    }

    /// Builds the effective context and hands the envelope to the
    /// pipeline. Never blocks; sinks run after this call returns.
    fn emit(&self, record: Record, call_ctx: Option<Ctx>) {
        let ts = self.inner.clock.now_millis();
        let mut ctx = self.inner.global.read().clone();
        ctx.merge_from(&self.inner.scope.current());
        if let Some(call) = call_ctx {
            ctx.merge_from(&call);
        }
        self.inner.pipeline.dispatch(Envelope::new(ts, ctx, record));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Record;
    use crate::error::SinkError;
    use crate::middleware::rate_limit::{RateLimitMiddleware, RateRule};
    use crate::middleware::secret::SecretMiddleware;
    use crate::sink::http::HttpSink;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::pin::Pin;
    use std::time::Duration;

    struct CollectingSink {
        seen: Arc<Mutex<Vec<Envelope>>>,
    }

    impl CollectingSink {
        fn new() -> (Arc<Self>, Arc<Mutex<Vec<Envelope>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            (
                Arc::new(Self {
                    seen: Arc::clone(&seen),
                }),
                seen,
            )
        }
    }

    impl Sink for CollectingSink {
        fn name(&self) -> &'static str {
            "collect"
        }

        fn deliver(
            &self,
            envelope: Envelope,
        ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send>> {
            let seen = Arc::clone(&self.seen);
            Box::pin(async move {
                seen.lock().push(envelope);
                Ok(())
            })
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..2_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not met within 2s");
    }

    fn collected(clock: Clock) -> (Telemetry, Arc<Mutex<Vec<Envelope>>>) {
        let telemetry = Telemetry::builder()
            .app("shop")
            .version("1.2.3")
            .clock(clock)
            .build();
        let (sink, seen) = CollectingSink::new();
        telemetry.add_transport(sink);
        (telemetry, seen)
    }

    #[tokio::test]
    async fn seeds_app_and_version_into_every_envelope() {
        let (telemetry, seen) = collected(Clock::manual(42));

        telemetry.info("started", None);
        wait_until(|| !seen.lock().is_empty()).await;

        let env = seen.lock()[0].clone();
        assert_eq!(env.ts(), 42);
        assert_eq!(env.ctx.get("app"), Some(&json!("shop")));
        assert_eq!(env.ctx.get("version"), Some(&json!("1.2.3")));
    }

    #[tokio::test]
    async fn log_records_carry_level_msg_data_err() {
        let (telemetry, seen) = collected(Clock::manual(0));

        telemetry.error(
            "boom",
            Some(json!({"code": 7})),
            Some(json!({"message": "io"})),
        );
        wait_until(|| !seen.lock().is_empty()).await;

        match &seen.lock()[0].record {
            Record::Log(log) => {
                assert_eq!(log.level, Level::Error);
                assert_eq!(log.msg, "boom");
                assert_eq!(log.data, Some(json!({"code": 7})));
                assert_eq!(log.err, Some(json!({"message": "io"})));
            }
            Record::Event(_) => panic!("expected log"),
        }
    }

    #[tokio::test]
    async fn track_emits_event_records() {
        let (telemetry, seen) = collected(Clock::manual(0));

        telemetry.track("page_view", Some(json!({"path": "/"})));
        wait_until(|| !seen.lock().is_empty()).await;

        match &seen.lock()[0].record {
            Record::Event(event) => {
                assert_eq!(event.name, "page_view");
                assert_eq!(event.props, Some(json!({"path": "/"})));
            }
            Record::Log(_) => panic!("expected event"),
        }
    }

    #[tokio::test]
    async fn context_layers_merge_global_scope_call() {
        let (telemetry, seen) = collected(Clock::manual(0));
        telemetry.set_global_context(Ctx::new().with("layer", "global").with("g", 1));

        telemetry
            .with_scope(Ctx::new().with("layer", "scope").with("s", 2), async {
                telemetry.log_with(
                    Level::Info,
                    "m",
                    None,
                    None,
                    Some(Ctx::new().with("layer", "call").with("c", 3)),
                );
            })
            .await;

        wait_until(|| !seen.lock().is_empty()).await;
        let ctx = seen.lock()[0].ctx.clone();
        // Per-call wins over scope wins over global.
        assert_eq!(ctx.get("layer"), Some(&json!("call")));
        assert_eq!(ctx.get("g"), Some(&json!(1)));
        assert_eq!(ctx.get("s"), Some(&json!(2)));
        assert_eq!(ctx.get("c"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn scope_context_survives_await_between_emits() {
        let (telemetry, seen) = collected(Clock::manual(0));

        telemetry
            .with_scope(Ctx::new().with("request_id", "r1"), async {
                telemetry.info("before suspend", None);
                tokio::task::yield_now().await;
                telemetry.info("after suspend", None);
            })
            .await;

        wait_until(|| seen.lock().len() == 2).await;
        for env in seen.lock().iter() {
            assert_eq!(env.ctx.get("request_id"), Some(&json!("r1")));
        }
    }

    #[tokio::test]
    async fn middleware_mutations_do_not_leak_into_global_state() {
        let (telemetry, seen) = collected(Clock::manual(0));
        telemetry.use_middleware(Arc::new(
            SecretMiddleware::new().token("version"),
        ));

        telemetry.info("m", None);
        wait_until(|| !seen.lock().is_empty()).await;

        assert_eq!(
            seen.lock()[0].ctx.get("version"),
            Some(&json!("[MASKED]"))
        );
        // The global base context is untouched.
        assert_eq!(
            telemetry.get_global_context().get("version"),
            Some(&json!("1.2.3"))
        );
    }

    #[tokio::test]
    async fn set_global_context_merges_monotonically() {
        let (telemetry, seen) = collected(Clock::manual(0));

        telemetry.set_global_context(Ctx::new().with("region", "eu"));
        telemetry.set_global_context(Ctx::new().with("zone", "b"));

        let global = telemetry.get_global_context();
        assert_eq!(global.get("app"), Some(&json!("shop")));
        assert_eq!(global.get("region"), Some(&json!("eu")));
        assert_eq!(global.get("zone"), Some(&json!("b")));

        telemetry.info("m", None);
        wait_until(|| !seen.lock().is_empty()).await;
        assert_eq!(seen.lock()[0].ctx.get("zone"), Some(&json!("b")));
    }

    #[tokio::test]
    async fn rate_limited_emits_reach_http_sink_in_batches() {
        use crate::sink::http::{HttpTransport, PostRequest};
        use crate::error::TransportError;
        use std::collections::VecDeque;

        struct ScriptedTransport {
            bodies: Mutex<Vec<Value>>,
            responses: Mutex<VecDeque<u16>>,
        }

        impl HttpTransport for ScriptedTransport {
            fn post(
                &self,
                request: PostRequest,
            ) -> Pin<Box<dyn Future<Output = Result<u16, TransportError>> + Send>> {
                self.bodies
                    .lock()
                    .push(serde_json::from_slice(&request.body).unwrap());
                let status = self.responses.lock().pop_front().unwrap_or(204);
                Box::pin(async move { Ok(status) })
            }
        }

        let clock = Clock::manual(0);
        let telemetry = Telemetry::builder().app("shop").clock(clock.clone()).build();

        let transport = Arc::new(ScriptedTransport {
            bodies: Mutex::new(Vec::new()),
            responses: Mutex::new(VecDeque::new()),
        });
        let sink = HttpSink::builder("https://example.com/ingest")
            .flush_interval(Duration::ZERO)
            .transport(Arc::clone(&transport) as Arc<dyn HttpTransport>)
            .build();

        telemetry.use_middleware(Arc::new(
            RateLimitMiddleware::new()
                .log_rule(Level::Info, RateRule::new(2, 1_000))
                .clock(clock),
        ));
        telemetry.add_transport(Arc::clone(&sink) as Arc<dyn Sink>);

        for i in 0..3 {
            telemetry.info(format!("m{i}"), None);
        }

        wait_until(|| sink.queue_len() == 2).await;
        sink.flush().await;

        let bodies = transport.bodies.lock();
        assert_eq!(bodies.len(), 1);
        let entries = bodies[0]["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["record"]["msg"], "m0");
        assert_eq!(entries[1]["record"]["msg"], "m1");
    }
}
