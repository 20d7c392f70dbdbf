//! Batched HTTP sink.
//!
//! Envelopes enqueue into a bounded FIFO queue and leave in batches:
//! a periodic timer, a queue-size threshold, or a manual call triggers a
//! flush, and each batch posts as one JSON request with exponential-
//! backoff retry on retryable failures. At most one flush runs at a time,
//! so batches reach the wire in queue order. Enqueueing never blocks the
//! pipeline; overflow is handled by dropping, never stalling.
//!
//! On a host shutdown signal the sink drains one final batch best-effort
//! with a keepalive-flagged request and no retries.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::Sink;
use crate::envelope::Envelope;
use crate::error::{SinkError, TransportError};

/// What triggered a flush. Carried in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// The periodic timer ticked.
    Timer,
    /// The queue reached the batch size.
    Size,
    /// The host called [`HttpSink::flush`].
    Manual,
}

/// Maps an envelope to the wire shape of one `entries` element. The
/// default sends the full envelope.
pub type MapEntryFn = Arc<dyn Fn(&Envelope) -> Value + Send + Sync>;

/// Draws a uniform value in `[0, 1)` for retry jitter.
pub type RandomFn = Arc<dyn Fn() -> f64 + Send + Sync>;

/// One outbound POST handed to the transport.
pub struct PostRequest {
    /// Destination URL.
    pub url: String,
    /// User-supplied headers; `content-type: application/json` is implied.
    pub headers: Vec<(String, String)>,
    /// Serialized `{"entries":[...]}` body.
    pub body: Bytes,
    /// Whether the request should outlive host shutdown. Only the
    /// shutdown drain sets this; transports without the capability ignore
    /// it.
    pub keepalive: bool,
}

/// The wire boundary of the sink. Production uses [`ReqwestTransport`];
/// tests inject scripted responses.
pub trait HttpTransport: Send + Sync {
    /// Posts one batch and resolves to the HTTP status code, or a
    /// transport error for network-level failures.
    fn post(
        &self,
        request: PostRequest,
    ) -> Pin<Box<dyn Future<Output = Result<u16, TransportError>> + Send>>;
}

/// [`HttpTransport`] over a shared [`reqwest::Client`].
#[derive(Debug, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a transport with a default client.
    pub fn new() -> Self {
        Self::default()
    }
}

impl HttpTransport for ReqwestTransport {
    fn post(
        &self,
        request: PostRequest,
    ) -> Pin<Box<dyn Future<Output = Result<u16, TransportError>> + Send>> {
        let client = self.client.clone();
        Box::pin(async move {
            let mut builder = client
                .post(&request.url)
                .header("content-type", "application/json");
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            let response = builder
                .body(request.body)
                .send()
                .await
                .map_err(|e| TransportError(e.to_string()))?;
            Ok(response.status().as_u16())
        })
    }
}

/// Exponential-backoff retry configuration for one batch.
///
/// Attempt 0 is the initial post. After failed attempt *a* the next one
/// waits `min(max_delay, base_delay · 2^a)`, scaled by a jitter factor in
/// `[1 − jitter, 1 + jitter]`. A batch is retried in place and never
/// re-enqueued.
pub struct RetryPolicy {
    retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
    retry_on: Arc<dyn Fn(u16) -> bool + Send + Sync>,
    random: RandomFn,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_millis(5_000),
            jitter: 0.2,
            retry_on: Arc::new(default_retryable),
            random: Arc::new(rand::random::<f64>),
        }
    }
}

/// 408, 429, and the 5xx range.
fn default_retryable(status: u16) -> bool {
    status == 408 || status == 429 || (500..=599).contains(&status)
}

impl RetryPolicy {
    /// Creates the default policy: 2 retries, 250 ms base, 5 s cap,
    /// jitter 0.2, retrying 408/429/5xx.
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries after the initial attempt. Defaults to 2.
    #[must_use]
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// First backoff delay. Defaults to 250 ms.
    #[must_use]
    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Backoff ceiling. Defaults to 5 s.
    #[must_use]
    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Jitter fraction in `[0, 1]`. Defaults to 0.2.
    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Replaces the retryable-status predicate.
    #[must_use]
    pub fn retry_on(mut self, retry_on: impl Fn(u16) -> bool + Send + Sync + 'static) -> Self {
        self.retry_on = Arc::new(retry_on);
        self
    }

    /// Replaces the jitter RNG.
    #[must_use]
    pub fn random(mut self, random: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        self.random = Arc::new(random);
        self
    }

    fn is_retryable(&self, status: u16) -> bool {
        (self.retry_on)(status)
    }

    /// Delay before the retry that follows failed attempt `attempt`.
    fn delay_after(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis() as f64 * 2f64.powi(attempt.min(63) as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        let factor = (1.0 - self.jitter) + 2.0 * self.jitter * (self.random)();
        let jittered = (capped * factor).floor().max(0.0);
        Duration::from_millis(jittered as u64)
    }
}

/// Builder for [`HttpSink`].
pub struct HttpSinkBuilder {
    url: String,
    flush_interval: Duration,
    max_batch: usize,
    max_queue: usize,
    drop_oldest: bool,
    headers: Vec<(String, String)>,
    map_entry: MapEntryFn,
    flush_on_shutdown: bool,
    retry: RetryPolicy,
    transport: Option<Arc<dyn HttpTransport>>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl HttpSinkBuilder {
    /// Periodic flush interval. Defaults to 2 s; zero disables the timer
    /// (size- and manual-flush still work).
    #[must_use]
    pub fn flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Maximum envelopes per POST. Defaults to 50.
    #[must_use]
    pub fn max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    /// Queue capacity. Defaults to 1000.
    #[must_use]
    pub fn max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue.max(1);
        self
    }

    /// On overflow, discard from the front (default) instead of dropping
    /// the incoming envelope.
    #[must_use]
    pub fn drop_oldest(mut self, drop_oldest: bool) -> Self {
        self.drop_oldest = drop_oldest;
        self
    }

    /// Adds a request header sent with every batch.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replaces the envelope-to-entry mapping. Defaults to the full
    /// envelope.
    #[must_use]
    pub fn map_entry(mut self, map_entry: impl Fn(&Envelope) -> Value + Send + Sync + 'static) -> Self {
        self.map_entry = Arc::new(map_entry);
        self
    }

    /// Whether the shutdown signal triggers a final drain. Defaults to
    /// true.
    #[must_use]
    pub fn flush_on_shutdown(mut self, flush_on_shutdown: bool) -> Self {
        self.flush_on_shutdown = flush_on_shutdown;
        self
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replaces the transport. Defaults to [`ReqwestTransport`].
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Attaches the host's shutdown signal: when it turns `true`, the
    /// sink drains one final batch best-effort.
    #[must_use]
    pub fn shutdown_signal(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Builds the sink and spawns its timer and shutdown-listener tasks.
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Arc<HttpSink> {
        let shared = Arc::new(Shared {
            url: self.url,
            headers: self.headers,
            max_batch: self.max_batch,
            max_queue: self.max_queue,
            drop_oldest: self.drop_oldest,
            map_entry: self.map_entry,
            retry: self.retry,
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(ReqwestTransport::new())),
            queue: Mutex::new(VecDeque::new()),
            flushing: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        });

        let mut tasks = Vec::new();

        if !self.flush_interval.is_zero() {
            let weak = Arc::downgrade(&shared);
            let interval = self.flush_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await; // completes immediately
                loop {
                    ticker.tick().await;
                    let Some(shared) = weak.upgrade() else { break };
                    shared.flush(FlushReason::Timer).await;
                }
            }));
        }

        if self.flush_on_shutdown {
            if let Some(mut rx) = self.shutdown {
                let weak = Arc::downgrade(&shared);
                tasks.push(tokio::spawn(async move {
                    loop {
                        if *rx.borrow_and_update() {
                            break;
                        }
                        if rx.changed().await.is_err() {
                            // Sender gone; no signal will ever arrive.
                            return;
                        }
                    }
                    if let Some(shared) = weak.upgrade() {
                        shared.drain_for_shutdown().await;
                    }
                }));
            }
        }

        Arc::new(HttpSink {
            shared,
            tasks: Mutex::new(tasks),
        })
    }
}

/// Batched HTTP delivery with bounded queueing and retry.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use beacon::sink::http::HttpSink;
///
/// # fn main() {
/// # let rt = tokio::runtime::Runtime::new().unwrap();
/// # let _guard = rt.enter();
/// let sink = HttpSink::builder("https://telemetry.example.com/ingest")
///     .flush_interval(Duration::from_secs(5))
///     .max_batch(100)
///     .header("authorization", "Bearer token")
///     .build();
/// # }
/// ```
pub struct HttpSink {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    url: String,
    headers: Vec<(String, String)>,
    max_batch: usize,
    max_queue: usize,
    drop_oldest: bool,
    map_entry: MapEntryFn,
    retry: RetryPolicy,
    transport: Arc<dyn HttpTransport>,
    queue: Mutex<VecDeque<Envelope>>,
    flushing: AtomicBool,
    stopped: AtomicBool,
}

impl HttpSink {
    /// Starts configuring a sink posting to `url`.
    pub fn builder(url: impl Into<String>) -> HttpSinkBuilder {
        HttpSinkBuilder {
            url: url.into(),
            flush_interval: Duration::from_millis(2_000),
            max_batch: 50,
            max_queue: 1_000,
            drop_oldest: true,
            headers: Vec::new(),
            map_entry: Arc::new(|envelope| {
                serde_json::to_value(envelope).unwrap_or(Value::Null)
            }),
            flush_on_shutdown: true,
            retry: RetryPolicy::default(),
            transport: None,
            shutdown: None,
        }
    }

    /// Flushes queued envelopes now. No-op when a flush is already
    /// running, the queue is empty, or the sink is stopped.
    pub async fn flush(&self) {
        self.shared.flush(FlushReason::Manual).await;
    }

    /// Drains one final batch best-effort: a single keepalive request, no
    /// retries, all errors absorbed.
    pub async fn drain_for_shutdown(&self) {
        self.shared.drain_for_shutdown().await;
    }

    /// Stops the sink: cancels the timer and shutdown listener and drops
    /// all subsequent enqueues. Idempotent. In-flight flushes finish or
    /// fail on their own; no new attempts are scheduled.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Current queue depth.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl Drop for HttpSink {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Sink for HttpSink {
    fn name(&self) -> &'static str {
        "http"
    }

    fn deliver(
        &self,
        envelope: Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send>> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            if shared.enqueue(envelope) {
                let flusher = Arc::clone(&shared);
                tokio::spawn(async move {
                    flusher.flush(FlushReason::Size).await;
                });
            }
            Ok(())
        })
    }
}

/// Clears the `flushing` gate on every exit path.
struct FlushGate<'a>(&'a AtomicBool);

impl Drop for FlushGate<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Shared {
    /// Appends to the queue, applying the overflow policy. Returns `true`
    /// when the queue reached the batch size and a flush should start.
    fn enqueue(&self, envelope: Envelope) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        let mut queue = self.queue.lock();
        if queue.len() >= self.max_queue {
            if !self.drop_oldest {
                debug!("queue full; incoming envelope dropped");
                return false;
            }
            while queue.len() >= self.max_queue {
                queue.pop_front();
            }
            debug!("queue full; oldest envelopes dropped");
        }
        queue.push_back(envelope);
        queue.len() >= self.max_batch
    }

    async fn flush(&self, reason: FlushReason) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if self.queue.lock().is_empty() {
            return;
        }
        // Single-flight gate: batches reach the wire in queue order.
        if self.flushing.swap(true, Ordering::SeqCst) {
            return;
        }
        let _gate = FlushGate(&self.flushing);
        debug!(?reason, "flush started");

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            let batch = self.take_batch();
            if batch.is_empty() {
                return;
            }
            let body = self.encode(&batch);
            self.post_with_retry(body).await;
        }
    }

    fn take_batch(&self) -> Vec<Envelope> {
        let mut queue = self.queue.lock();
        let n = queue.len().min(self.max_batch);
        queue.drain(..n).collect()
    }

    fn encode(&self, batch: &[Envelope]) -> Bytes {
        let entries: Vec<Value> = batch.iter().map(|env| (self.map_entry)(env)).collect();
        let body = serde_json::json!({ "entries": entries });
        Bytes::from(serde_json::to_vec(&body).unwrap_or_default())
    }

    fn request(&self, body: Bytes, keepalive: bool) -> PostRequest {
        PostRequest {
            url: self.url.clone(),
            headers: self.headers.clone(),
            body,
            keepalive,
        }
    }

    /// Posts one batch, retrying per policy. The batch is dropped on a
    /// non-retryable status or once retries are exhausted; it is never
    /// re-enqueued.
    async fn post_with_retry(&self, body: Bytes) {
        let mut attempt: u32 = 0;
        loop {
            match self.transport.post(self.request(body.clone(), false)).await {
                Ok(status) if (200..300).contains(&status) => return,
                Ok(status) if !self.retry.is_retryable(status) => {
                    debug!(status, "batch dropped: non-retryable status");
                    return;
                }
                Ok(status) => {
                    debug!(status, attempt, "retryable status");
                }
                Err(err) => {
                    debug!(error = %err, attempt, "transport error");
                }
            }
            if attempt >= self.retry.retries {
                warn!(attempts = attempt + 1, "batch dropped: retries exhausted");
                return;
            }
            tokio::time::sleep(self.retry.delay_after(attempt)).await;
            attempt += 1;
        }
    }

    /// The shutdown drain: up to one batch, one keepalive request, no
    /// retries, nothing propagates.
    async fn drain_for_shutdown(&self) {
        let batch = self.take_batch();
        if batch.is_empty() {
            return;
        }
        let body = self.encode(&batch);
        if let Err(err) = self.transport.post(self.request(body, true)).await {
            debug!(error = %err, "shutdown drain failed");
        }
    }
}
