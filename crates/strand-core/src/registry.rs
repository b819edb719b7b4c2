//! Stream registry: one entry per in-flight generation.
//!
//! The registry owns every [`StreamEntry`] for its active lifetime. Wire
//! events arrive in per-worker pumps and are dispatched in arrival order; a
//! stream's chunks go to its generator queue, and exactly one terminal
//! transition (completed / errored / timed out / cancelled) is recorded per
//! stream. Events that arrive after the terminal transition are dropped
//! silently; that is the gateway's defense against late runtime messages.
//! Entries outlive their terminal transition until the cleanup scheduler
//! fires, so a late message finds a terminal entry rather than nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use strand_types::{
    EngineError, GenerationStats, GeneratorChunk, StreamChunk, StreamCloseReason, StreamId,
    TenantId, WorkerId,
};

use crate::pool::QueueHandle;
use crate::transport::TransportEvent;
use crate::transport::retry::StreamProgress;

/// Lifecycle state of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StreamStatus {
    Active,
    Completed,
    Errored,
    TimedOut,
    Cancelled,
}

impl StreamStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StreamStatus::Active)
    }

    fn close_reason(self) -> Option<StreamCloseReason> {
        match self {
            StreamStatus::Active => None,
            StreamStatus::Completed => Some(StreamCloseReason::Completed),
            StreamStatus::Errored => Some(StreamCloseReason::Errored),
            StreamStatus::TimedOut => Some(StreamCloseReason::TimedOut),
            StreamStatus::Cancelled => Some(StreamCloseReason::Cancelled),
        }
    }
}

struct StreamEntry {
    model_id: Option<String>,
    tenant_id: Option<TenantId>,
    worker_id: Option<WorkerId>,
    status: StreamStatus,
    created_at: Instant,
    first_chunk_at: Option<Instant>,
    last_chunk_at: Option<Instant>,
    token_count: u64,
    /// Fires toward the transport/worker when the stream is aborted locally.
    abort_tx: watch::Sender<bool>,
    /// The generator's queue; chunks are pushed here in arrival order.
    sink: Option<QueueHandle>,
    /// Marks streamed progress so the retry wrapper stops retrying.
    progress: StreamProgress,
    /// Single-shot timeout task, aborted on any earlier terminal transition.
    timeout_task: Option<tokio::task::AbortHandle>,
    /// External abort watcher task.
    abort_watch_task: Option<tokio::task::AbortHandle>,
}

/// Read-only view of one stream entry.
#[derive(Debug, Clone)]
pub struct StreamView {
    pub stream_id: StreamId,
    pub model_id: Option<String>,
    pub tenant_id: Option<TenantId>,
    pub worker_id: Option<WorkerId>,
    pub status: StreamStatus,
    pub token_count: u64,
}

/// Aggregate registry counters for the stats surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryMetrics {
    pub active: usize,
    pub registered_total: u64,
    pub completed_total: u64,
    pub errored_total: u64,
    pub timed_out_total: u64,
    pub cancelled_total: u64,
    pub tokens_total: u64,
}

/// Registration inputs for one stream.
pub struct RegisterOptions {
    pub model_id: Option<String>,
    pub tenant_id: Option<TenantId>,
    pub worker_id: Option<WorkerId>,
    /// Generator queue that receives this stream's chunks.
    pub sink: Option<QueueHandle>,
    /// Optional deadline; on expiry the registry synthesizes a timeout.
    pub timeout: Option<Duration>,
    /// Optional caller abort signal; `true` cancels the stream.
    pub external_abort: Option<watch::Receiver<bool>>,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            model_id: None,
            tenant_id: None,
            worker_id: None,
            sink: None,
            timeout: None,
            external_abort: None,
        }
    }
}

/// What a successful registration hands back to the generator factory.
#[derive(Debug)]
pub struct Registration {
    pub stream_id: StreamId,
    /// Wire this into the generate RPC so aborts reach the transport.
    pub abort_rx: watch::Receiver<bool>,
    /// Share with the retry wrapper for the same request.
    pub progress: StreamProgress,
}

/// Callbacks the engine installs on the registry.
#[derive(Default)]
pub struct RegistryHooks {
    /// Measured time-to-first-token, in seconds, once per stream.
    pub on_ttft: Option<Arc<dyn Fn(f64) + Send + Sync>>,
    /// A stream reached its terminal state.
    pub on_close: Option<Arc<dyn Fn(StreamId, StreamCloseReason) + Send + Sync>>,
    /// The stream was aborted locally (cancel or timeout); tell the worker.
    pub on_abort: Option<Arc<dyn Fn(StreamId) + Send + Sync>>,
}

#[derive(Debug, Default)]
struct RegistryCounters {
    registered: u64,
    completed: u64,
    errored: u64,
    timed_out: u64,
    cancelled: u64,
    tokens: u64,
}

pub struct StreamRegistry {
    entries: Mutex<HashMap<StreamId, StreamEntry>>,
    counters: Mutex<RegistryCounters>,
    hooks: Mutex<RegistryHooks>,
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("metrics", &self.metrics())
            .finish()
    }
}

/// Terminal-transition byproducts, applied outside the entry lock.
struct Closure {
    sink: Option<QueueHandle>,
    timeout_task: Option<tokio::task::AbortHandle>,
    abort_watch_task: Option<tokio::task::AbortHandle>,
    reason: StreamCloseReason,
    fire_abort: bool,
    abort_tx: Option<watch::Sender<bool>>,
}

impl StreamRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            counters: Mutex::new(RegistryCounters::default()),
            hooks: Mutex::new(RegistryHooks::default()),
        })
    }

    pub fn set_hooks(&self, hooks: RegistryHooks) {
        *self.hooks.lock().expect("hooks mutex poisoned") = hooks;
    }

    /// Create an `active` entry for `stream_id`.
    ///
    /// Fails with `AlreadyRegistered` when the id is in use (including ids
    /// whose terminal entry has not yet been cleaned up; ids are never
    /// reused).
    pub fn register(
        self: &Arc<Self>,
        stream_id: StreamId,
        opts: RegisterOptions,
    ) -> Result<Registration, EngineError> {
        let (abort_tx, abort_rx) = watch::channel(false);
        let progress = StreamProgress::new();

        {
            let mut entries = self.entries.lock().expect("registry mutex poisoned");
            if entries.contains_key(&stream_id) {
                return Err(EngineError::AlreadyRegistered { stream_id });
            }
            entries.insert(
                stream_id,
                StreamEntry {
                    model_id: opts.model_id,
                    tenant_id: opts.tenant_id,
                    worker_id: opts.worker_id,
                    status: StreamStatus::Active,
                    created_at: Instant::now(),
                    first_chunk_at: None,
                    last_chunk_at: None,
                    token_count: 0,
                    abort_tx: abort_tx.clone(),
                    sink: opts.sink,
                    progress: progress.clone(),
                    timeout_task: None,
                    abort_watch_task: None,
                },
            );
        }
        self.counters.lock().expect("counters poisoned").registered += 1;

        // Arm the single-shot timeout.
        if let Some(timeout) = opts.timeout {
            let registry = Arc::clone(self);
            let task = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                registry.on_timeout(stream_id).await;
            });
            self.with_entry(&stream_id, |entry| {
                entry.timeout_task = Some(task.abort_handle());
            });
        }

        // Watch the caller's abort signal.
        if let Some(mut external) = opts.external_abort {
            let registry = Arc::clone(self);
            let task = tokio::spawn(async move {
                loop {
                    if *external.borrow() {
                        registry.cancel(stream_id);
                        return;
                    }
                    if external.changed().await.is_err() {
                        return;
                    }
                }
            });
            self.with_entry(&stream_id, |entry| {
                entry.abort_watch_task = Some(task.abort_handle());
            });
        }

        trace!(%stream_id, "stream registered");
        Ok(Registration {
            stream_id,
            abort_rx,
            progress,
        })
    }

    fn with_entry<R>(&self, stream_id: &StreamId, f: impl FnOnce(&mut StreamEntry) -> R) -> Option<R> {
        let mut entries = self.entries.lock().expect("registry mutex poisoned");
        entries.get_mut(stream_id).map(f)
    }

    /// Dispatch one token chunk. Chunks for a terminal or unknown stream are
    /// dropped silently.
    pub async fn on_chunk(&self, chunk: StreamChunk) {
        let stream_id = chunk.stream_id;
        let (sink, ttft) = {
            let mut entries = self.entries.lock().expect("registry mutex poisoned");
            let Some(entry) = entries.get_mut(&stream_id) else {
                trace!(%stream_id, "chunk for unknown stream dropped");
                return;
            };
            if entry.status.is_terminal() {
                trace!(%stream_id, "chunk after terminal status dropped");
                return;
            }
            let now = Instant::now();
            let mut ttft = None;
            if entry.first_chunk_at.is_none() {
                entry.first_chunk_at = Some(now);
                ttft = Some(now.duration_since(entry.created_at).as_secs_f64());
            }
            entry.last_chunk_at = Some(now);
            entry.token_count += 1;
            entry.progress.mark();
            (entry.sink.clone(), ttft)
        };
        self.counters.lock().expect("counters poisoned").tokens += 1;

        if let Some(ttft) = ttft {
            if let Some(hook) = self.hooks.lock().expect("hooks mutex poisoned").on_ttft.clone() {
                hook(ttft);
            }
        }

        if let Some(sink) = sink {
            // Backpressure: suspends while the generator queue is full. The
            // per-worker pump serializes this, preserving per-stream order.
            let _ = sink.push(GeneratorChunk::Token(chunk)).await;
        }
    }

    /// Dispatch generation statistics. Stats do not terminate the stream.
    pub async fn on_stats(&self, stats: GenerationStats) {
        let stream_id = stats.stream_id;
        let sink = {
            let entries = self.entries.lock().expect("registry mutex poisoned");
            match entries.get(&stream_id) {
                Some(entry) if !entry.status.is_terminal() => entry.sink.clone(),
                _ => {
                    trace!(%stream_id, "stats after terminal status dropped");
                    return;
                }
            }
        };
        if let Some(sink) = sink {
            let _ = sink.push(GeneratorChunk::Metadata(stats)).await;
        }
    }

    /// Worker reported normal completion.
    pub async fn on_completed(&self, stream_id: StreamId) {
        if let Some(closure) = self.transition(stream_id, StreamStatus::Completed, false) {
            self.apply_closure(stream_id, closure, None).await;
        }
    }

    /// Worker reported a stream-level error.
    pub async fn on_error(&self, stream_id: StreamId, message: String) {
        if let Some(closure) = self.transition(stream_id, StreamStatus::Errored, false) {
            let err = EngineError::Generation { message };
            self.apply_closure(stream_id, closure, Some(err)).await;
        }
    }

    /// Fail a stream with a specific error (e.g. worker crash).
    pub async fn fail(&self, stream_id: StreamId, err: EngineError) {
        if let Some(closure) = self.transition(stream_id, StreamStatus::Errored, false) {
            self.apply_closure(stream_id, closure, Some(err)).await;
        }
    }

    /// Deadline expiry: synthesize the timeout locally and abort the worker
    /// side.
    pub async fn on_timeout(&self, stream_id: StreamId) {
        if let Some(closure) = self.transition(stream_id, StreamStatus::TimedOut, true) {
            self.apply_closure(stream_id, closure, Some(EngineError::Timeout))
                .await;
        }
    }

    /// Cancel a stream. Idempotent; repeated calls (or cancels racing a
    /// completion) are no-ops.
    pub fn cancel(&self, stream_id: StreamId) {
        if let Some(closure) = self.transition(stream_id, StreamStatus::Cancelled, true) {
            // Cancellation pushes no chunk: the consumer asked for the stop,
            // so the queue just closes.
            self.finish_closure(stream_id, closure);
        }
    }

    /// Fail every active stream owned by `worker_id`. Called when a worker
    /// dies with streams in flight.
    pub async fn fail_worker_streams(&self, worker_id: WorkerId, err: EngineError) {
        let owned: Vec<StreamId> = {
            let entries = self.entries.lock().expect("registry mutex poisoned");
            entries
                .iter()
                .filter(|(_, e)| e.worker_id == Some(worker_id) && !e.status.is_terminal())
                .map(|(id, _)| *id)
                .collect()
        };
        for stream_id in owned {
            self.fail(stream_id, err.clone()).await;
        }
    }

    /// Record the terminal transition; returns the closure work to perform
    /// outside the lock, or `None` when the stream is unknown or already
    /// terminal (the event is then dropped silently).
    fn transition(
        &self,
        stream_id: StreamId,
        status: StreamStatus,
        fire_abort: bool,
    ) -> Option<Closure> {
        let mut entries = self.entries.lock().expect("registry mutex poisoned");
        let entry = entries.get_mut(&stream_id)?;
        if entry.status.is_terminal() {
            trace!(%stream_id, event = %status, "event after terminal status dropped");
            return None;
        }
        entry.status = status;

        {
            let mut counters = self.counters.lock().expect("counters poisoned");
            match status {
                StreamStatus::Completed => counters.completed += 1,
                StreamStatus::Errored => counters.errored += 1,
                StreamStatus::TimedOut => counters.timed_out += 1,
                StreamStatus::Cancelled => counters.cancelled += 1,
                StreamStatus::Active => {}
            }
        }

        Some(Closure {
            sink: entry.sink.clone(),
            timeout_task: entry.timeout_task.take(),
            abort_watch_task: entry.abort_watch_task.take(),
            reason: status.close_reason().unwrap_or(StreamCloseReason::Errored),
            fire_abort,
            abort_tx: fire_abort.then(|| entry.abort_tx.clone()),
        })
    }

    /// Closure work that needs an async context (final error chunk push).
    async fn apply_closure(
        &self,
        stream_id: StreamId,
        closure: Closure,
        final_error: Option<EngineError>,
    ) {
        if let (Some(sink), Some(err)) = (closure.sink.as_ref(), final_error) {
            // Delivered after all previously enqueued chunks: the push goes
            // through the same queue, and the close below keeps it poppable.
            let _ = sink.push(GeneratorChunk::Error(err)).await;
        }
        self.finish_closure(stream_id, closure);
    }

    fn finish_closure(&self, stream_id: StreamId, closure: Closure) {
        if let Some(task) = closure.timeout_task {
            task.abort();
        }
        if let Some(task) = closure.abort_watch_task {
            task.abort();
        }
        if closure.fire_abort {
            if let Some(abort_tx) = &closure.abort_tx {
                let _ = abort_tx.send(true);
            }
            if let Some(hook) = self.hooks.lock().expect("hooks mutex poisoned").on_abort.clone() {
                hook(stream_id);
            }
        }
        if let Some(sink) = closure.sink {
            sink.close();
        }
        if let Some(hook) = self.hooks.lock().expect("hooks mutex poisoned").on_close.clone() {
            hook(stream_id, closure.reason);
        }
        debug!(%stream_id, reason = %closure.reason, "stream closed");
    }

    /// Record which worker serves a stream, once routing has decided.
    pub fn set_worker(&self, stream_id: StreamId, worker_id: WorkerId) {
        self.with_entry(&stream_id, |entry| {
            entry.worker_id = Some(worker_id);
        });
    }

    /// Tear out an entry whose setup never completed: no terminal event, no
    /// close hooks, no cleanup scheduling. Used for reverse-order unwind when
    /// registration succeeded but a later setup step failed.
    pub fn abandon(&self, stream_id: StreamId) {
        let entry = {
            let mut entries = self.entries.lock().expect("registry mutex poisoned");
            entries.remove(&stream_id)
        };
        if let Some(entry) = entry {
            if let Some(task) = entry.timeout_task {
                task.abort();
            }
            if let Some(task) = entry.abort_watch_task {
                task.abort();
            }
            if let Some(sink) = entry.sink {
                sink.close();
            }
        }
    }

    /// Remove a terminal entry. Called by the cleanup pipeline once the
    /// stale window has passed. Removing an active entry is refused.
    pub fn remove(&self, stream_id: StreamId) -> bool {
        let mut entries = self.entries.lock().expect("registry mutex poisoned");
        match entries.get(&stream_id) {
            Some(entry) if entry.status.is_terminal() => {
                entries.remove(&stream_id);
                true
            }
            Some(_) => {
                warn!(%stream_id, "refusing to remove active stream entry");
                false
            }
            None => false,
        }
    }

    pub fn is_active(&self, stream_id: StreamId) -> bool {
        let entries = self.entries.lock().expect("registry mutex poisoned");
        entries
            .get(&stream_id)
            .is_some_and(|e| !e.status.is_terminal())
    }

    pub fn view(&self, stream_id: StreamId) -> Option<StreamView> {
        let entries = self.entries.lock().expect("registry mutex poisoned");
        entries.get(&stream_id).map(|e| StreamView {
            stream_id,
            model_id: e.model_id.clone(),
            tenant_id: e.tenant_id.clone(),
            worker_id: e.worker_id,
            status: e.status,
            token_count: e.token_count,
        })
    }

    pub fn active_streams(&self) -> Vec<StreamId> {
        let entries = self.entries.lock().expect("registry mutex poisoned");
        entries
            .iter()
            .filter(|(_, e)| !e.status.is_terminal())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn metrics(&self) -> RegistryMetrics {
        let active = self
            .entries
            .lock()
            .expect("registry mutex poisoned")
            .values()
            .filter(|e| !e.status.is_terminal())
            .count();
        let counters = self.counters.lock().expect("counters poisoned");
        RegistryMetrics {
            active,
            registered_total: counters.registered,
            completed_total: counters.completed,
            errored_total: counters.errored,
            timed_out_total: counters.timed_out,
            cancelled_total: counters.cancelled,
            tokens_total: counters.tokens,
        }
    }

    /// Consume demultiplexed transport events for one worker until the
    /// channel (or the pipe behind it) closes. One pump per worker keeps
    /// per-stream arrival order.
    pub async fn pump(self: Arc<Self>, worker_id: WorkerId, mut rx: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::Chunks(chunks) => {
                    for chunk in chunks {
                        self.on_chunk(chunk).await;
                    }
                }
                TransportEvent::Stats(stats) => self.on_stats(stats).await,
                TransportEvent::Started(stream_id) => {
                    trace!(%stream_id, "stream started on worker");
                }
                TransportEvent::Completed(stream_id) => self.on_completed(stream_id).await,
                TransportEvent::Cancelled(stream_id) => self.cancel(stream_id),
                TransportEvent::StreamError { stream_id, message } => {
                    self.on_error(stream_id, message).await;
                }
                TransportEvent::Timeout(stream_id) => self.on_timeout(stream_id).await,
                TransportEvent::Closed => {
                    self.fail_worker_streams(worker_id, EngineError::WorkerFailed)
                        .await;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::QueuePool;

    fn chunk(stream_id: StreamId, token: &str) -> StreamChunk {
        StreamChunk {
            stream_id,
            token: token.to_owned(),
            token_id: None,
            logprob: None,
            cumulative_text: None,
            is_final: None,
        }
    }

    fn stats(stream_id: StreamId) -> GenerationStats {
        GenerationStats {
            stream_id,
            tokens_generated: 2,
            tokens_per_second: 4.0,
            time_to_first_token: 0.1,
            total_time: 0.5,
        }
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = StreamRegistry::new();
        let id = StreamId::fresh();
        registry.register(id, RegisterOptions::default()).unwrap();
        let err = registry
            .register(id, RegisterOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), strand_types::ErrorCode::AlreadyExists);
    }

    #[tokio::test]
    async fn chunks_flow_to_sink_in_order_then_done() {
        let registry = StreamRegistry::new();
        let pool = QueuePool::new(1, 16);
        let held = pool.acquire().unwrap();
        let id = StreamId::fresh();
        registry
            .register(
                id,
                RegisterOptions {
                    sink: Some(held.handle()),
                    ..RegisterOptions::default()
                },
            )
            .unwrap();

        registry.on_chunk(chunk(id, "A")).await;
        registry.on_chunk(chunk(id, "B")).await;
        registry.on_stats(stats(id)).await;
        registry.on_completed(id).await;

        let q = held.handle();
        match q.pop().await {
            Some(GeneratorChunk::Token(c)) => assert_eq!(c.token, "A"),
            other => panic!("unexpected: {other:?}"),
        }
        match q.pop().await {
            Some(GeneratorChunk::Token(c)) => assert_eq!(c.token, "B"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(q.pop().await, Some(GeneratorChunk::Metadata(_))));
        assert!(q.pop().await.is_none(), "completion closes the queue");
        held.release();
    }

    #[tokio::test]
    async fn events_after_terminal_are_dropped_silently() {
        let registry = StreamRegistry::new();
        let pool = QueuePool::new(1, 16);
        let held = pool.acquire().unwrap();
        let id = StreamId::fresh();
        registry
            .register(
                id,
                RegisterOptions {
                    sink: Some(held.handle()),
                    ..RegisterOptions::default()
                },
            )
            .unwrap();

        registry.on_completed(id).await;
        let metrics_before = registry.metrics();

        // Late runtime messages: all dropped without effect.
        registry.on_chunk(chunk(id, "late")).await;
        registry.on_error(id, "late error".into()).await;
        registry.on_timeout(id).await;
        registry.cancel(id);

        let metrics_after = registry.metrics();
        assert_eq!(metrics_before.completed_total, 1);
        assert_eq!(metrics_after.errored_total, 0);
        assert_eq!(metrics_after.timed_out_total, 0);
        assert_eq!(metrics_after.cancelled_total, 0);
        assert_eq!(metrics_after.tokens_total, 0);
        held.release();
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let registry = StreamRegistry::new();
        let id = StreamId::fresh();
        let reg = registry.register(id, RegisterOptions::default()).unwrap();
        registry.cancel(id);
        registry.cancel(id);
        assert!(!registry.is_active(id));
        assert_eq!(registry.metrics().cancelled_total, 1);
        assert!(*reg.abort_rx.borrow(), "abort signal must fire on cancel");
    }

    #[tokio::test]
    async fn timeout_synthesizes_error_chunk_and_fires_abort() {
        let registry = StreamRegistry::new();
        let pool = QueuePool::new(1, 16);
        let held = pool.acquire().unwrap();
        let id = StreamId::fresh();
        let reg = registry
            .register(
                id,
                RegisterOptions {
                    sink: Some(held.handle()),
                    timeout: Some(Duration::from_millis(50)),
                    ..RegisterOptions::default()
                },
            )
            .unwrap();

        let q = held.handle();
        let start = Instant::now();
        match tokio::time::timeout(Duration::from_millis(500), q.pop()).await {
            Ok(Some(GeneratorChunk::Error(err))) => {
                assert_eq!(err.code(), strand_types::ErrorCode::Timeout);
            }
            other => panic!("expected timeout error chunk, got {other:?}"),
        }
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(q.pop().await.is_none());
        assert!(*reg.abort_rx.borrow());
        held.release();
    }

    #[tokio::test]
    async fn external_abort_cancels_the_stream() {
        let registry = StreamRegistry::new();
        let id = StreamId::fresh();
        let (abort_tx, abort_rx) = watch::channel(false);
        registry
            .register(
                id,
                RegisterOptions {
                    external_abort: Some(abort_rx),
                    ..RegisterOptions::default()
                },
            )
            .unwrap();

        abort_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.is_active(id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("abort should cancel the stream promptly");
        assert_eq!(registry.metrics().cancelled_total, 1);
    }

    #[tokio::test]
    async fn worker_failure_fails_only_that_workers_streams() {
        let registry = StreamRegistry::new();
        let pool = QueuePool::new(2, 16);
        let held1 = pool.acquire().unwrap();
        let held2 = pool.acquire().unwrap();
        let s1 = StreamId::fresh();
        let s2 = StreamId::fresh();
        registry
            .register(
                s1,
                RegisterOptions {
                    worker_id: Some(1),
                    sink: Some(held1.handle()),
                    ..RegisterOptions::default()
                },
            )
            .unwrap();
        registry
            .register(
                s2,
                RegisterOptions {
                    worker_id: Some(2),
                    sink: Some(held2.handle()),
                    ..RegisterOptions::default()
                },
            )
            .unwrap();

        registry
            .fail_worker_streams(1, EngineError::WorkerFailed)
            .await;

        assert!(!registry.is_active(s1));
        assert!(registry.is_active(s2));
        match held1.handle().pop().await {
            Some(GeneratorChunk::Error(err)) => {
                assert_eq!(err.code(), strand_types::ErrorCode::WorkerFailed);
            }
            other => panic!("unexpected: {other:?}"),
        }
        held1.release();
        held2.release();
    }

    #[tokio::test]
    async fn ttft_hook_fires_once_on_first_chunk() {
        let registry = StreamRegistry::new();
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        registry.set_hooks(RegistryHooks {
            on_ttft: Some(Arc::new(move |_seconds| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })),
            ..RegistryHooks::default()
        });
        let pool = QueuePool::new(1, 16);
        let held = pool.acquire().unwrap();
        let id = StreamId::fresh();
        registry
            .register(
                id,
                RegisterOptions {
                    sink: Some(held.handle()),
                    ..RegisterOptions::default()
                },
            )
            .unwrap();

        registry.on_chunk(chunk(id, "a")).await;
        registry.on_chunk(chunk(id, "b")).await;
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
        held.release();
    }

    #[tokio::test]
    async fn remove_only_after_terminal() {
        let registry = StreamRegistry::new();
        let id = StreamId::fresh();
        registry.register(id, RegisterOptions::default()).unwrap();
        assert!(!registry.remove(id), "active entry must not be removed");
        registry.cancel(id);
        assert!(registry.remove(id));
        assert!(registry.view(id).is_none());
    }
}
