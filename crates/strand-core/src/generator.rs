//! Generator factory: pull-based token iterators over registry streams.
//!
//! Each generator owns one pooled queue for its lifetime. The setup sequence
//! is queue acquisition → stream registration → dispatch; when a later step
//! fails, the earlier ones are undone in reverse order, so a failed setup
//! leaves no registry entry and no leaked queue. Over every terminal path
//! (normal completion, consumer cancel, error, failed setup, or plain drop)
//! the queue is released to the pool exactly once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::debug;

use strand_types::{
    EngineError, GenerateParams, GeneratorChunk, Priority, StreamId, TenantId, WorkerId,
};

use crate::pool::{PooledQueue, QueueHandle, QueuePool};
use crate::prompt::{self, WirePrompt};
use crate::registry::{RegisterOptions, StreamRegistry};
use crate::telemetry::Telemetry;
use crate::transport::retry::StreamProgress;

/// Per-call options for [`GeneratorFactory::create`].
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub priority: Priority,
    /// Stream deadline; on expiry the iterator yields a `Timeout` error.
    pub timeout: Option<Duration>,
    pub tenant_id: Option<TenantId>,
    /// Caller-supplied stream id; minted when absent.
    pub stream_id: Option<StreamId>,
    /// Abort signal: flipping it to `true` cancels the stream.
    pub abort: Option<watch::Receiver<bool>>,
    /// Scheduler hint for shortest-job-first selection.
    pub estimated_tokens: Option<u64>,
    /// Scheduler deadline used for urgency-based selection.
    pub deadline: Option<Instant>,
}

/// Everything the engine needs to admit, schedule, route, and send one
/// generate call. Produced by the factory after local validation.
pub struct DispatchRequest {
    pub stream_id: StreamId,
    pub params: GenerateParams,
    pub wire_prompt: WirePrompt,
    pub priority: Priority,
    pub tenant_id: Option<TenantId>,
    pub estimated_tokens: Option<u64>,
    pub deadline: Option<Instant>,
    /// Wired into the generate RPC; fires on cancel/timeout.
    pub abort_rx: watch::Receiver<bool>,
    /// Suppresses retries once streamed output has been observed.
    pub progress: StreamProgress,
}

/// The engine half of generator setup: admission, scheduling, routing, and
/// the worker RPC. Returns the worker that accepted the stream.
pub type DispatchFn =
    Arc<dyn Fn(DispatchRequest) -> BoxFuture<'static, Result<WorkerId, EngineError>> + Send + Sync>;

pub struct GeneratorFactory {
    pool: Arc<QueuePool>,
    registry: Arc<StreamRegistry>,
    telemetry: Telemetry,
    dispatch: DispatchFn,
    default_timeout: Option<Duration>,
}

impl GeneratorFactory {
    pub fn new(
        pool: Arc<QueuePool>,
        registry: Arc<StreamRegistry>,
        telemetry: Telemetry,
        dispatch: DispatchFn,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            pool,
            registry,
            telemetry,
            dispatch,
            default_timeout,
        }
    }

    /// Build a generator for one stream.
    ///
    /// Validation errors surface here, synchronously, before any resource is
    /// held.
    pub async fn create(
        &self,
        params: GenerateParams,
        opts: GenerateOptions,
    ) -> Result<TokenGenerator, EngineError> {
        validate_params(&params)?;
        let wire_prompt = prompt::materialize(&params.prompt)?;

        // Step 1: queue acquisition.
        let held = self.pool.acquire().ok_or(EngineError::ResourceExhausted {
            what: "generator queue pool".into(),
        })?;
        let handle = held.handle();

        // Step 2: stream registration.
        let stream_id = opts.stream_id.unwrap_or_else(StreamId::fresh);
        let registration = match self.registry.register(
            stream_id,
            RegisterOptions {
                model_id: Some(params.model_id.clone()),
                tenant_id: opts.tenant_id.clone(),
                worker_id: None,
                sink: Some(handle.clone()),
                timeout: opts.timeout.or(self.default_timeout),
                external_abort: opts.abort.clone(),
            },
        ) {
            Ok(registration) => registration,
            Err(e) => {
                // Unwind step 1.
                held.release();
                return Err(e);
            }
        };

        // Step 3: dispatch to a worker.
        let request = DispatchRequest {
            stream_id,
            params,
            wire_prompt,
            priority: opts.priority,
            tenant_id: opts.tenant_id,
            estimated_tokens: opts.estimated_tokens,
            deadline: opts.deadline,
            abort_rx: registration.abort_rx,
            progress: registration.progress,
        };
        match (self.dispatch)(request).await {
            Ok(worker_id) => {
                self.registry.set_worker(stream_id, worker_id);
            }
            Err(e) => {
                // Unwind steps 2 then 1, in reverse order.
                self.registry.abandon(stream_id);
                held.release();
                return Err(e);
            }
        }

        Ok(TokenGenerator {
            stream_id,
            registry: Arc::clone(&self.registry),
            telemetry: self.telemetry.clone(),
            handle,
            queue: Some(held),
            done: false,
        })
    }
}

fn validate_params(params: &GenerateParams) -> Result<(), EngineError> {
    if params.model_id.is_empty() {
        return Err(EngineError::InvalidArgument {
            message: "model_id is empty".into(),
        });
    }
    if params.max_tokens == Some(0) {
        return Err(EngineError::InvalidArgument {
            message: "max_tokens must be positive".into(),
        });
    }
    for (name, value) in [
        ("temperature", params.temperature),
        ("top_p", params.top_p),
        ("presence_penalty", params.presence_penalty),
        ("frequency_penalty", params.frequency_penalty),
        ("repetition_penalty", params.repetition_penalty),
    ] {
        if let Some(value) = value {
            if !value.is_finite() {
                return Err(EngineError::InvalidArgument {
                    message: format!("{name} must be finite"),
                });
            }
        }
    }
    Ok(())
}

/// Pull-based, single-consumer iterator over one generation stream.
///
/// The iterator ends by returning `None`; a stream-level failure is yielded
/// as a final [`GeneratorChunk::Error`] before the end. Dropping the
/// generator mid-stream cancels the stream.
pub struct TokenGenerator {
    stream_id: StreamId,
    registry: Arc<StreamRegistry>,
    telemetry: Telemetry,
    handle: QueueHandle,
    queue: Option<PooledQueue>,
    done: bool,
}

impl std::fmt::Debug for TokenGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGenerator")
            .field("stream_id", &self.stream_id)
            .field("done", &self.done)
            .finish()
    }
}

impl TokenGenerator {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Await the next chunk; `None` means the stream is over.
    ///
    /// Suspends while the stream is active and no chunk is buffered; the
    /// suspension is bounded by the stream's timeout or abort signal.
    pub async fn next(&mut self) -> Option<GeneratorChunk> {
        if self.done {
            return None;
        }
        match self.handle.pop().await {
            Some(chunk) => {
                match &chunk {
                    GeneratorChunk::Token(token) => self.telemetry.emit_token(token),
                    GeneratorChunk::Metadata(stats) => self.telemetry.emit_completed(stats),
                    GeneratorChunk::Error(err) => {
                        debug!(stream_id = %self.stream_id, error = %err, "stream ended in error");
                        // The error is the last chunk; release eagerly so the
                        // queue is back in the pool even if the consumer
                        // never polls again.
                        self.finish();
                    }
                }
                Some(chunk)
            }
            None => {
                self.finish();
                None
            }
        }
    }

    /// Stop consuming: cancels the stream and releases resources. Safe to
    /// call at any point, any number of times.
    pub fn cancel(&mut self) {
        if !self.done {
            self.registry.cancel(self.stream_id);
        }
        self.finish();
    }

    /// Propagate a caller-induced failure: the stream is cancelled, the
    /// error is recorded, and resources are released.
    pub fn abort(&mut self, error: EngineError) {
        debug!(stream_id = %self.stream_id, error = %error, "generator aborted by caller");
        self.cancel();
    }

    /// Adapt into a [`futures::Stream`] of chunks.
    pub fn into_stream(self) -> impl futures::Stream<Item = GeneratorChunk> + Send {
        futures::stream::unfold(self, |mut generator| async move {
            generator.next().await.map(|chunk| (chunk, generator))
        })
    }

    fn finish(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.release();
        }
        self.done = true;
    }
}

impl Drop for TokenGenerator {
    fn drop(&mut self) {
        if !self.done {
            // Consumer walked away mid-stream.
            self.registry.cancel(self.stream_id);
        }
        if let Some(queue) = self.queue.take() {
            queue.release();
        }
    }
}
