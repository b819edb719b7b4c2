//! The public engine facade.
//!
//! [`Engine::start`] composes the whole gateway: supervisor, router, stream
//! registry, scheduler, admission governor, batcher, cleanup scheduler, and
//! queue pool, wired together through the registry hooks and the generator
//! factory's dispatch path. Everything process-wide lives inside the engine
//! instance; `dispose` tears it all down.
//!
//! Dispatch path for one generate call: admission (governor) → slot
//! (scheduler) → worker (router) → accept RPC (batcher → transport). Each
//! stage can fail or suspend; every suspension is bounded by the caller's
//! abort signal or the stream timeout.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use strand_types::{
    EngineError, GenerateParams, GenerationStats, GeneratorChunk, Modality, ModelDescriptor,
    Priority, StreamId, WorkerId,
};
use strand_wire::message::methods;

use crate::admission::AdmissionGovernor;
use crate::batcher::{BatchConfig, BatchEntry, GenerateBatcher};
use crate::cleanup::{CleanupScheduler, StreamCleanupEvent};
use crate::config::EngineConfig;
use crate::generator::{DispatchFn, DispatchRequest, GenerateOptions, GeneratorFactory, TokenGenerator};
use crate::pool::QueuePool;
use crate::prompt::WirePrompt;
use crate::registry::{RegistryHooks, StreamRegistry};
use crate::router::WorkerRouter;
use crate::scheduler::{PriorityScheduler, ScheduleRequest, SchedulerPermit};
use crate::supervisor::{WorkerLauncher, WorkerSupervisor};
use crate::telemetry::Telemetry;
use crate::transport::retry::retry_request;
use crate::transport::RequestOptions;

/// Arguments to [`Engine::load_model`].
#[derive(Debug, Clone)]
pub struct LoadModelRequest {
    pub model_id: String,
    /// Opaque runtime options, forwarded verbatim.
    pub options: Value,
}

impl LoadModelRequest {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            options: json!({}),
        }
    }
}

/// Result of the non-streaming [`Engine::generate`] convenience call.
#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    pub stream_id: StreamId,
    pub text: String,
    pub stats: Option<GenerationStats>,
}

/// Aggregate view across all components.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStats {
    pub registry: crate::registry::RegistryMetrics,
    pub scheduler: crate::scheduler::SchedulerSnapshot,
    pub governor: crate::admission::GovernorSnapshot,
    pub workers: Vec<crate::router::WorkerView>,
    pub pool: crate::pool::PoolStats,
    pub cleanup: crate::cleanup::CleanupStats,
    pub sticky_sessions: usize,
    pub loaded_models: Vec<String>,
}

pub struct Engine {
    config: EngineConfig,
    registry: Arc<StreamRegistry>,
    router: Arc<WorkerRouter>,
    supervisor: Arc<WorkerSupervisor>,
    scheduler: Arc<PriorityScheduler>,
    governor: Arc<AdmissionGovernor>,
    cleanup: Arc<CleanupScheduler>,
    pool: Arc<QueuePool>,
    telemetry: Telemetry,
    factory: GeneratorFactory,
    batchers: Arc<Mutex<HashMap<WorkerId, Arc<GenerateBatcher>>>>,
    models: Mutex<HashMap<String, ModelDescriptor>>,
    disposed: AtomicBool,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Engine {
    /// Compose and start the gateway. Returns once the initial worker set
    /// has attempted its handshakes.
    pub async fn start(config: EngineConfig, launcher: Arc<dyn WorkerLauncher>) -> Arc<Self> {
        let registry = StreamRegistry::new();
        let router = WorkerRouter::new(config.router.clone());
        let scheduler = PriorityScheduler::start(config.scheduler.clone());
        let governor = AdmissionGovernor::new(config.governor.clone());
        let cleanup = CleanupScheduler::new(config.cleanup.clone());
        let pool = QueuePool::new(config.pool_size, config.queue_capacity);
        let telemetry = Telemetry::new();
        let supervisor = WorkerSupervisor::new(
            config.supervisor.clone(),
            launcher,
            Arc::clone(&router),
            Arc::clone(&registry),
        );

        let batchers: Arc<Mutex<HashMap<WorkerId, Arc<GenerateBatcher>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        // Streams currently holding an admission slot; drained exactly once
        // per stream, either at close or on a failed dispatch.
        let governed: Arc<Mutex<HashSet<StreamId>>> = Arc::new(Mutex::new(HashSet::new()));
        // Scheduler permits held by in-flight streams.
        let permits: Arc<Mutex<HashMap<StreamId, SchedulerPermit>>> =
            Arc::new(Mutex::new(HashMap::new()));

        Self::wire_registry_hooks(
            &registry,
            &router,
            &supervisor,
            &governor,
            &cleanup,
            &telemetry,
            &governed,
            &permits,
        );

        let dispatch = Self::dispatch_fn(
            &config,
            &registry,
            &router,
            &supervisor,
            &scheduler,
            &governor,
            &batchers,
            &governed,
            &permits,
        );

        let factory = GeneratorFactory::new(
            Arc::clone(&pool),
            Arc::clone(&registry),
            telemetry.clone(),
            dispatch,
            config.default_stream_timeout,
        );

        // Cleanup firing removes the registry entry and the sticky session.
        {
            let registry = Arc::clone(&registry);
            let router = Arc::clone(&router);
            cleanup.set_handler(Arc::new(move |event| {
                registry.remove(event.stream_id);
                router.forget_stream(event.stream_id);
                Ok(())
            }));
        }

        let mut background = Vec::new();
        background.push(cleanup.spawn());
        background.push(router.spawn_sweeper());
        // Control loop: fold TTFT samples into the concurrency cap.
        {
            let governor = Arc::clone(&governor);
            let scheduler = Arc::clone(&scheduler);
            background.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(governor.sample_interval());
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let limit = governor.tick(Instant::now());
                    scheduler.set_max_concurrent(limit);
                }
            }));
        }

        supervisor.start().await;
        info!(workers = supervisor.worker_count(), "engine started");

        Arc::new(Self {
            config,
            registry,
            router,
            supervisor,
            scheduler,
            governor,
            cleanup,
            pool,
            telemetry,
            factory,
            batchers,
            models: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
            background: Mutex::new(background),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn wire_registry_hooks(
        registry: &Arc<StreamRegistry>,
        router: &Arc<WorkerRouter>,
        supervisor: &Arc<WorkerSupervisor>,
        governor: &Arc<AdmissionGovernor>,
        cleanup: &Arc<CleanupScheduler>,
        telemetry: &Telemetry,
        governed: &Arc<Mutex<HashSet<StreamId>>>,
        permits: &Arc<Mutex<HashMap<StreamId, SchedulerPermit>>>,
    ) {
        let on_ttft = {
            let governor = Arc::clone(governor);
            Arc::new(move |seconds: f64| governor.record_ttft(seconds))
        };

        let on_close = {
            // Weak: these hooks are owned by the registry itself.
            let registry = Arc::downgrade(registry);
            let router = Arc::clone(router);
            let governor = Arc::clone(governor);
            let cleanup = Arc::clone(cleanup);
            let telemetry = telemetry.clone();
            let governed = Arc::clone(governed);
            let permits = Arc::clone(permits);
            Arc::new(
                move |stream_id: StreamId, reason: strand_types::StreamCloseReason| {
                    cleanup.schedule(StreamCleanupEvent {
                        stream_id,
                        closed_at: Instant::now(),
                        reason,
                    });
                    if governed.lock().expect("governed set poisoned").remove(&stream_id) {
                        governor.release();
                    }
                    permits.lock().expect("permit map poisoned").remove(&stream_id);
                    if let Some(registry) = registry.upgrade() {
                        if let Some(worker_id) =
                            registry.view(stream_id).and_then(|v| v.worker_id)
                        {
                            router.note_request_finished(worker_id);
                            if router.active_requests(worker_id) == Some(0) {
                                router.mark_worker_idle(worker_id);
                            }
                        }
                    }
                    telemetry.emit_closed(stream_id, reason);
                },
            )
        };

        let on_abort = {
            let registry = Arc::downgrade(registry);
            let supervisor = Arc::clone(supervisor);
            Arc::new(move |stream_id: StreamId| {
                // Best-effort cancel toward the owning worker.
                let Some(registry) = registry.upgrade() else { return };
                let Some(worker_id) = registry.view(stream_id).and_then(|v| v.worker_id) else {
                    return;
                };
                if let Some(transport) = supervisor.transport(worker_id) {
                    let _ = transport.notify(methods::CANCEL, json!({ "stream_id": stream_id }));
                }
            })
        };

        registry.set_hooks(RegistryHooks {
            on_ttft: Some(on_ttft),
            on_close: Some(on_close),
            on_abort: Some(on_abort),
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_fn(
        config: &EngineConfig,
        registry: &Arc<StreamRegistry>,
        router: &Arc<WorkerRouter>,
        supervisor: &Arc<WorkerSupervisor>,
        scheduler: &Arc<PriorityScheduler>,
        governor: &Arc<AdmissionGovernor>,
        batchers: &Arc<Mutex<HashMap<WorkerId, Arc<GenerateBatcher>>>>,
        governed: &Arc<Mutex<HashSet<StreamId>>>,
        permits: &Arc<Mutex<HashMap<StreamId, SchedulerPermit>>>,
    ) -> DispatchFn {
        let registry = Arc::clone(registry);
        let router = Arc::clone(router);
        let supervisor = Arc::clone(supervisor);
        let scheduler = Arc::clone(scheduler);
        let governor = Arc::clone(governor);
        let batchers = Arc::clone(batchers);
        let governed = Arc::clone(governed);
        let permits = Arc::clone(permits);
        let retry = config.retry.clone();
        let batch_config = config.batch.clone();
        let admission_wait = config.admission_wait;

        Arc::new(move |request: DispatchRequest| {
            let registry = Arc::clone(&registry);
            let router = Arc::clone(&router);
            let supervisor = Arc::clone(&supervisor);
            let scheduler = Arc::clone(&scheduler);
            let governor = Arc::clone(&governor);
            let batchers = Arc::clone(&batchers);
            let governed = Arc::clone(&governed);
            let permits = Arc::clone(&permits);
            let retry = retry.clone();
            let batch_config = batch_config.clone();

            Box::pin(async move {
                let stream_id = request.stream_id;

                // ── Admission ────────────────────────────────────────────────
                Self::admit(&governor, &request, admission_wait).await?;
                governed.lock().expect("governed set poisoned").insert(stream_id);

                let outcome = Self::dispatch_admitted(
                    &registry,
                    &router,
                    &supervisor,
                    &scheduler,
                    &batchers,
                    &permits,
                    &retry,
                    &batch_config,
                    request,
                )
                .await;

                if outcome.is_err() {
                    // The stream never started; return its admission slot
                    // unless a racing close already did.
                    if governed.lock().expect("governed set poisoned").remove(&stream_id) {
                        governor.release();
                    }
                }
                outcome
            })
        })
    }

    async fn admit(
        governor: &AdmissionGovernor,
        request: &DispatchRequest,
        admission_wait: Duration,
    ) -> Result<(), EngineError> {
        use crate::admission::AdmissionDecision;

        let deadline = Instant::now() + admission_wait;
        let mut abort_rx = request.abort_rx.clone();
        let mut queued = false;
        loop {
            match governor.admit(request.tenant_id.as_ref()) {
                AdmissionDecision::Admit => return Ok(()),
                AdmissionDecision::Reject => {
                    governor.note_rejected();
                    return Err(EngineError::ResourceExhausted {
                        what: "tenant budget".into(),
                    });
                }
                AdmissionDecision::Queue | AdmissionDecision::SafeMode => {
                    // One queue outcome per request, however many polls the
                    // wait takes.
                    if !queued {
                        governor.note_queued();
                        queued = true;
                    }
                    if *abort_rx.borrow() {
                        return Err(EngineError::Cancelled);
                    }
                    if Instant::now() >= deadline {
                        return Err(EngineError::Timeout);
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(25)) => {}
                        _ = abort_rx.changed() => {}
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_admitted(
        registry: &Arc<StreamRegistry>,
        router: &Arc<WorkerRouter>,
        supervisor: &Arc<WorkerSupervisor>,
        scheduler: &Arc<PriorityScheduler>,
        batchers: &Arc<Mutex<HashMap<WorkerId, Arc<GenerateBatcher>>>>,
        permits: &Arc<Mutex<HashMap<StreamId, SchedulerPermit>>>,
        retry: &crate::transport::retry::RetryPolicy,
        batch_config: &BatchConfig,
        request: DispatchRequest,
    ) -> Result<WorkerId, EngineError> {
        let stream_id = request.stream_id;

        // ── Scheduling ───────────────────────────────────────────────────────
        let permit = scheduler
            .schedule(ScheduleRequest {
                priority: request.priority,
                estimated_tokens: request.estimated_tokens,
                deadline: request.deadline,
                tenant_id: request.tenant_id.clone(),
                cancel: Some(request.abort_rx.clone()),
            })
            .await?;

        // ── Routing + acceptance ─────────────────────────────────────────────
        let params = Self::wire_generate_params(&request);
        let urgent = request.priority == Priority::Urgent;
        let model_id = request.params.model_id.clone();
        let abort_rx = request.abort_rx.clone();

        let worker_id = retry_request(
            retry,
            Some(request.abort_rx.clone()),
            Some(&request.progress),
            |attempt| {
                let router = Arc::clone(router);
                let supervisor = Arc::clone(supervisor);
                let batchers = Arc::clone(batchers);
                let batch_config = batch_config.clone();
                let params = params.clone();
                let abort_rx = abort_rx.clone();
                let model_id = model_id.clone();
                async move {
                    if attempt > 0 {
                        debug!(%stream_id, attempt, "re-routing generate call");
                    }
                    let worker_id = router.route(Some(&model_id), Some(stream_id))?;
                    let batcher = Self::batcher_for(&batchers, &batch_config, &supervisor, worker_id);
                    batcher
                        .enqueue(BatchEntry {
                            params,
                            stream_id,
                            urgent,
                            cancel: abort_rx,
                        })
                        .await?;
                    Ok(worker_id)
                }
            },
        )
        .await?;

        // ── Accounting ───────────────────────────────────────────────────────
        router.note_request_started(worker_id);
        router.mark_worker_busy(worker_id);
        permits
            .lock()
            .expect("permit map poisoned")
            .insert(stream_id, permit);
        // A cancel may have closed the stream while acceptance was in
        // flight; the close hook already drained the maps, so re-check.
        if !registry.is_active(stream_id) {
            permits.lock().expect("permit map poisoned").remove(&stream_id);
        }
        Ok(worker_id)
    }

    fn batcher_for(
        batchers: &Arc<Mutex<HashMap<WorkerId, Arc<GenerateBatcher>>>>,
        config: &BatchConfig,
        supervisor: &Arc<WorkerSupervisor>,
        worker_id: WorkerId,
    ) -> Arc<GenerateBatcher> {
        let mut map = batchers.lock().expect("batcher map poisoned");
        Arc::clone(map.entry(worker_id).or_insert_with(|| {
            let supervisor = Arc::clone(supervisor);
            GenerateBatcher::spawn(
                config.clone(),
                Arc::new(move || supervisor.transport(worker_id)),
            )
        }))
    }

    /// Wire-shape `generate` params for one dispatch.
    fn wire_generate_params(request: &DispatchRequest) -> Value {
        let p = &request.params;
        let mut value = json!({
            "model_id": p.model_id,
            "stream_id": request.stream_id,
            "streaming": true,
        });
        let object = value.as_object_mut().expect("literal object");
        match &request.wire_prompt {
            WirePrompt::Text(text) => {
                object.insert("prompt".into(), json!(text));
            }
            WirePrompt::Tokens(ids) => {
                object.insert("prompt_tokens".into(), json!(ids));
            }
        }
        let mut set = |key: &str, v: Option<Value>| {
            if let Some(v) = v {
                object.insert(key.into(), v);
            }
        };
        set("max_tokens", p.max_tokens.map(|v| json!(v)));
        set("temperature", p.temperature.map(|v| json!(v)));
        set("top_p", p.top_p.map(|v| json!(v)));
        set("presence_penalty", p.presence_penalty.map(|v| json!(v)));
        set("frequency_penalty", p.frequency_penalty.map(|v| json!(v)));
        set("repetition_penalty", p.repetition_penalty.map(|v| json!(v)));
        set("stop_sequences", p.stop_sequences.as_ref().map(|v| json!(v)));
        set("stop_token_ids", p.stop_token_ids.as_ref().map(|v| json!(v)));
        set("seed", p.seed.map(|v| json!(v)));
        set("draft_model", p.draft_model.as_ref().map(|v| json!(v)));
        set(
            "guidance",
            p.guidance
                .as_ref()
                .map(|g| json!({ "mode": g.mode, "schema": g.schema })),
        );
        value
    }

    fn ensure_live(&self) -> Result<(), EngineError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(EngineError::PreconditionFailed {
                message: "engine is disposed".into(),
            });
        }
        Ok(())
    }

    // ── Public surface ───────────────────────────────────────────────────────

    /// Load a model on every ready worker. Succeeds if at least one worker
    /// accepted the load.
    pub async fn load_model(&self, request: LoadModelRequest) -> Result<ModelDescriptor, EngineError> {
        self.ensure_live()?;
        let ready: Vec<WorkerId> = self
            .router
            .workers()
            .iter()
            .filter(|w| w.status == "idle" || w.status == "busy")
            .map(|w| w.worker_id)
            .collect();
        if ready.is_empty() {
            return Err(EngineError::WorkerUnavailable);
        }

        let model_id = request.model_id;
        let load_params = json!({ "model_id": &model_id, "options": request.options });

        let mut descriptor: Option<ModelDescriptor> = None;
        let mut last_err = EngineError::WorkerUnavailable;
        for worker_id in ready {
            let Some(transport) = self.supervisor.transport(worker_id) else {
                continue;
            };
            let reply = transport
                .request(
                    methods::LOAD_MODEL,
                    load_params.clone(),
                    RequestOptions::default(),
                )
                .await;
            match reply {
                Ok(value) => {
                    self.router.add_worker_skill(worker_id, &model_id);
                    if descriptor.is_none() {
                        descriptor = Some(Self::descriptor_from_reply(&model_id, &value));
                    }
                }
                Err(e) => {
                    warn!(worker_id, error = %e, "load_model failed on worker");
                    last_err = e;
                }
            }
        }

        match descriptor {
            Some(descriptor) => {
                self.models
                    .lock()
                    .expect("model map poisoned")
                    .insert(descriptor.id.clone(), descriptor.clone());
                info!(model_id = %descriptor.id, "model loaded");
                Ok(descriptor)
            }
            None => Err(last_err),
        }
    }

    fn descriptor_from_reply(model_id: &str, value: &Value) -> ModelDescriptor {
        let text_field = |key: &str| value.get(key).and_then(|v| v.as_str()).map(str::to_owned);
        ModelDescriptor {
            id: text_field("model_id").unwrap_or_else(|| model_id.to_owned()),
            family: text_field("family").unwrap_or_else(|| {
                model_id
                    .split(['/', ':'])
                    .next()
                    .unwrap_or(model_id)
                    .to_owned()
            }),
            modality: match value.get("modality").and_then(|v| v.as_str()) {
                Some("vision") => Modality::Vision,
                _ => Modality::Text,
            },
            context_length: value
                .get("context_length")
                .and_then(|v| v.as_u64())
                .unwrap_or(4096) as u32,
            quantization: text_field("quantization"),
            dtype: text_field("dtype"),
            revision: text_field("revision"),
        }
    }

    /// Unload a model from every worker advertising it.
    pub async fn unload_model(&self, model_id: &str) -> Result<(), EngineError> {
        self.ensure_live()?;
        let known = self
            .models
            .lock()
            .expect("model map poisoned")
            .remove(model_id)
            .is_some();
        if !known {
            return Err(EngineError::NotFound {
                what: format!("model {model_id}"),
            });
        }

        for view in self.router.workers() {
            if !view.skills.iter().any(|s| s == model_id) {
                continue;
            }
            self.router.remove_worker_skill(view.worker_id, model_id);
            if let Some(transport) = self.supervisor.transport(view.worker_id) {
                let reply = transport
                    .request(
                        methods::UNLOAD_MODEL,
                        json!({ "model_id": model_id }),
                        RequestOptions::default(),
                    )
                    .await;
                if let Err(e) = reply {
                    warn!(worker_id = view.worker_id, error = %e, "unload_model failed");
                }
            }
        }
        info!(model_id, "model unloaded");
        Ok(())
    }

    /// The set of currently loaded model descriptors.
    pub fn models(&self) -> Vec<ModelDescriptor> {
        let mut models: Vec<ModelDescriptor> = self
            .models
            .lock()
            .expect("model map poisoned")
            .values()
            .cloned()
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    /// Create a streaming generator for one generate call.
    pub async fn create_generator(
        &self,
        params: GenerateParams,
        opts: GenerateOptions,
    ) -> Result<TokenGenerator, EngineError> {
        self.ensure_live()?;
        self.factory.create(params, opts).await
    }

    /// Non-streaming convenience: run the stream to completion and collect
    /// the text.
    pub async fn generate(
        &self,
        params: GenerateParams,
        opts: GenerateOptions,
    ) -> Result<GenerateOutcome, EngineError> {
        let mut generator = self.create_generator(params, opts).await?;
        let stream_id = generator.stream_id();
        let mut text = String::new();
        let mut stats = None;
        while let Some(chunk) = generator.next().await {
            match chunk {
                GeneratorChunk::Token(c) => text.push_str(&c.token),
                GeneratorChunk::Metadata(s) => stats = Some(s),
                GeneratorChunk::Error(e) => return Err(e),
            }
        }
        Ok(GenerateOutcome {
            stream_id,
            text,
            stats,
        })
    }

    /// Register telemetry hooks.
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Aggregate metrics across all components.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            registry: self.registry.metrics(),
            scheduler: self.scheduler.snapshot(),
            governor: self.governor.snapshot(),
            workers: self.router.workers(),
            pool: self.pool.stats(),
            cleanup: self.cleanup.stats(),
            sticky_sessions: self.router.sticky_session_count(),
            loaded_models: self.models().into_iter().map(|m| m.id).collect(),
        }
    }

    /// Orderly shutdown: stop intake, cancel active streams, drain the
    /// batchers, and stop workers and background tasks. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("engine disposing");

        for stream_id in self.registry.active_streams() {
            self.registry.cancel(stream_id);
        }
        // Dropping the batchers closes their ingress; each flushes what it
        // holds and stops.
        self.batchers.lock().expect("batcher map poisoned").clear();

        self.scheduler.shutdown();
        self.cleanup.shutdown();
        self.router.shutdown();
        self.supervisor.shutdown().await;

        for task in self.background.lock().expect("background tasks poisoned").drain(..) {
            task.abort();
        }
        info!("engine disposed");
    }
}
