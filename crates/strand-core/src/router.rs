//! Worker selection.
//!
//! The router keeps a view of every supervised worker plus a sticky-session
//! map keyed by stream id. Selection first honors a live sticky session,
//! then filters to healthy workers (optionally intersected with the workers
//! advertising the requested model), then applies the configured strategy.
//!
//! Marking a worker failed removes every sticky session pointing at it under
//! the same lock, so no routing decision can observe a session for a dead
//! worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use strand_types::{EngineError, StreamId, WorkerId};

/// Selection strategy over the eligible worker set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RouteStrategy {
    RoundRobin,
    LeastBusy,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub strategy: RouteStrategy,
    /// Pin follow-up traffic for a stream to its first worker.
    pub sticky: bool,
    /// Sticky-session lifetime. Sessions touch on every hit.
    pub sticky_ttl: Duration,
    /// Only route a model to workers advertising it. Workers advertising no
    /// models are treated as serving anything.
    pub smart_routing: bool,
    /// Cadence of the expired-session sweep.
    pub sweep_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: RouteStrategy::LeastBusy,
            sticky: true,
            sticky_ttl: Duration::from_secs(60),
            smart_routing: true,
            sweep_interval: Duration::from_secs(10),
        }
    }
}

/// Lifecycle state of a worker as seen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Idle,
    Busy,
    Failed,
}

#[derive(Debug)]
struct WorkerRecord {
    pid: Option<u32>,
    status: WorkerStatus,
    active_requests: u32,
    total_requests: u64,
    last_heartbeat_at: Option<DateTime<Utc>>,
    started_at: DateTime<Utc>,
    /// Model ids this worker advertises; empty means "anything".
    skills: Vec<String>,
}

/// Snapshot of one worker, for routing diagnostics and the stats surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerView {
    pub worker_id: WorkerId,
    pub pid: Option<u32>,
    pub status: String,
    pub active_requests: u32,
    pub total_requests: u64,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub skills: Vec<String>,
}

#[derive(Debug, Clone)]
struct StickySession {
    worker_id: WorkerId,
    #[allow(dead_code)]
    created_at: Instant,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct RouterInner {
    workers: HashMap<WorkerId, WorkerRecord>,
    sticky: HashMap<StreamId, StickySession>,
    rr_counter: u64,
    /// Tie-break counter for least-busy.
    rr_tiebreak: u64,
}

pub struct WorkerRouter {
    config: RouterConfig,
    inner: Mutex<RouterInner>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for WorkerRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("router mutex poisoned");
        f.debug_struct("WorkerRouter")
            .field("workers", &inner.workers.len())
            .field("sticky_sessions", &inner.sticky.len())
            .finish()
    }
}

impl WorkerRouter {
    pub fn new(config: RouterConfig) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            inner: Mutex::new(RouterInner::default()),
            shutdown_tx,
        })
    }

    // ── Worker lifecycle ─────────────────────────────────────────────────────

    /// Add a worker in `Starting` state; it receives no traffic until
    /// [`Self::set_worker_ready`].
    pub fn register_worker(&self, worker_id: WorkerId, pid: Option<u32>) {
        let mut inner = self.inner.lock().expect("router mutex poisoned");
        inner.workers.insert(
            worker_id,
            WorkerRecord {
                pid,
                status: WorkerStatus::Starting,
                active_requests: 0,
                total_requests: 0,
                last_heartbeat_at: None,
                started_at: Utc::now(),
                skills: Vec::new(),
            },
        );
        info!(worker_id, "worker registered");
    }

    /// Handshake completed; the worker may now receive traffic.
    pub fn set_worker_ready(&self, worker_id: WorkerId, skills: Vec<String>) {
        let mut inner = self.inner.lock().expect("router mutex poisoned");
        if let Some(record) = inner.workers.get_mut(&worker_id) {
            record.status = WorkerStatus::Idle;
            record.skills = skills;
            record.last_heartbeat_at = Some(Utc::now());
        }
    }

    pub fn unregister_worker(&self, worker_id: WorkerId) {
        let mut inner = self.inner.lock().expect("router mutex poisoned");
        inner.workers.remove(&worker_id);
        inner.sticky.retain(|_, s| s.worker_id != worker_id);
        info!(worker_id, "worker unregistered");
    }

    pub fn mark_worker_busy(&self, worker_id: WorkerId) {
        self.set_status(worker_id, WorkerStatus::Busy);
    }

    pub fn mark_worker_idle(&self, worker_id: WorkerId) {
        self.set_status(worker_id, WorkerStatus::Idle);
    }

    /// Fail a worker and atomically drop every sticky session pointing at
    /// it: after this returns, no routing decision can land on the worker.
    pub fn mark_worker_failed(&self, worker_id: WorkerId) {
        let mut inner = self.inner.lock().expect("router mutex poisoned");
        if let Some(record) = inner.workers.get_mut(&worker_id) {
            record.status = WorkerStatus::Failed;
        }
        let before = inner.sticky.len();
        inner.sticky.retain(|_, s| s.worker_id != worker_id);
        warn!(
            worker_id,
            dropped_sessions = before - inner.sticky.len(),
            "worker failed"
        );
    }

    fn set_status(&self, worker_id: WorkerId, status: WorkerStatus) {
        let mut inner = self.inner.lock().expect("router mutex poisoned");
        if let Some(record) = inner.workers.get_mut(&worker_id) {
            record.status = status;
        }
    }

    /// Account a dispatched request.
    pub fn note_request_started(&self, worker_id: WorkerId) {
        let mut inner = self.inner.lock().expect("router mutex poisoned");
        if let Some(record) = inner.workers.get_mut(&worker_id) {
            record.active_requests += 1;
            record.total_requests += 1;
        }
    }

    /// Account a finished request. Clamped at zero.
    pub fn note_request_finished(&self, worker_id: WorkerId) {
        let mut inner = self.inner.lock().expect("router mutex poisoned");
        if let Some(record) = inner.workers.get_mut(&worker_id) {
            record.active_requests = record.active_requests.saturating_sub(1);
        }
    }

    /// Advertise an additional model on a worker (after a successful
    /// `load_model`).
    pub fn add_worker_skill(&self, worker_id: WorkerId, model_id: &str) {
        let mut inner = self.inner.lock().expect("router mutex poisoned");
        if let Some(record) = inner.workers.get_mut(&worker_id) {
            if !record.skills.iter().any(|s| s == model_id) {
                record.skills.push(model_id.to_owned());
            }
        }
    }

    /// Withdraw a model from a worker's advertised set.
    pub fn remove_worker_skill(&self, worker_id: WorkerId, model_id: &str) {
        let mut inner = self.inner.lock().expect("router mutex poisoned");
        if let Some(record) = inner.workers.get_mut(&worker_id) {
            record.skills.retain(|s| s != model_id);
        }
    }

    /// Current in-flight request count for one worker.
    pub fn active_requests(&self, worker_id: WorkerId) -> Option<u32> {
        let inner = self.inner.lock().expect("router mutex poisoned");
        inner.workers.get(&worker_id).map(|w| w.active_requests)
    }

    /// Fold a heartbeat metrics report into the worker view.
    pub fn record_heartbeat(
        &self,
        worker_id: WorkerId,
        active_requests: Option<u32>,
        total_requests: Option<u64>,
    ) {
        let mut inner = self.inner.lock().expect("router mutex poisoned");
        if let Some(record) = inner.workers.get_mut(&worker_id) {
            record.last_heartbeat_at = Some(Utc::now());
            if let Some(active) = active_requests {
                record.active_requests = active;
            }
            if let Some(total) = total_requests {
                record.total_requests = total;
            }
        }
    }

    // ── Selection ────────────────────────────────────────────────────────────

    /// Pick a worker for a request.
    ///
    /// `stream_id` enables sticky affinity; `model_id` enables skill
    /// filtering when smart routing is on.
    pub fn route(
        &self,
        model_id: Option<&str>,
        stream_id: Option<StreamId>,
    ) -> Result<WorkerId, EngineError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("router mutex poisoned");

        // Sticky hit: session alive and its worker healthy.
        if self.config.sticky {
            if let Some(stream_id) = stream_id {
                if let Some(session) = inner.sticky.get(&stream_id).cloned() {
                    let alive = session.expires_at > now
                        && inner
                            .workers
                            .get(&session.worker_id)
                            .is_some_and(|w| w.status != WorkerStatus::Failed);
                    if alive {
                        debug!(%stream_id, worker_id = session.worker_id, "sticky route hit");
                        return Ok(session.worker_id);
                    }
                    inner.sticky.remove(&stream_id);
                }
            }
        }

        let mut eligible: Vec<(WorkerId, u32)> = inner
            .workers
            .iter()
            .filter(|(_, w)| !matches!(w.status, WorkerStatus::Failed | WorkerStatus::Starting))
            .filter(|(_, w)| match (self.config.smart_routing, model_id) {
                (true, Some(model)) => {
                    w.skills.is_empty() || w.skills.iter().any(|s| s == model)
                }
                _ => true,
            })
            .map(|(id, w)| (*id, w.active_requests))
            .collect();
        if eligible.is_empty() {
            return Err(EngineError::WorkerUnavailable);
        }
        // Stable order so the round-robin counter is meaningful.
        eligible.sort_by_key(|(id, _)| *id);

        let chosen = match self.config.strategy {
            RouteStrategy::RoundRobin => {
                let idx = (inner.rr_counter as usize) % eligible.len();
                inner.rr_counter = inner.rr_counter.wrapping_add(1);
                eligible[idx].0
            }
            RouteStrategy::LeastBusy => {
                let min_active = eligible.iter().map(|(_, a)| *a).min().unwrap_or(0);
                let least: Vec<WorkerId> = eligible
                    .iter()
                    .filter(|(_, a)| *a == min_active)
                    .map(|(id, _)| *id)
                    .collect();
                let idx = (inner.rr_tiebreak as usize) % least.len();
                inner.rr_tiebreak = inner.rr_tiebreak.wrapping_add(1);
                least[idx]
            }
        };

        if self.config.sticky {
            if let Some(stream_id) = stream_id {
                inner.sticky.insert(
                    stream_id,
                    StickySession {
                        worker_id: chosen,
                        created_at: now,
                        expires_at: now + self.config.sticky_ttl,
                    },
                );
            }
        }
        Ok(chosen)
    }

    /// Drop a stream's sticky session (stream closed).
    pub fn forget_stream(&self, stream_id: StreamId) {
        let mut inner = self.inner.lock().expect("router mutex poisoned");
        inner.sticky.remove(&stream_id);
    }

    /// The worker a stream is pinned to, if a live session exists.
    pub fn sticky_worker(&self, stream_id: StreamId) -> Option<WorkerId> {
        let inner = self.inner.lock().expect("router mutex poisoned");
        inner
            .sticky
            .get(&stream_id)
            .filter(|s| s.expires_at > Instant::now())
            .map(|s| s.worker_id)
    }

    /// Remove expired sessions as of `now`.
    pub fn sweep_sticky(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock().expect("router mutex poisoned");
        let before = inner.sticky.len();
        inner.sticky.retain(|_, s| s.expires_at > now);
        before - inner.sticky.len()
    }

    pub fn sticky_session_count(&self) -> usize {
        self.inner.lock().expect("router mutex poisoned").sticky.len()
    }

    pub fn workers(&self) -> Vec<WorkerView> {
        let inner = self.inner.lock().expect("router mutex poisoned");
        let mut views: Vec<WorkerView> = inner
            .workers
            .iter()
            .map(|(id, w)| WorkerView {
                worker_id: *id,
                pid: w.pid,
                status: w.status.to_string(),
                active_requests: w.active_requests,
                total_requests: w.total_requests,
                last_heartbeat_at: w.last_heartbeat_at,
                started_at: w.started_at,
                skills: w.skills.clone(),
            })
            .collect();
        views.sort_by_key(|v| v.worker_id);
        views
    }

    /// Run the periodic session sweep until [`Self::shutdown`].
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let router = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(router.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = router.sweep_sticky(Instant::now());
                        if removed > 0 {
                            debug!(removed, "expired sticky sessions swept");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
