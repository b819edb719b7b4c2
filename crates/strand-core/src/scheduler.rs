//! SLA-aware priority scheduling.
//!
//! Five tiers, tier 0 most urgent. Selection runs in a single background
//! task, so at most one decision is ever in progress. The order of
//! consideration per decision:
//!
//! 1. urgency override: the request with the smallest deadline slack wins
//!    when that slack is below the urgency threshold;
//! 2. fairness intervention: with probability `fairness_weight`, the oldest
//!    request in the two lowest tiers is picked to break starvation;
//! 3. tier scan: first non-empty tier, FIFO or shortest-job-first.
//!
//! A background aging timer promotes requests that have waited too long, one
//! tier per promotion, never above tier 0. The concurrency cap is adjustable
//! at runtime; the admission governor shrinks it under load.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{oneshot, watch, Notify};
use tracing::{debug, trace, warn};

use strand_types::{EngineError, Priority, TenantId};

/// Latency envelope configured per tier.
#[derive(Debug, Clone)]
pub struct SlaEnvelope {
    pub target_latency: Duration,
    pub max_latency: Duration,
    /// Violations tolerated before the tier is flagged in stats.
    pub violation_threshold: u32,
}

#[derive(Debug, Clone)]
pub struct SchedulerPolicy {
    pub shortest_job_first: bool,
    /// Cooperative preemption scaffold; off by default and never involuntary.
    pub allow_preemption: bool,
    /// Probability of a fairness pick, in `[0, 1]`.
    pub fairness_weight: f64,
    /// Deadline slack below which a request is treated as urgent.
    pub urgency_threshold: Duration,
    pub aging_enabled: bool,
    /// A request waits this long (times promotions so far, plus one) before
    /// its next promotion.
    pub aging_interval: Duration,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            shortest_job_first: false,
            allow_preemption: false,
            fairness_weight: 0.05,
            urgency_threshold: Duration::from_millis(250),
            aging_enabled: true,
            aging_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub policy: SchedulerPolicy,
    /// Total queued requests across all tiers.
    pub max_queue_size: usize,
    /// Initial concurrency cap; adjustable via [`PriorityScheduler::set_max_concurrent`].
    pub max_concurrent: usize,
    pub sla: [SlaEnvelope; Priority::TIERS],
    /// Fallback estimated tokens per tier when a request supplies none.
    pub default_estimated_tokens: [u64; Priority::TIERS],
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let sla = |target_ms: u64, max_ms: u64| SlaEnvelope {
            target_latency: Duration::from_millis(target_ms),
            max_latency: Duration::from_millis(max_ms),
            violation_threshold: 10,
        };
        Self {
            policy: SchedulerPolicy::default(),
            max_queue_size: 1024,
            max_concurrent: 64,
            sla: [
                sla(100, 500),
                sla(250, 1_000),
                sla(500, 5_000),
                sla(2_000, 15_000),
                sla(10_000, 60_000),
            ],
            default_estimated_tokens: [64, 128, 256, 512, 1024],
        }
    }
}

/// One schedule request.
#[derive(Debug, Default)]
pub struct ScheduleRequest {
    pub priority: Priority,
    pub estimated_tokens: Option<u64>,
    pub deadline: Option<Instant>,
    pub tenant_id: Option<TenantId>,
    /// Abort signal; a cancelled request leaves the queue with no effect.
    pub cancel: Option<watch::Receiver<bool>>,
}

struct QueuedRequest {
    id: u64,
    queued_at: Instant,
    original_priority: Priority,
    aging_bumps: u32,
    estimated_tokens: u64,
    deadline: Option<Instant>,
    #[allow(dead_code)]
    tenant_id: Option<TenantId>,
    reply: oneshot::Sender<SchedulerPermit>,
}

#[derive(Default)]
struct SchedulerInner {
    tiers: [std::collections::VecDeque<QueuedRequest>; Priority::TIERS],
    executing: HashMap<u64, ExecutingRequest>,
    next_id: u64,
    violations: [u32; Priority::TIERS],
}

struct ExecutingRequest {
    tier: usize,
    preempt: Arc<AtomicBool>,
}

/// Queue depths and counters for the stats surface.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SchedulerSnapshot {
    pub queued_per_tier: [usize; Priority::TIERS],
    pub executing: usize,
    pub max_concurrent: usize,
    pub sla_violations: [u32; Priority::TIERS],
}

/// An execution slot. Dropping it frees the slot for the next selection.
pub struct SchedulerPermit {
    scheduler: Arc<PriorityScheduler>,
    id: u64,
    preempt: Arc<AtomicBool>,
    released: bool,
}

impl std::fmt::Debug for SchedulerPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerPermit").field("id", &self.id).finish()
    }
}

impl SchedulerPermit {
    /// Cooperative preemption tag. The holder is expected to wind down when
    /// this turns `true`; nothing forces it to.
    pub fn preempt_requested(&self) -> bool {
        self.preempt.load(Ordering::Acquire)
    }
}

impl Drop for SchedulerPermit {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.scheduler.release_slot(self.id);
        }
    }
}

pub struct PriorityScheduler {
    config: SchedulerConfig,
    inner: Mutex<SchedulerInner>,
    max_concurrent: AtomicUsize,
    wakeup: Notify,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for PriorityScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityScheduler")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl PriorityScheduler {
    /// Create the scheduler and start its selection and aging tasks.
    pub fn start(config: SchedulerConfig) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let scheduler = Arc::new(Self {
            max_concurrent: AtomicUsize::new(config.max_concurrent),
            config,
            inner: Mutex::new(SchedulerInner::default()),
            wakeup: Notify::new(),
            shutdown_tx,
        });

        {
            let scheduler = Arc::clone(&scheduler);
            let shutdown_rx = scheduler.shutdown_tx.subscribe();
            tokio::spawn(scheduler.clone().selection_loop(shutdown_rx));
        }
        if scheduler.config.policy.aging_enabled {
            let aging = Arc::clone(&scheduler);
            let shutdown_rx = scheduler.shutdown_tx.subscribe();
            tokio::spawn(aging.aging_loop(shutdown_rx));
        }
        scheduler
    }

    /// Wait for an execution slot.
    ///
    /// Suspends until selected; the suspension ends early when the request's
    /// abort signal fires. Fails fast with `ResourceExhausted` when the
    /// queue is at capacity.
    pub async fn schedule(
        self: &Arc<Self>,
        request: ScheduleRequest,
    ) -> Result<SchedulerPermit, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let tier = request.priority.tier();
        let id = {
            let mut inner = self.inner.lock().expect("scheduler mutex poisoned");
            let queued: usize = inner.tiers.iter().map(|q| q.len()).sum();
            if queued >= self.config.max_queue_size {
                return Err(EngineError::ResourceExhausted {
                    what: "scheduler queue".into(),
                });
            }
            let id = inner.next_id;
            inner.next_id += 1;
            let estimated_tokens = request
                .estimated_tokens
                .unwrap_or(self.config.default_estimated_tokens[tier]);
            inner.tiers[tier].push_back(QueuedRequest {
                id,
                queued_at: Instant::now(),
                original_priority: request.priority,
                aging_bumps: 0,
                estimated_tokens,
                deadline: request.deadline,
                tenant_id: request.tenant_id,
                reply: reply_tx,
            });
            id
        };
        self.wakeup.notify_one();

        let mut cancel = request.cancel;
        let cancelled = async {
            match cancel.as_mut() {
                Some(rx) => {
                    while !*rx.borrow() {
                        if rx.changed().await.is_err() {
                            std::future::pending::<()>().await;
                        }
                    }
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            permit = reply_rx => permit.map_err(|_| EngineError::PreconditionFailed {
                message: "scheduler stopped".into(),
            }),
            _ = cancelled => {
                self.remove_queued(id);
                Err(EngineError::Cancelled)
            }
        }
    }

    /// Remove a still-queued request (abort before selection). No effect if
    /// it was already selected.
    fn remove_queued(&self, id: u64) {
        let mut inner = self.inner.lock().expect("scheduler mutex poisoned");
        for tier in inner.tiers.iter_mut() {
            if let Some(pos) = tier.iter().position(|r| r.id == id) {
                tier.remove(pos);
                return;
            }
        }
    }

    fn release_slot(&self, id: u64) {
        let mut inner = self.inner.lock().expect("scheduler mutex poisoned");
        inner.executing.remove(&id);
        drop(inner);
        self.wakeup.notify_one();
    }

    /// Adjust the concurrency cap (the admission governor shrinks it under
    /// load). Raising it wakes the selection loop.
    pub fn set_max_concurrent(&self, cap: usize) {
        self.max_concurrent.store(cap.max(1), Ordering::Release);
        self.wakeup.notify_one();
    }

    /// Tag the lowest-tier executing request for cooperative preemption.
    /// A no-op unless `allow_preemption` is set. Extension point; nothing in
    /// the engine calls it.
    pub fn request_preemption(&self) -> bool {
        if !self.config.policy.allow_preemption {
            return false;
        }
        let inner = self.inner.lock().expect("scheduler mutex poisoned");
        if let Some(victim) = inner.executing.values().max_by_key(|e| e.tier) {
            victim.preempt.store(true, Ordering::Release);
            return true;
        }
        false
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let inner = self.inner.lock().expect("scheduler mutex poisoned");
        SchedulerSnapshot {
            queued_per_tier: std::array::from_fn(|i| inner.tiers[i].len()),
            executing: inner.executing.len(),
            max_concurrent: self.max_concurrent.load(Ordering::Acquire),
            sla_violations: inner.violations,
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.wakeup.notify_one();
    }

    // ── Selection ────────────────────────────────────────────────────────────

    async fn selection_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                return;
            }
            let selected = {
                let mut inner = self.inner.lock().expect("scheduler mutex poisoned");
                if inner.executing.len() < self.max_concurrent.load(Ordering::Acquire) {
                    self.pick_next(&mut inner, Instant::now())
                } else {
                    None
                }
            };
            match selected {
                Some((request, preempt)) => {
                    let permit = SchedulerPermit {
                        scheduler: Arc::clone(&self),
                        id: request.id,
                        preempt,
                        released: false,
                    };
                    if request.reply.send(permit).is_err() {
                        // Requester vanished between selection and delivery;
                        // the permit's drop released the slot already.
                        trace!(id = request.id, "selected request abandoned");
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.wakeup.notified() => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
            }
        }
    }

    /// One selection decision. Mutates `inner`: the chosen request leaves
    /// its queue and joins the executing set.
    fn pick_next(
        &self,
        inner: &mut SchedulerInner,
        now: Instant,
    ) -> Option<(QueuedRequest, Arc<AtomicBool>)> {
        let choice = self
            .pick_urgent(inner, now)
            .or_else(|| self.pick_fair(inner))
            .or_else(|| self.pick_by_tier(inner));
        let (tier, pos) = choice?;

        let request = inner.tiers[tier].remove(pos)?;
        let waited = now.duration_since(request.queued_at);
        let envelope = &self.config.sla[request.original_priority.tier()];
        if waited > envelope.max_latency {
            inner.violations[request.original_priority.tier()] =
                inner.violations[request.original_priority.tier()].saturating_add(1);
            if inner.violations[request.original_priority.tier()] == envelope.violation_threshold {
                warn!(
                    tier = request.original_priority.tier(),
                    "scheduling latency violations reached threshold"
                );
            }
        }

        let preempt = Arc::new(AtomicBool::new(false));
        inner.executing.insert(
            request.id,
            ExecutingRequest {
                tier: request.original_priority.tier(),
                preempt: Arc::clone(&preempt),
            },
        );
        debug!(
            id = request.id,
            tier,
            waited_ms = waited.as_millis() as u64,
            bumps = request.aging_bumps,
            "request selected"
        );
        Some((request, preempt))
    }

    /// Smallest deadline slack across all tiers, if below the threshold.
    fn pick_urgent(&self, inner: &SchedulerInner, now: Instant) -> Option<(usize, usize)> {
        let mut best: Option<(Duration, usize, usize)> = None;
        for (tier, queue) in inner.tiers.iter().enumerate() {
            for (pos, request) in queue.iter().enumerate() {
                let Some(deadline) = request.deadline else { continue };
                let slack = deadline.saturating_duration_since(now);
                if best.is_none_or(|(s, _, _)| slack < s) {
                    best = Some((slack, tier, pos));
                }
            }
        }
        match best {
            Some((slack, tier, pos)) if slack < self.config.policy.urgency_threshold => {
                Some((tier, pos))
            }
            _ => None,
        }
    }

    /// With probability `fairness_weight`, the oldest request in the two
    /// lowest tiers.
    fn pick_fair(&self, inner: &SchedulerInner) -> Option<(usize, usize)> {
        let weight = self.config.policy.fairness_weight.clamp(0.0, 1.0);
        if weight == 0.0 || rand::thread_rng().gen_range(0.0..1.0) >= weight {
            return None;
        }
        let mut oldest: Option<(Instant, usize, usize)> = None;
        for tier in [Priority::TIERS - 2, Priority::TIERS - 1] {
            for (pos, request) in inner.tiers[tier].iter().enumerate() {
                if oldest.is_none_or(|(t, _, _)| request.queued_at < t) {
                    oldest = Some((request.queued_at, tier, pos));
                }
            }
        }
        oldest.map(|(_, tier, pos)| (tier, pos))
    }

    /// First non-empty tier; FIFO, or the smallest estimate under SJF.
    fn pick_by_tier(&self, inner: &SchedulerInner) -> Option<(usize, usize)> {
        for (tier, queue) in inner.tiers.iter().enumerate() {
            if queue.is_empty() {
                continue;
            }
            let pos = if self.config.policy.shortest_job_first {
                queue
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, r)| r.estimated_tokens)
                    .map(|(pos, _)| pos)
                    .unwrap_or(0)
            } else {
                0
            };
            return Some((tier, pos));
        }
        None
    }

    // ── Aging ────────────────────────────────────────────────────────────────

    async fn aging_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.policy.aging_interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.promote_aged(Instant::now()) > 0 {
                        self.wakeup.notify_one();
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Promote every request whose wait exceeds
    /// `aging_interval * (aging_bumps + 1)`. Returns promotions performed.
    fn promote_aged(&self, now: Instant) -> usize {
        let interval = self.config.policy.aging_interval;
        let mut promoted = 0;
        let mut inner = self.inner.lock().expect("scheduler mutex poisoned");
        for tier in 1..Priority::TIERS {
            let mut pos = 0;
            while pos < inner.tiers[tier].len() {
                let request = &inner.tiers[tier][pos];
                let threshold = interval * (request.aging_bumps + 1);
                if now.duration_since(request.queued_at) > threshold {
                    let mut request = inner.tiers[tier].remove(pos).expect("position checked");
                    request.aging_bumps += 1;
                    trace!(id = request.id, from = tier, to = tier - 1, "request aged up");
                    inner.tiers[tier - 1].push_back(request);
                    promoted += 1;
                } else {
                    pos += 1;
                }
            }
        }
        promoted
    }
}
