//! Adaptive admission control.
//!
//! The governor decides, per new stream, whether to admit, queue, reject, or
//! recommend safe-mode. The concurrency limit adapts via a PID loop on
//! measured time-to-first-token ([`pid`]); per-tenant fairness comes from
//! decaying usage budgets ([`tenant`]).

pub mod pid;
pub mod tenant;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use strand_types::TenantId;

pub use pid::{PidConfig, PidController};
pub use tenant::{BudgetVerdict, TenantBudgetConfig, TenantLedger};

/// Recommendation returned for each admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AdmissionDecision {
    Admit,
    Queue,
    Reject,
    SafeMode,
}

#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub pid: PidConfig,
    /// Cadence of the control-loop tick.
    pub sample_interval: Duration,
    /// Consecutive overloaded ticks before safe-mode engages.
    pub safe_mode_threshold: u32,
    /// Consecutive healthy ticks before safe-mode releases.
    pub safe_mode_recovery: u32,
    /// When set, every request is admitted; sampling continues so the
    /// adaptive and bypassed configurations stay comparable.
    pub bypass: bool,
    pub tenant: TenantBudgetConfig,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            pid: PidConfig::default(),
            sample_interval: Duration::from_secs(1),
            safe_mode_threshold: 3,
            safe_mode_recovery: 5,
            bypass: false,
            tenant: TenantBudgetConfig::default(),
        }
    }
}

/// Observable governor state, for the stats surface.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct GovernorSnapshot {
    pub current_limit: usize,
    pub active: usize,
    pub safe_mode: bool,
    pub admitted_total: u64,
    pub queued_total: u64,
    pub rejected_total: u64,
    pub tenants_tracked: usize,
}

struct GovernorState {
    pid: PidController,
    current_limit: f64,
    active: usize,
    /// TTFT samples (seconds) gathered since the last tick.
    ttft_samples: VecDeque<f64>,
    last_tick: Option<Instant>,
    overload_streak: u32,
    healthy_streak: u32,
    safe_mode: bool,
    tenants: TenantLedger,
    admitted_total: u64,
    queued_total: u64,
    rejected_total: u64,
}

/// PID-governed admission control with per-tenant budgets.
pub struct AdmissionGovernor {
    config: GovernorConfig,
    state: Mutex<GovernorState>,
}

impl std::fmt::Debug for AdmissionGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGovernor")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl AdmissionGovernor {
    pub fn new(config: GovernorConfig) -> Arc<Self> {
        let state = GovernorState {
            pid: PidController::new(),
            current_limit: config.pid.base_limit,
            active: 0,
            ttft_samples: VecDeque::new(),
            last_tick: None,
            overload_streak: 0,
            healthy_streak: 0,
            safe_mode: false,
            tenants: TenantLedger::new(config.tenant.clone()),
            admitted_total: 0,
            queued_total: 0,
            rejected_total: 0,
        };
        Arc::new(Self {
            config,
            state: Mutex::new(state),
        })
    }

    /// Decide whether a new stream may start now.
    ///
    /// Only a terminal `Admit` mutates anything: it charges the tenant's
    /// budget and reserves one concurrency slot (paired with
    /// [`release`](Self::release) when the stream ends). Queue and reject
    /// outcomes are pure decisions, so a request polling for a free slot can
    /// call this repeatedly without eating through its budget. Callers
    /// account a request's queue/reject outcome once via
    /// [`note_queued`](Self::note_queued) / [`note_rejected`](Self::note_rejected).
    pub fn admit(&self, tenant: Option<&TenantId>) -> AdmissionDecision {
        let mut state = self.state.lock().expect("governor state poisoned");

        if self.config.bypass {
            state.active += 1;
            state.admitted_total += 1;
            return AdmissionDecision::Admit;
        }

        let now = Instant::now();
        if let Some(tenant) = tenant {
            match state.tenants.verdict(tenant, now) {
                BudgetVerdict::Reject => return AdmissionDecision::Reject,
                BudgetVerdict::Queue => return AdmissionDecision::Queue,
                BudgetVerdict::Admit => {}
            }
        }

        let limit = state.current_limit.floor().max(1.0) as usize;
        if state.active >= limit {
            return if state.safe_mode {
                AdmissionDecision::SafeMode
            } else {
                AdmissionDecision::Queue
            };
        }

        // Terminal admit: this is the only path that charges.
        if let Some(tenant) = tenant {
            state.tenants.charge(tenant, now);
        }
        state.active += 1;
        state.admitted_total += 1;
        AdmissionDecision::Admit
    }

    /// Release the slot reserved by an `Admit` decision.
    pub fn release(&self) {
        let mut state = self.state.lock().expect("governor state poisoned");
        // Clamped: a double release must not wrap the gauge.
        state.active = state.active.saturating_sub(1);
    }

    /// Record that one request entered the queued/safe-mode wait. Called
    /// once per request, not per poll.
    pub fn note_queued(&self) {
        let mut state = self.state.lock().expect("governor state poisoned");
        state.queued_total += 1;
    }

    /// Record that one request was turned away. Called once per request.
    pub fn note_rejected(&self) {
        let mut state = self.state.lock().expect("governor state poisoned");
        state.rejected_total += 1;
    }

    /// Record one measured time-to-first-token, in seconds.
    pub fn record_ttft(&self, seconds: f64) {
        if !seconds.is_finite() || seconds < 0.0 {
            return;
        }
        let mut state = self.state.lock().expect("governor state poisoned");
        state.ttft_samples.push_back(seconds);
        if state.ttft_samples.len() > 256 {
            state.ttft_samples.pop_front();
        }
    }

    /// One control-loop step as of `now`. Returns the concurrency limit in
    /// force after the step.
    pub fn tick(&self, now: Instant) -> usize {
        let mut state = self.state.lock().expect("governor state poisoned");
        let dt = match state.last_tick {
            Some(prev) => now.saturating_duration_since(prev).as_secs_f64(),
            None => self.config.sample_interval.as_secs_f64(),
        };
        state.last_tick = Some(now);

        let measured = if state.ttft_samples.is_empty() {
            None
        } else {
            let sum: f64 = state.ttft_samples.iter().sum();
            Some(sum / state.ttft_samples.len() as f64)
        };
        state.ttft_samples.clear();

        if let Some(measured) = measured {
            let mut pid = std::mem::take(&mut state.pid);
            if let Some(limit) = pid.update(&self.config.pid, measured, dt) {
                state.current_limit = limit;
            }
            state.pid = pid;
        }

        // Safe-mode bookkeeping: persistent overload forces the floor.
        let utilization = state.active as f64 / state.current_limit.max(1.0);
        let latency_overload =
            measured.is_some_and(|m| m > 2.0 * self.config.pid.target_ttft);
        if utilization > 1.0 || latency_overload {
            state.overload_streak += 1;
            state.healthy_streak = 0;
        } else {
            state.healthy_streak += 1;
            state.overload_streak = 0;
        }

        if !state.safe_mode && state.overload_streak >= self.config.safe_mode_threshold {
            state.safe_mode = true;
            warn!(
                active = state.active,
                limit = state.current_limit,
                "entering safe mode: persistent overload"
            );
        } else if state.safe_mode && state.healthy_streak >= self.config.safe_mode_recovery {
            state.safe_mode = false;
            info!("leaving safe mode");
        }

        if state.safe_mode {
            state.current_limit = self.config.pid.min_concurrent;
        }

        state.tenants.prune(Instant::now());
        state.current_limit.floor().max(1.0) as usize
    }

    pub fn current_limit(&self) -> usize {
        let state = self.state.lock().expect("governor state poisoned");
        state.current_limit.floor().max(1.0) as usize
    }

    pub fn is_safe_mode(&self) -> bool {
        self.state.lock().expect("governor state poisoned").safe_mode
    }

    pub fn snapshot(&self) -> GovernorSnapshot {
        let state = self.state.lock().expect("governor state poisoned");
        GovernorSnapshot {
            current_limit: state.current_limit.floor().max(1.0) as usize,
            active: state.active,
            safe_mode: state.safe_mode,
            admitted_total: state.admitted_total,
            queued_total: state.queued_total,
            rejected_total: state.rejected_total,
            tenants_tracked: state.tenants.tenant_count(),
        }
    }

    pub fn sample_interval(&self) -> Duration {
        self.config.sample_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(bypass: bool) -> Arc<AdmissionGovernor> {
        AdmissionGovernor::new(GovernorConfig {
            pid: PidConfig {
                base_limit: 4.0,
                min_concurrent: 1.0,
                max_concurrent: 8.0,
                target_ttft: 0.2,
                ..PidConfig::default()
            },
            bypass,
            tenant: TenantBudgetConfig {
                hard_limit: 3,
                burst_limit: 3,
                decay: Duration::from_secs(60),
            },
            ..GovernorConfig::default()
        })
    }

    #[test]
    fn admits_until_limit_then_queues() {
        let gov = governor(false);
        for _ in 0..4 {
            assert_eq!(gov.admit(None), AdmissionDecision::Admit);
        }
        assert_eq!(gov.admit(None), AdmissionDecision::Queue);
        gov.release();
        assert_eq!(gov.admit(None), AdmissionDecision::Admit);
    }

    #[test]
    fn tenant_budget_rejects_before_global_limit() {
        let gov = governor(false);
        let tenant: TenantId = "noisy".into();
        for _ in 0..3 {
            assert_eq!(gov.admit(Some(&tenant)), AdmissionDecision::Admit);
        }
        assert_eq!(gov.admit(Some(&tenant)), AdmissionDecision::Reject);
        // Another tenant is unaffected.
        assert_eq!(gov.admit(Some(&"quiet".into())), AdmissionDecision::Admit);
    }

    #[test]
    fn waiting_for_a_slot_does_not_consume_tenant_budget() {
        let gov = governor(false);
        // Fill the global limit with untenanted streams.
        for _ in 0..4 {
            assert_eq!(gov.admit(None), AdmissionDecision::Admit);
        }

        // A tenant request polling for a slot is queued every time, and its
        // budget (hard limit 3) stays untouched across the polls.
        let tenant: TenantId = "patient".into();
        for _ in 0..50 {
            assert_eq!(gov.admit(Some(&tenant)), AdmissionDecision::Queue);
        }

        for _ in 0..4 {
            gov.release();
        }
        for _ in 0..3 {
            assert_eq!(gov.admit(Some(&tenant)), AdmissionDecision::Admit);
        }
        assert_eq!(gov.admit(Some(&tenant)), AdmissionDecision::Reject);
    }

    #[test]
    fn queue_and_reject_counters_count_requests_not_polls() {
        let gov = governor(false);
        for _ in 0..4 {
            gov.admit(None);
        }
        // Polling admit() while the limit is full never bumps the counters;
        // the caller accounts each request's outcome exactly once.
        for _ in 0..10 {
            assert_eq!(gov.admit(None), AdmissionDecision::Queue);
        }
        assert_eq!(gov.snapshot().queued_total, 0);
        gov.note_queued();
        gov.note_rejected();
        let snapshot = gov.snapshot();
        assert_eq!(snapshot.queued_total, 1);
        assert_eq!(snapshot.rejected_total, 1);
    }

    #[test]
    fn bypass_always_admits_but_keeps_counting() {
        let gov = governor(true);
        for _ in 0..50 {
            assert_eq!(gov.admit(None), AdmissionDecision::Admit);
        }
        gov.record_ttft(0.4);
        let limit = gov.tick(Instant::now());
        assert!(limit >= 1);
        assert_eq!(gov.snapshot().admitted_total, 50);
    }

    #[test]
    fn sustained_slow_ttft_shrinks_the_limit() {
        let gov = governor(false);
        let mut now = Instant::now();
        let mut limits = Vec::new();
        for _ in 0..60 {
            gov.record_ttft(0.4);
            now += Duration::from_secs(1);
            limits.push(gov.tick(now));
        }
        assert!(
            limits.last().unwrap() < &4,
            "limit should fall below base, got {limits:?}"
        );
        for pair in limits.windows(2) {
            assert!(pair[1] <= pair[0], "limit must decrease monotonically");
        }
    }

    #[test]
    fn persistent_overload_forces_safe_mode_floor() {
        let gov = governor(false);
        let mut now = Instant::now();
        for _ in 0..10 {
            // TTFT far above 2x target on every tick.
            gov.record_ttft(2.0);
            now += Duration::from_secs(1);
            gov.tick(now);
        }
        assert!(gov.is_safe_mode());
        assert_eq!(gov.current_limit(), 1);

        // Healthy samples release safe mode after the recovery streak.
        for _ in 0..10 {
            gov.record_ttft(0.05);
            now += Duration::from_secs(1);
            gov.tick(now);
        }
        assert!(!gov.is_safe_mode());
    }

    #[test]
    fn release_never_underflows() {
        let gov = governor(false);
        gov.release();
        gov.release();
        assert_eq!(gov.snapshot().active, 0);
    }
}
