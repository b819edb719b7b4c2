//! Per-tenant request budgets.
//!
//! Each tenant has a decaying usage counter: every admitted request adds one
//! unit, and the counter drains linearly back to zero over the configured
//! decay window. Two thresholds partition the counter range: below
//! `burst_limit` requests are admitted, from `burst_limit` up to `hard_limit`
//! they are queued, and at or above `hard_limit` they are rejected.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use strand_types::TenantId;

#[derive(Debug, Clone)]
pub struct TenantBudgetConfig {
    /// Counter value at which requests are rejected outright.
    pub hard_limit: u32,
    /// Counter value at which requests start queueing instead of admitting.
    /// Clamped to `hard_limit` when configured above it.
    pub burst_limit: u32,
    /// Window over which a full `hard_limit` of usage drains back to zero.
    pub decay: Duration,
}

impl Default for TenantBudgetConfig {
    fn default() -> Self {
        Self {
            hard_limit: 32,
            burst_limit: 24,
            decay: Duration::from_secs(10),
        }
    }
}

/// Verdict for one tenant charge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetVerdict {
    Admit,
    Queue,
    Reject,
}

#[derive(Debug)]
struct TenantUsage {
    count: f64,
    updated_at: Instant,
}

/// Usage ledger for all tenants.
#[derive(Debug)]
pub struct TenantLedger {
    config: TenantBudgetConfig,
    usage: HashMap<TenantId, TenantUsage>,
}

impl TenantLedger {
    pub fn new(mut config: TenantBudgetConfig) -> Self {
        if config.burst_limit > config.hard_limit {
            config.burst_limit = config.hard_limit;
        }
        Self {
            config,
            usage: HashMap::new(),
        }
    }

    /// Classify a request against `tenant`'s current budget as of `now`
    /// without charging anything. Safe to call any number of times while a
    /// request waits for a slot; only decay is applied.
    pub fn verdict(&mut self, tenant: &TenantId, now: Instant) -> BudgetVerdict {
        let config = self.config.clone();
        let entry = self.entry(tenant, now);
        Self::decay_in_place(entry, &config, now);
        Self::classify(entry.count, &config)
    }

    /// Charge one request against `tenant` as of `now` and return the
    /// verdict. Only an `Admit` verdict increments the counter; queued and
    /// rejected requests are not charged.
    pub fn charge(&mut self, tenant: &TenantId, now: Instant) -> BudgetVerdict {
        let config = self.config.clone();
        let entry = self.entry(tenant, now);
        Self::decay_in_place(entry, &config, now);
        let verdict = Self::classify(entry.count, &config);
        if verdict == BudgetVerdict::Admit {
            entry.count += 1.0;
        }
        verdict
    }

    fn entry(&mut self, tenant: &TenantId, now: Instant) -> &mut TenantUsage {
        self.usage.entry(tenant.clone()).or_insert(TenantUsage {
            count: 0.0,
            updated_at: now,
        })
    }

    fn classify(count: f64, config: &TenantBudgetConfig) -> BudgetVerdict {
        if count >= config.hard_limit as f64 {
            BudgetVerdict::Reject
        } else if count >= config.burst_limit as f64 {
            BudgetVerdict::Queue
        } else {
            BudgetVerdict::Admit
        }
    }

    /// Current decayed counter for a tenant.
    pub fn usage(&mut self, tenant: &TenantId, now: Instant) -> f64 {
        match self.usage.get_mut(tenant) {
            Some(entry) => {
                Self::decay_in_place(entry, &self.config, now);
                entry.count
            }
            None => 0.0,
        }
    }

    /// Drop tenants whose counters have fully drained.
    pub fn prune(&mut self, now: Instant) {
        let config = self.config.clone();
        self.usage.retain(|_, entry| {
            Self::decay_in_place(entry, &config, now);
            entry.count > 0.0
        });
    }

    pub fn tenant_count(&self) -> usize {
        self.usage.len()
    }

    fn decay_in_place(entry: &mut TenantUsage, config: &TenantBudgetConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(entry.updated_at);
        if elapsed.is_zero() {
            return;
        }
        let drain =
            elapsed.as_secs_f64() / config.decay.as_secs_f64() * config.hard_limit as f64;
        entry.count = (entry.count - drain).max(0.0);
        entry.updated_at = now;
    }
}
