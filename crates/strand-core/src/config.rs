//! Engine configuration.
//!
//! One aggregate struct wiring the per-component configs together. The
//! daemon binary builds it from environment variables; tests build it
//! directly with the defaults and override what they exercise.

use std::time::Duration;

use crate::admission::GovernorConfig;
use crate::batcher::BatchConfig;
use crate::cleanup::CleanupConfig;
use crate::router::RouterConfig;
use crate::scheduler::SchedulerConfig;
use crate::supervisor::SupervisorConfig;
use crate::transport::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub supervisor: SupervisorConfig,
    pub router: RouterConfig,
    pub scheduler: SchedulerConfig,
    pub governor: GovernorConfig,
    pub batch: BatchConfig,
    pub cleanup: CleanupConfig,
    pub retry: RetryPolicy,
    /// Number of pre-allocated generator queues.
    pub pool_size: usize,
    /// Chunk capacity of each generator queue.
    pub queue_capacity: usize,
    /// Stream deadline applied when a call supplies none. `None` disables
    /// the default timeout entirely.
    pub default_stream_timeout: Option<Duration>,
    /// Upper bound on how long an admission-queued request waits before it
    /// fails with a timeout.
    pub admission_wait: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            router: RouterConfig::default(),
            scheduler: SchedulerConfig::default(),
            governor: GovernorConfig::default(),
            batch: BatchConfig::default(),
            cleanup: CleanupConfig::default(),
            retry: RetryPolicy::default(),
            pool_size: 256,
            queue_capacity: 64,
            default_stream_timeout: Some(Duration::from_secs(300)),
            admission_wait: Duration::from_secs(10),
        }
    }
}
