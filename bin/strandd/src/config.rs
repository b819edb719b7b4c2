//! Daemon configuration, loaded from environment variables at startup.

use std::time::Duration;

use strand_core::EngineConfig;

/// Runtime configuration for strandd.
///
/// Every field has a sensible default so the daemon starts with nothing but
/// `STRAND_WORKER_CMD` set.
#[derive(Debug, Clone)]
pub struct Config {
    /// Command line of the runtime worker process.
    pub worker_cmd: String,

    /// Extra arguments for the worker command, whitespace-separated.
    pub worker_args: Vec<String>,

    /// Number of worker processes to supervise.
    pub workers: usize,

    /// `tracing` filter string, e.g. `"info"` or `"debug,strand_core=trace"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Number of pre-allocated generator queues.
    pub pool_size: usize,

    /// Chunk capacity of each generator queue.
    pub queue_capacity: usize,

    /// Initial scheduler concurrency cap.
    pub max_concurrent: usize,

    /// Target time-to-first-token for the admission control loop.
    pub target_ttft: Duration,

    /// Sticky-session lifetime for the worker router.
    pub sticky_ttl: Duration,

    /// Default per-stream deadline; `0` disables it.
    pub stream_timeout: Duration,

    /// When `true`, admission control always admits (baseline mode).
    pub admission_bypass: bool,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            worker_cmd: env_or("STRAND_WORKER_CMD", "strand-runtime"),
            worker_args: std::env::var("STRAND_WORKER_ARGS")
                .map(|v| v.split_whitespace().map(str::to_owned).collect())
                .unwrap_or_default(),
            workers: parse_env("STRAND_WORKERS", 1),
            log_level: env_or("STRAND_LOG", "info"),
            log_json: std::env::var("STRAND_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            pool_size: parse_env("STRAND_QUEUE_POOL", 256),
            queue_capacity: parse_env("STRAND_QUEUE_CAPACITY", 64),
            max_concurrent: parse_env("STRAND_MAX_CONCURRENT", 64),
            target_ttft: Duration::from_millis(parse_env("STRAND_TARGET_TTFT_MS", 200)),
            sticky_ttl: Duration::from_millis(parse_env("STRAND_STICKY_TTL_MS", 60_000)),
            stream_timeout: Duration::from_millis(parse_env("STRAND_STREAM_TIMEOUT_MS", 300_000)),
            admission_bypass: std::env::var("STRAND_ADMISSION_BYPASS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    /// Project the daemon configuration onto the engine's.
    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = EngineConfig::default();
        engine.supervisor.workers = self.workers;
        engine.pool_size = self.pool_size;
        engine.queue_capacity = self.queue_capacity;
        engine.scheduler.max_concurrent = self.max_concurrent;
        engine.governor.pid.target_ttft = self.target_ttft.as_secs_f64();
        engine.governor.bypass = self.admission_bypass;
        engine.router.sticky_ttl = self.sticky_ttl;
        engine.default_stream_timeout = if self.stream_timeout.is_zero() {
            None
        } else {
            Some(self.stream_timeout)
        };
        engine
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
