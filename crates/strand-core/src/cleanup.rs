//! Deterministic, event-driven cleanup of closed streams.
//!
//! Closure events enter a queue kept sorted by close time. A monotonic cursor
//! walks the queue; an index that has been processed is never revisited. The
//! sweep runs on a fixed interval and only touches events that have been
//! closed for at least the configured stale lifetime, so late wire messages
//! for a closed stream still find its registry entry and are dropped there
//! rather than resurrecting state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, warn};

use strand_types::{EngineError, StreamCloseReason, StreamId};

/// One stream-closure record awaiting cleanup.
#[derive(Debug, Clone)]
pub struct StreamCleanupEvent {
    pub stream_id: StreamId,
    pub closed_at: Instant,
    pub reason: StreamCloseReason,
}

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// How often the sweep runs.
    pub sweep_interval: Duration,
    /// Minimum age of a closure before its resources are reclaimed.
    pub max_stale_lifetime: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_millis(500),
            max_stale_lifetime: Duration::from_secs(5),
        }
    }
}

/// Invoked once per processed event. Errors are logged and do not halt the
/// sweep.
pub type CleanupHandler =
    Arc<dyn Fn(&StreamCleanupEvent) -> Result<(), EngineError> + Send + Sync>;

#[derive(Debug, Default)]
struct CleanupQueue {
    events: Vec<StreamCleanupEvent>,
    /// Next index to process. Monotone between compactions; compaction drops
    /// exactly the processed prefix.
    cursor: usize,
}

/// Counters exposed through the engine stats surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CleanupStats {
    pub pending: usize,
    pub processed: u64,
    pub lagged: u64,
}

pub struct CleanupScheduler {
    config: CleanupConfig,
    queue: Mutex<CleanupQueue>,
    handler: Mutex<Option<CleanupHandler>>,
    processed: AtomicU64,
    lagged: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for CleanupScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupScheduler")
            .field("stats", &self.stats())
            .finish()
    }
}

impl CleanupScheduler {
    pub fn new(config: CleanupConfig) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            queue: Mutex::new(CleanupQueue::default()),
            handler: Mutex::new(None),
            processed: AtomicU64::new(0),
            lagged: AtomicU64::new(0),
            shutdown_tx,
        })
    }

    /// Install the handler invoked for each processed event. Replaces any
    /// previous handler.
    pub fn set_handler(&self, handler: CleanupHandler) {
        *self.handler.lock().expect("handler mutex poisoned") = Some(handler);
    }

    /// Enqueue a closure event, keeping the queue sorted by `closed_at`.
    ///
    /// The common case (newest closure) is a constant-time append; an
    /// out-of-order arrival pays a linear insert.
    pub fn schedule(&self, event: StreamCleanupEvent) {
        let mut queue = self.queue.lock().expect("cleanup queue poisoned");
        let pos = queue
            .events
            .partition_point(|e| e.closed_at <= event.closed_at);
        // Never insert into the processed prefix; the cursor does not move
        // backwards.
        let pos = pos.max(queue.cursor);
        if pos == queue.events.len() {
            queue.events.push(event);
        } else {
            queue.events.insert(pos, event);
        }
    }

    /// Process every event that has been closed for at least the stale
    /// lifetime, as of `now`. Returns the number processed.
    pub fn sweep(&self, now: Instant) -> usize {
        let handler = self.handler.lock().expect("handler mutex poisoned").clone();
        let lag_threshold = self.config.max_stale_lifetime * 2;
        let mut swept = 0;

        loop {
            // Pop one eligible event per lock acquisition so a slow handler
            // never blocks `schedule` for the whole sweep.
            let event = {
                let mut queue = self.queue.lock().expect("cleanup queue poisoned");
                let Some(event) = queue.events.get(queue.cursor) else {
                    Self::compact(&mut queue);
                    break;
                };
                if now < event.closed_at + self.config.max_stale_lifetime {
                    Self::compact(&mut queue);
                    break;
                }
                let event = event.clone();
                queue.cursor += 1;
                event
            };

            let age = now.duration_since(event.closed_at);
            if age > lag_threshold {
                self.lagged.fetch_add(1, Ordering::Relaxed);
                warn!(
                    stream_id = %event.stream_id,
                    age_ms = age.as_millis() as u64,
                    "cleanup lagging behind stream closures"
                );
            }

            if let Some(handler) = &handler {
                if let Err(e) = handler(&event) {
                    warn!(stream_id = %event.stream_id, error = %e, "cleanup handler failed");
                }
            }
            self.processed.fetch_add(1, Ordering::Relaxed);
            swept += 1;
            debug!(stream_id = %event.stream_id, reason = %event.reason, "stream cleaned up");
        }

        swept
    }

    /// Drop the processed prefix once it dominates the queue.
    fn compact(queue: &mut CleanupQueue) {
        if queue.cursor > queue.events.len() / 2 {
            queue.events.drain(..queue.cursor);
            queue.cursor = 0;
        }
    }

    pub fn stats(&self) -> CleanupStats {
        let queue = self.queue.lock().expect("cleanup queue poisoned");
        CleanupStats {
            pending: queue.events.len() - queue.cursor,
            processed: self.processed.load(Ordering::Relaxed),
            lagged: self.lagged.load(Ordering::Relaxed),
        }
    }

    /// Run the periodic sweep until [`Self::shutdown`] is called.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.sweep(Instant::now());
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
