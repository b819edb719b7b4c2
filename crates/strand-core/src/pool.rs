//! Bounded pool of reusable per-generation chunk queues.
//!
//! Every generator owns exactly one pooled queue for its lifetime. Queues are
//! pre-allocated; when the pool is exhausted, callers receive `None` and must
//! surface `ResourceExhausted` instead of allocating on the side.
//!
//! Release discipline: a hand-out produces a [`PooledQueue`] whose `release`
//! consumes it, so a queue cannot be returned twice through the handle. A raw
//! double return (possible only by going around the handle) is detected at
//! the pool boundary, logged, and dropped. Producer/consumer access goes
//! through [`QueueHandle`]s that capture the queue's current incarnation at
//! hand-out time: a handle that outlives its hand-out sees a closed queue,
//! never the next occupant's data.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tracing::{error, warn};

use strand_types::GeneratorChunk;

/// The queue was closed while the operation was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

/// One incarnation of a pooled queue. Replaced wholesale on reset.
#[derive(Debug)]
struct QueueCore {
    items: Mutex<VecDeque<GeneratorChunk>>,
    /// Free slots; producers suspend on this when the queue is full.
    space: Semaphore,
    /// Filled slots; the consumer suspends on this when the queue is empty.
    ready: Semaphore,
    closed: AtomicBool,
}

impl QueueCore {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            space: Semaphore::new(capacity),
            ready: Semaphore::new(0),
            closed: AtomicBool::new(false),
        }
    }

    async fn push(&self, chunk: GeneratorChunk) -> Result<(), QueueClosed> {
        let permit = self.space.acquire().await.map_err(|_| QueueClosed)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueClosed);
        }
        permit.forget();
        self.items
            .lock()
            .expect("queue mutex poisoned")
            .push_back(chunk);
        self.ready.add_permits(1);
        Ok(())
    }

    async fn pop(&self) -> Option<GeneratorChunk> {
        match self.ready.acquire().await {
            Ok(permit) => {
                permit.forget();
                let item = self
                    .items
                    .lock()
                    .expect("queue mutex poisoned")
                    .pop_front();
                if item.is_some() {
                    self.space.add_permits(1);
                }
                item
            }
            // Closed: drain whatever is still buffered, then report the end.
            Err(_) => self.items.lock().expect("queue mutex poisoned").pop_front(),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.space.close();
        self.ready.close();
    }

    fn len(&self) -> usize {
        self.items.lock().expect("queue mutex poisoned").len()
    }
}

/// Producer/consumer access to one incarnation of a pooled queue.
///
/// Cloneable; the registry and the generator each hold one. All clones go
/// dead together when the queue is closed or released.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    core: Arc<QueueCore>,
}

impl QueueHandle {
    /// Append a chunk, suspending while the queue is full.
    pub async fn push(&self, chunk: GeneratorChunk) -> Result<(), QueueClosed> {
        self.core.push(chunk).await
    }

    /// Remove the oldest chunk, suspending while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn pop(&self) -> Option<GeneratorChunk> {
        self.core.pop().await
    }

    /// Close the queue: wake all suspended producers and the consumer.
    /// Idempotent. Buffered chunks stay poppable.
    pub fn close(&self) {
        self.core.close();
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The pooled object: a stable identity whose live core is swapped on reuse.
#[derive(Debug)]
struct PoolSlot {
    capacity: usize,
    core: Mutex<Arc<QueueCore>>,
}

impl PoolSlot {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            core: Mutex::new(Arc::new(QueueCore::new(capacity))),
        }
    }

    fn current(&self) -> Arc<QueueCore> {
        Arc::clone(&self.core.lock().expect("slot mutex poisoned"))
    }

    /// Retire the current incarnation and install a fresh one.
    fn reset(&self) {
        let fresh = Arc::new(QueueCore::new(self.capacity));
        let old = {
            let mut guard = self.core.lock().expect("slot mutex poisoned");
            std::mem::replace(&mut *guard, fresh)
        };
        // Wake anything still parked on the retired incarnation.
        old.close();
    }
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
}

struct PoolInner {
    idle: Vec<Arc<PoolSlot>>,
    total: usize,
}

/// Fixed-size pool of pre-allocated chunk queues.
pub struct QueuePool {
    inner: Mutex<PoolInner>,
}

impl std::fmt::Debug for QueuePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("QueuePool")
            .field("total", &stats.total)
            .field("idle", &stats.idle)
            .finish()
    }
}

impl QueuePool {
    /// Pre-allocate `size` queues of `queue_capacity` chunks each.
    pub fn new(size: usize, queue_capacity: usize) -> Arc<Self> {
        let idle = (0..size)
            .map(|_| Arc::new(PoolSlot::new(queue_capacity)))
            .collect();
        Arc::new(Self {
            inner: Mutex::new(PoolInner { idle, total: size }),
        })
    }

    /// Take an idle queue, or `None` when the pool is exhausted.
    pub fn acquire(self: &Arc<Self>) -> Option<PooledQueue> {
        let slot = self.inner.lock().expect("pool mutex poisoned").idle.pop()?;
        Some(PooledQueue {
            slot,
            pool: Arc::clone(self),
            released: false,
        })
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().expect("pool mutex poisoned");
        PoolStats {
            total: inner.total,
            idle: inner.idle.len(),
            in_use: inner.total - inner.idle.len(),
        }
    }

    /// Return a slot to the idle set, resetting it first.
    ///
    /// A slot that is already idle is a double release: programmer error,
    /// logged and dropped without touching the pool.
    fn restore(&self, slot: Arc<PoolSlot>) {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        if inner.idle.iter().any(|s| Arc::ptr_eq(s, &slot)) {
            error!("chunk queue released twice; ignoring the second release");
            return;
        }
        if inner.idle.len() >= inner.total {
            warn!("pool already full on release; dropping stray queue");
            return;
        }
        slot.reset();
        inner.idle.push(slot);
    }
}

/// Linear hand-out of one pooled queue.
///
/// `release` consumes the handle, so each hand-out can be returned at most
/// once. Dropping an unreleased handle returns the queue as a backstop.
pub struct PooledQueue {
    slot: Arc<PoolSlot>,
    pool: Arc<QueuePool>,
    released: bool,
}

impl std::fmt::Debug for PooledQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledQueue")
            .field("released", &self.released)
            .finish()
    }
}

impl PooledQueue {
    /// Handle onto the queue's current incarnation.
    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            core: self.slot.current(),
        }
    }

    /// Return the queue to the pool. Consumes the hand-out.
    pub fn release(mut self) {
        self.released = true;
        self.slot.current().close();
        self.pool.restore(Arc::clone(&self.slot));
    }
}

impl Drop for PooledQueue {
    fn drop(&mut self) {
        if !self.released {
            self.slot.current().close();
            self.pool.restore(Arc::clone(&self.slot));
        }
    }
}
