//! Generate-call batching.
//!
//! Concurrent generate calls aimed at one worker coalesce into a single
//! `batch_generate` RPC when they arrive within the batching window. A batch
//! flushes when it reaches the size cap, when the window expires, or as soon
//! as an urgent-priority item lands in it. The enqueue future completes when
//! the worker has *accepted* the request; tokens still flow back through the
//! stream registry.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use strand_types::{EngineError, StreamId};
use strand_wire::message::methods;

use crate::transport::{RequestOptions, RpcTransport};

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush as soon as this many items are pending.
    pub max_batch: usize,
    /// Flush this long after the first item arrived.
    pub max_wait: Duration,
    /// Ingress queue depth; beyond it, enqueue suspends.
    pub queue_depth: usize,
    /// Deadline for the accept RPC.
    pub accept_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch: 4,
            max_wait: Duration::from_millis(10),
            queue_depth: 256,
            accept_timeout: Duration::from_secs(10),
        }
    }
}

/// One pending generate call.
pub struct BatchEntry {
    /// Wire-shape `generate` params (carries the stream id).
    pub params: Value,
    pub stream_id: StreamId,
    /// Urgent items flush their batch immediately.
    pub urgent: bool,
    /// Cancellation before flush removes the item with no side effect.
    pub cancel: watch::Receiver<bool>,
}

struct PendingItem {
    entry: BatchEntry,
    reply: oneshot::Sender<Result<(), EngineError>>,
}

/// Provides the transport to flush into; re-resolved per flush so a worker
/// restart transparently picks up the replacement connection.
pub type TransportSource = Arc<dyn Fn() -> Option<RpcTransport> + Send + Sync>;

/// Batches generate calls for one worker.
pub struct GenerateBatcher {
    tx: mpsc::Sender<PendingItem>,
}

impl std::fmt::Debug for GenerateBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerateBatcher").finish()
    }
}

impl GenerateBatcher {
    pub fn spawn(config: BatchConfig, transport_source: TransportSource) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_depth);
        tokio::spawn(run_batcher(config, transport_source, rx));
        Arc::new(Self { tx })
    }

    /// Hand a generate call to the batcher; resolves once the worker has
    /// accepted it (or with the failure that prevented acceptance).
    pub async fn enqueue(&self, entry: BatchEntry) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingItem {
                entry,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::PreconditionFailed {
                message: "batcher is shut down".into(),
            })?;
        reply_rx.await.map_err(|_| EngineError::Internal)?
    }
}

async fn run_batcher(
    config: BatchConfig,
    transport_source: TransportSource,
    mut rx: mpsc::Receiver<PendingItem>,
) {
    'accept: while let Some(first) = rx.recv().await {
        let mut batch = Vec::with_capacity(config.max_batch);
        let mut urgent = first.entry.urgent;
        batch.push(first);

        let window = tokio::time::sleep(config.max_wait);
        tokio::pin!(window);
        let mut closed = false;
        while batch.len() < config.max_batch && !urgent {
            tokio::select! {
                _ = &mut window => break,
                item = rx.recv() => match item {
                    Some(item) => {
                        urgent |= item.entry.urgent;
                        batch.push(item);
                    }
                    None => {
                        closed = true;
                        break;
                    }
                },
            }
        }

        flush(&config, &transport_source, batch).await;
        if closed {
            break 'accept;
        }
    }
    debug!("generate batcher stopped");
}

async fn flush(config: &BatchConfig, transport_source: &TransportSource, batch: Vec<PendingItem>) {
    // Drop items cancelled while they waited in the window.
    let mut live = Vec::with_capacity(batch.len());
    for item in batch {
        if *item.entry.cancel.borrow() {
            let _ = item.reply.send(Err(EngineError::Cancelled));
        } else {
            live.push(item);
        }
    }
    if live.is_empty() {
        return;
    }

    let Some(transport) = transport_source() else {
        for item in live {
            let _ = item.reply.send(Err(EngineError::WorkerUnavailable));
        }
        return;
    };

    let (method, params) = if live.len() == 1 {
        (methods::GENERATE, live[0].entry.params.clone())
    } else {
        let requests: Vec<Value> = live.iter().map(|i| i.entry.params.clone()).collect();
        (
            methods::BATCH_GENERATE,
            serde_json::json!({ "requests": requests }),
        )
    };

    debug!(items = live.len(), method, "flushing generate batch");
    let outcome = transport
        .request(
            method,
            params,
            RequestOptions {
                timeout: Some(config.accept_timeout),
                ..RequestOptions::default()
            },
        )
        .await;

    match outcome {
        Ok(_) => {
            for item in live {
                let _ = item.reply.send(Ok(()));
            }
        }
        Err(e) => {
            // Acceptance failed for the whole RPC (transport-level); item-
            // specific failures arrive as stream errors instead and do not
            // take this path.
            warn!(error = %e, "generate batch rejected");
            for item in live {
                let _ = item.reply.send(Err(e.clone()));
            }
        }
    }
}
