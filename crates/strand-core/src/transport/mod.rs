//! Framed RPC transport to one runtime worker.
//!
//! One transport owns one bidirectional byte pipe. Outbound traffic is
//! requests (matched to responses by a monotonically unique id) and one-way
//! notifications; inbound traffic is responses plus server-pushed stream
//! messages, which are demultiplexed into [`TransportEvent`]s for the stream
//! registry.
//!
//! Lifecycle: `Connecting → Ready → Draining → Closed` (a transport is born
//! `Connecting` and never returns to an earlier state). While draining, new
//! requests fail fast and in-flight ones run to completion or deadline. When
//! the pipe closes, every outstanding request rejects with a transport error
//! and a final [`TransportEvent::Closed`] is emitted so stream owners can be
//! failed.

pub mod retry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use strand_types::{EngineError, GenerationStats, StreamChunk, StreamId};
use strand_wire::message::{notifications, StreamRef};
use strand_wire::{
    encode_frame, Inbound, MessageDecoder, RpcNotification, RpcRequest, RpcResponse,
    StreamEventKind, StreamFrame,
};

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum frame payload accepted from the worker.
    pub max_frame_len: usize,
    /// Default deadline for [`RpcTransport::request`].
    pub request_timeout: Duration,
    /// Outbound write queue depth.
    pub write_queue: usize,
    /// Inbound stream-event queue depth (backpressures the pipe).
    pub event_queue: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_len: 16 * 1024 * 1024,
            request_timeout: Duration::from_secs(30),
            write_queue: 256,
            event_queue: 1024,
        }
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TransportState {
    Disconnected,
    Connecting,
    Ready,
    Draining,
    Closed,
}

/// Demultiplexed inbound traffic handed to the stream registry.
#[derive(Debug)]
pub enum TransportEvent {
    /// An ordered burst of one or more chunks for one stream.
    Chunks(Vec<StreamChunk>),
    Stats(GenerationStats),
    Started(StreamId),
    Completed(StreamId),
    Cancelled(StreamId),
    StreamError { stream_id: StreamId, message: String },
    Timeout(StreamId),
    /// The pipe closed; no further events will arrive on this transport.
    Closed,
}

/// Options for a single request.
#[derive(Debug, Default)]
pub struct RequestOptions {
    /// Overrides the transport's default deadline.
    pub timeout: Option<Duration>,
    /// Abort signal: when it flips to `true` the request rejects with
    /// `Cancelled` and a best-effort cancel notification is sent.
    pub cancel: Option<watch::Receiver<bool>>,
    /// Params for the best-effort cancel notification (typically
    /// `{ "stream_id": ... }`). Defaults to `{ "id": <request id> }`.
    pub cancel_params: Option<Value>,
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<Value, EngineError>>>>;

struct TransportShared {
    next_id: AtomicU64,
    pending: PendingMap,
    outbound_tx: mpsc::Sender<Bytes>,
    state_tx: watch::Sender<TransportState>,
    config: TransportConfig,
}

impl TransportShared {
    fn state(&self) -> TransportState {
        *self.state_tx.borrow()
    }

    fn transition(&self, next: TransportState) {
        self.state_tx.send_if_modified(|state| {
            // The lifecycle only moves forward.
            let forward = matches!(
                (*state, next),
                (TransportState::Connecting, TransportState::Ready)
                    | (TransportState::Connecting, TransportState::Closed)
                    | (TransportState::Connecting, TransportState::Draining)
                    | (TransportState::Ready, TransportState::Draining)
                    | (TransportState::Ready, TransportState::Closed)
                    | (TransportState::Draining, TransportState::Closed)
            );
            if forward {
                *state = next;
            }
            forward
        });
    }

    /// Reject every outstanding request with a transport failure.
    fn fail_all_pending(&self, message: &str) {
        let mut pending = self.pending.lock().expect("pending map poisoned");
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(EngineError::Transport {
                message: message.to_owned(),
            }));
        }
    }
}

/// Handle to one worker connection. Cheap to clone.
#[derive(Clone)]
pub struct RpcTransport {
    shared: Arc<TransportShared>,
}

impl std::fmt::Debug for RpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcTransport")
            .field("state", &self.state())
            .finish()
    }
}

impl RpcTransport {
    /// Take ownership of a byte pipe and start the reader/writer tasks.
    ///
    /// Returns the transport plus the receiver of demultiplexed stream
    /// events; the caller (the supervisor) pumps it into the registry. The
    /// transport starts in `Connecting`; the caller promotes it to `Ready`
    /// once the worker handshake succeeds.
    pub fn connect<R, W>(
        reader: R,
        writer: W,
        config: TransportConfig,
    ) -> (Self, mpsc::Receiver<TransportEvent>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(config.write_queue);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(config.event_queue);
        let (state_tx, _) = watch::channel(TransportState::Connecting);

        let shared = Arc::new(TransportShared {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound_tx,
            state_tx,
            config,
        });

        tokio::spawn(Self::write_loop(Arc::clone(&shared), writer, outbound_rx));
        tokio::spawn(Self::read_loop(Arc::clone(&shared), reader, event_tx));

        (Self { shared }, event_rx)
    }

    async fn write_loop<W>(
        shared: Arc<TransportShared>,
        mut writer: W,
        mut outbound_rx: mpsc::Receiver<Bytes>,
    ) where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                warn!(error = %e, "worker pipe write failed");
                shared.transition(TransportState::Closed);
                shared.fail_all_pending("worker pipe write failed");
                return;
            }
            let _ = writer.flush().await;
        }
        // Outbound channel dropped: orderly close.
        let _ = writer.shutdown().await;
    }

    async fn read_loop<R>(
        shared: Arc<TransportShared>,
        mut reader: R,
        event_tx: mpsc::Sender<TransportEvent>,
    ) where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut decoder = MessageDecoder::new(shared.config.max_frame_len);
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    decoder.finish();
                    break;
                }
                Ok(n) => {
                    let messages = match decoder.push(&buf[..n]) {
                        Ok(messages) => messages,
                        Err(e) => {
                            warn!(error = %e, "fatal framing error on worker pipe");
                            break;
                        }
                    };
                    for inbound in messages {
                        Self::dispatch_inbound(&shared, inbound, &event_tx).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "worker pipe read failed");
                    break;
                }
            }
        }
        shared.transition(TransportState::Closed);
        shared.fail_all_pending("worker pipe closed");
        let _ = event_tx.send(TransportEvent::Closed).await;
    }

    async fn dispatch_inbound(
        shared: &TransportShared,
        inbound: Inbound,
        event_tx: &mpsc::Sender<TransportEvent>,
    ) {
        match inbound {
            Inbound::Response(response) => Self::complete_request(shared, response),
            Inbound::Stream(frame) => {
                let event = match frame {
                    StreamFrame::Token(payload) => TransportEvent::Chunks(payload.expand()),
                    StreamFrame::Stats(stats) => TransportEvent::Stats(stats),
                    StreamFrame::Event(ev) => match ev.event {
                        StreamEventKind::Start => TransportEvent::Started(ev.stream_id),
                        StreamEventKind::Completed => TransportEvent::Completed(ev.stream_id),
                        StreamEventKind::Cancelled => TransportEvent::Cancelled(ev.stream_id),
                    },
                    StreamFrame::Done(r) => TransportEvent::Completed(r.stream_id),
                    StreamFrame::Error(e) => TransportEvent::StreamError {
                        stream_id: e.stream_id,
                        message: e.message,
                    },
                };
                let _ = event_tx.send(event).await;
            }
            Inbound::Notification(n) => {
                if let Some(event) = Self::notification_event(&n) {
                    let _ = event_tx.send(event).await;
                } else {
                    debug!(method = %n.method, "ignoring unknown worker notification");
                }
            }
        }
    }

    /// Map a JSON-envelope notification onto the same event set as the
    /// binary stream frames.
    fn notification_event(n: &RpcNotification) -> Option<TransportEvent> {
        match n.method.as_str() {
            notifications::STREAM_CHUNK => {
                let payload: strand_wire::TokenPayload =
                    serde_json::from_value(n.params.clone()).ok()?;
                Some(TransportEvent::Chunks(payload.expand()))
            }
            notifications::STREAM_STATS => {
                let stats: GenerationStats = serde_json::from_value(n.params.clone()).ok()?;
                Some(TransportEvent::Stats(stats))
            }
            notifications::STREAM_EVENT => {
                let ev: strand_wire::StreamEventPayload =
                    serde_json::from_value(n.params.clone()).ok()?;
                Some(match ev.event {
                    StreamEventKind::Start => TransportEvent::Started(ev.stream_id),
                    StreamEventKind::Completed => TransportEvent::Completed(ev.stream_id),
                    StreamEventKind::Cancelled => TransportEvent::Cancelled(ev.stream_id),
                })
            }
            notifications::STREAM_ERROR => {
                let e: strand_wire::StreamErrorPayload =
                    serde_json::from_value(n.params.clone()).ok()?;
                Some(TransportEvent::StreamError {
                    stream_id: e.stream_id,
                    message: e.message,
                })
            }
            notifications::STREAM_TIMEOUT => {
                let r: StreamRef = serde_json::from_value(n.params.clone()).ok()?;
                Some(TransportEvent::Timeout(r.stream_id))
            }
            _ => None,
        }
    }

    fn complete_request(shared: &TransportShared, response: RpcResponse) {
        let tx = shared
            .pending
            .lock()
            .expect("pending map poisoned")
            .remove(&response.id);
        match tx {
            Some(tx) => {
                let _ = tx.send(response.into_result());
            }
            None => debug!(id = response.id, "response for unknown or abandoned request"),
        }
    }

    pub fn state(&self) -> TransportState {
        self.shared.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.shared.state_tx.subscribe()
    }

    /// Promote `Connecting → Ready` once the handshake has succeeded.
    pub fn mark_ready(&self) {
        self.shared.transition(TransportState::Ready);
    }

    /// Stop accepting new requests; in-flight requests continue.
    pub fn drain(&self) {
        self.shared.transition(TransportState::Draining);
    }

    /// Close the pipe. All outstanding requests reject.
    pub fn close(&self) {
        self.shared.transition(TransportState::Closed);
        self.shared.fail_all_pending("transport closed");
    }

    fn check_sendable(&self) -> Result<(), EngineError> {
        match self.state() {
            TransportState::Ready | TransportState::Connecting => Ok(()),
            TransportState::Draining => Err(EngineError::PreconditionFailed {
                message: "worker connection is draining".into(),
            }),
            TransportState::Closed | TransportState::Disconnected => {
                Err(EngineError::WorkerUnavailable)
            }
        }
    }

    fn send_frame(&self, payload: &[u8]) -> Result<(), EngineError> {
        self.shared
            .outbound_tx
            .try_send(encode_frame(payload))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => EngineError::ResourceExhausted {
                    what: "worker write queue".into(),
                },
                mpsc::error::TrySendError::Closed(_) => EngineError::WorkerUnavailable,
            })
    }

    /// Send a one-way notification.
    pub fn notify(&self, method: &str, params: Value) -> Result<(), EngineError> {
        self.check_sendable()?;
        let frame = serde_json::to_vec(&RpcNotification {
            method: method.to_owned(),
            params,
        })
        .map_err(|_| EngineError::Internal)?;
        self.send_frame(&frame)
    }

    /// Issue a request and await its response.
    ///
    /// At-most-once from the caller's perspective: the id is unique, the
    /// response is matched by id, and a timeout or abort rejects locally
    /// while sending a best-effort cancel notification to the worker.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        opts: RequestOptions,
    ) -> Result<Value, EngineError> {
        self.check_sendable()?;

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .expect("pending map poisoned")
            .insert(id, reply_tx);

        let frame = serde_json::to_vec(&RpcRequest {
            id,
            method: method.to_owned(),
            params,
        })
        .map_err(|_| EngineError::Internal);
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                self.abandon(id);
                return Err(e);
            }
        };
        if let Err(e) = self.send_frame(&frame) {
            self.abandon(id);
            return Err(e);
        }

        let deadline = opts.timeout.unwrap_or(self.shared.config.request_timeout);
        let cancel_params = opts
            .cancel_params
            .unwrap_or_else(|| serde_json::json!({ "id": id }));

        let mut cancel = opts.cancel;
        let cancelled = async {
            match cancel.as_mut() {
                Some(rx) => {
                    // Already-aborted signals short-circuit immediately.
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
            reply = reply_rx => match reply {
                Ok(result) => result,
                Err(_) => Err(EngineError::Transport {
                    message: "worker connection lost".into(),
                }),
            },
            _ = tokio::time::sleep(deadline) => {
                self.abandon(id);
                let _ = self.notify(strand_wire::message::methods::CANCEL, cancel_params);
                Err(EngineError::Timeout)
            }
            _ = cancelled => {
                self.abandon(id);
                let _ = self.notify(strand_wire::message::methods::CANCEL, cancel_params);
                Err(EngineError::Cancelled)
            }
        }
    }

    fn abandon(&self, id: u64) {
        self.shared
            .pending
            .lock()
            .expect("pending map poisoned")
            .remove(&id);
    }

    /// Number of requests awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.shared.pending.lock().expect("pending map poisoned").len()
    }
}
