//! Scripted stub worker farm for end-to-end tests.
//!
//! Each launched "worker" is an in-process task speaking the real wire
//! protocol over a duplex pipe. Behavior is scripted by the prompt text, so
//! tests stay reproducible:
//!
//! - `"hi"`: emit `TOKEN "A"`, `TOKEN "B"`, `STATS`, `EVENT completed`;
//! - `"pause"`: emit `TOKEN "A"`, then hold until cancelled (or 2 s); after
//!   the cancel, emit one more late token to prove the gateway drops it;
//! - `"silent"`: accept the request and emit nothing;
//! - `"invalid"`: emit a `stream.error` immediately;
//! - anything else: echo each whitespace-separated word as one token, then
//!   `STATS` and `DONE`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use strand_core::supervisor::{WorkerConnection, WorkerLauncher};
use strand_types::{EngineError, StreamId, WorkerId};
use strand_wire::message::methods;
use strand_wire::{encode_frame, FrameDecoder, RpcResponse, StreamFrame};

/// Shared record of everything the farm's workers observed.
#[derive(Clone, Default)]
pub struct StubLog {
    /// `(worker, batch size)` per accepted generate / batch_generate RPC.
    pub accepts: Arc<Mutex<Vec<(WorkerId, usize)>>>,
    /// Stream ids for which a cancel arrived (request or notification).
    pub cancels: Arc<Mutex<Vec<StreamId>>>,
}

impl StubLog {
    pub fn accept_count(&self) -> usize {
        self.accepts.lock().unwrap().len()
    }

    pub fn accepted_items(&self) -> usize {
        self.accepts.lock().unwrap().iter().map(|(_, n)| n).sum()
    }

    pub fn cancelled(&self, stream_id: StreamId) -> bool {
        self.cancels.lock().unwrap().contains(&stream_id)
    }
}

/// Launcher handing out scripted in-process workers.
pub struct StubFarm {
    pub log: StubLog,
    kills: Mutex<HashMap<WorkerId, watch::Sender<bool>>>,
}

impl StubFarm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            log: StubLog::default(),
            kills: Mutex::new(HashMap::new()),
        })
    }

    /// Sever a worker's pipe, as if its process died.
    pub fn kill(&self, worker_id: WorkerId) {
        if let Some(tx) = self.kills.lock().unwrap().get(&worker_id) {
            let _ = tx.send(true);
        }
    }
}

#[async_trait]
impl WorkerLauncher for StubFarm {
    async fn launch(&self, worker_id: WorkerId) -> Result<WorkerConnection, EngineError> {
        let (gateway_io, worker_io) = tokio::io::duplex(256 * 1024);
        let (kill_tx, kill_rx) = watch::channel(false);
        self.kills.lock().unwrap().insert(worker_id, kill_tx);
        tokio::spawn(run_worker(worker_id, worker_io, self.log.clone(), kill_rx));
        let (reader, writer) = tokio::io::split(gateway_io);
        Ok(WorkerConnection {
            pid: None,
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: None,
        })
    }
}

struct WorkerState {
    log: StubLog,
    worker_id: WorkerId,
    out: mpsc::Sender<Vec<u8>>,
    /// Per-stream cancel signals for paused streams.
    cancel_signals: Arc<Mutex<HashMap<StreamId, watch::Sender<bool>>>>,
}

async fn run_worker(
    worker_id: WorkerId,
    io: tokio::io::DuplexStream,
    log: StubLog,
    mut kill_rx: watch::Receiver<bool>,
) {
    let (mut reader, mut writer) = tokio::io::split(io);
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);

    let writer_task = tokio::spawn(async move {
        while let Some(payload) = out_rx.recv().await {
            if writer.write_all(&encode_frame(&payload)).await.is_err() {
                return;
            }
        }
    });

    let state = Arc::new(WorkerState {
        log,
        worker_id,
        out: out_tx,
        cancel_signals: Arc::new(Mutex::new(HashMap::new())),
    });

    let mut frames = FrameDecoder::new(1 << 20);
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
            _ = kill_rx.changed() => {
                if *kill_rx.borrow() {
                    break;
                }
                continue;
            }
        };
        frames.push(&buf[..n]);
        while let Ok(Some(payload)) = frames.try_next() {
            let Ok(raw) = serde_json::from_slice::<serde_json::Value>(&payload) else {
                continue;
            };
            handle_message(&state, raw).await;
        }
    }
    writer_task.abort();
}

async fn handle_message(state: &Arc<WorkerState>, raw: serde_json::Value) {
    let id = raw.get("id").and_then(|v| v.as_u64());
    let Some(method) = raw.get("method").and_then(|v| v.as_str()) else {
        return;
    };
    let params = raw.get("params").cloned().unwrap_or(serde_json::json!({}));

    let result = match method {
        methods::RUNTIME_INFO => serde_json::json!({ "capabilities": [] }),
        methods::WORKER_METRICS => {
            serde_json::json!({ "active_requests": 0, "total_requests": 1 })
        }
        methods::LOAD_MODEL => serde_json::json!({
            "model_id": params.get("model_id").cloned().unwrap_or_default(),
            "state": "loaded",
            "context_length": 8192,
            "dtype": "f16",
        }),
        methods::UNLOAD_MODEL => serde_json::json!({ "ok": true }),
        methods::GENERATE => {
            state.log.accepts.lock().unwrap().push((state.worker_id, 1));
            start_stream(state, &params);
            serde_json::json!({ "accepted": true })
        }
        methods::BATCH_GENERATE => {
            let requests = params
                .get("requests")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            state
                .log
                .accepts
                .lock()
                .unwrap()
                .push((state.worker_id, requests.len()));
            for request in &requests {
                start_stream(state, request);
            }
            serde_json::json!({ "accepted": requests.len() })
        }
        methods::CANCEL => {
            if let Some(stream_id) = parse_stream_id(&params) {
                state.log.cancels.lock().unwrap().push(stream_id);
                if let Some(tx) = state.cancel_signals.lock().unwrap().get(&stream_id) {
                    let _ = tx.send(true);
                }
            }
            serde_json::json!({ "ok": true })
        }
        _ => serde_json::json!({ "ok": true }),
    };

    // Notifications (no id) get no response.
    if let Some(id) = id {
        let response = RpcResponse {
            id,
            result: Some(result),
            error: None,
        };
        let _ = state.out.send(serde_json::to_vec(&response).unwrap()).await;
    }
}

fn parse_stream_id(params: &serde_json::Value) -> Option<StreamId> {
    serde_json::from_value(params.get("stream_id")?.clone()).ok()
}

fn start_stream(state: &Arc<WorkerState>, params: &serde_json::Value) {
    let Some(stream_id) = parse_stream_id(params) else {
        return;
    };
    let prompt = params
        .get("prompt")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_owned();
    let state = Arc::clone(state);
    tokio::spawn(async move {
        run_script(&state, stream_id, &prompt).await;
    });
}

async fn send_frame(state: &WorkerState, frame: &StreamFrame) {
    let _ = state.out.send(serde_json::to_vec(frame).unwrap()).await;
}

fn token(stream_id: StreamId, text: &str) -> StreamFrame {
    StreamFrame::Token(strand_wire::TokenPayload {
        stream_id,
        token: text.to_owned(),
        token_id: None,
        logprob: None,
        cumulative_text: None,
        is_final: None,
        tokens: None,
    })
}

fn stats(stream_id: StreamId, tokens: u64) -> StreamFrame {
    StreamFrame::Stats(strand_types::GenerationStats {
        stream_id,
        tokens_generated: tokens,
        tokens_per_second: 4.0,
        time_to_first_token: 0.1,
        total_time: 0.5,
    })
}

fn completed(stream_id: StreamId) -> StreamFrame {
    StreamFrame::Event(strand_wire::StreamEventPayload {
        stream_id,
        event: strand_wire::StreamEventKind::Completed,
    })
}

async fn run_script(state: &WorkerState, stream_id: StreamId, prompt: &str) {
    match prompt {
        "hi" => {
            send_frame(state, &token(stream_id, "A")).await;
            send_frame(state, &token(stream_id, "B")).await;
            send_frame(state, &stats(stream_id, 2)).await;
            send_frame(state, &completed(stream_id)).await;
        }
        "pause" => {
            send_frame(state, &token(stream_id, "A")).await;
            let (cancel_tx, mut cancel_rx) = watch::channel(false);
            state
                .cancel_signals
                .lock()
                .unwrap()
                .insert(stream_id, cancel_tx);
            let _ = tokio::time::timeout(Duration::from_secs(2), cancel_rx.changed()).await;
            // Late message after the gateway already closed the stream; it
            // must be dropped silently on the other side.
            tokio::time::sleep(Duration::from_millis(10)).await;
            send_frame(state, &token(stream_id, "B")).await;
        }
        "silent" => {}
        "invalid" => {
            send_frame(
                state,
                &StreamFrame::Error(strand_wire::StreamErrorPayload {
                    stream_id,
                    message: "invalid argument: unsupported sampling combination".into(),
                }),
            )
            .await;
        }
        other => {
            let mut count = 0u64;
            for word in other.split_whitespace() {
                send_frame(state, &token(stream_id, word)).await;
                count += 1;
            }
            send_frame(state, &stats(stream_id, count)).await;
            send_frame(
                state,
                &StreamFrame::Done(strand_wire::StreamRef { stream_id }),
            )
            .await;
        }
    }
}
