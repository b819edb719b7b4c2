use serde::{Deserialize, Serialize};
use serde_json::Value;

use strand_types::{EngineError, ErrorBody, GenerationStats, StreamChunk, StreamId};

/// RPC method names understood by the runtime worker.
pub mod methods {
    pub const LOAD_MODEL: &str = "load_model";
    pub const UNLOAD_MODEL: &str = "unload_model";
    pub const GENERATE: &str = "generate";
    pub const BATCH_GENERATE: &str = "batch_generate";
    pub const CANCEL: &str = "cancel";
    pub const RUNTIME_INFO: &str = "runtime/info";
    pub const WORKER_METRICS: &str = "get_worker_metrics";
}

/// Notification method names the worker may send as JSON envelopes.
pub mod notifications {
    pub const STREAM_CHUNK: &str = "stream.chunk";
    pub const STREAM_STATS: &str = "stream.stats";
    pub const STREAM_EVENT: &str = "stream.event";
    pub const STREAM_ERROR: &str = "stream.error";
    pub const STREAM_TIMEOUT: &str = "stream.timeout";
}

// ── RPC envelopes ─────────────────────────────────────────────────────────────

/// Outbound request; `id` is unique per transport connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

/// Outbound one-way notification (no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcNotification {
    pub method: String,
    pub params: Value,
}

/// Inbound response, matched to a request by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl RpcResponse {
    /// Fold the result/error pair into a `Result`.
    pub fn into_result(self) -> Result<Value, EngineError> {
        match (self.result, self.error) {
            (_, Some(body)) => Err(EngineError::from_body(body)),
            (Some(v), None) => Ok(v),
            (None, None) => Ok(Value::Null),
        }
    }
}

// ── Stream frames ─────────────────────────────────────────────────────────────

/// A single token message, possibly carrying a batched burst.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    pub stream_id: StreamId,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprob: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumulative_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_final: Option<bool>,
    /// When present, the message carries an ordered burst of tokens and the
    /// effective batch size is `tokens.len()`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<Vec<WireBatchToken>>,
}

/// One element of a batched token burst.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireBatchToken {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<u32>,
}

impl TokenPayload {
    /// Expand into the ordered chunk burst this message represents.
    ///
    /// A message with a `tokens` array yields one chunk per element, in array
    /// order; otherwise it yields a single chunk.
    pub fn expand(self) -> Vec<StreamChunk> {
        let stream_id = self.stream_id;
        match self.tokens {
            Some(batch) => batch
                .into_iter()
                .map(|t| StreamChunk {
                    stream_id,
                    token: t.token,
                    token_id: t.token_id,
                    logprob: None,
                    cumulative_text: None,
                    is_final: None,
                })
                .collect(),
            None => vec![StreamChunk {
                stream_id,
                token: self.token,
                token_id: self.token_id,
                logprob: self.logprob,
                cumulative_text: self.cumulative_text,
                is_final: self.is_final,
            }],
        }
    }
}

/// Lifecycle markers the worker reports on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    Start,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEventPayload {
    pub stream_id: StreamId,
    pub event: StreamEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamErrorPayload {
    pub stream_id: StreamId,
    pub message: String,
}

/// Payload shapes that only reference a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRef {
    pub stream_id: StreamId,
}

/// A stream message on the binary channel, discriminated by `t`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", content = "p")]
pub enum StreamFrame {
    #[serde(rename = "TOKEN")]
    Token(TokenPayload),
    #[serde(rename = "STATS")]
    Stats(GenerationStats),
    #[serde(rename = "EVENT")]
    Event(StreamEventPayload),
    #[serde(rename = "DONE")]
    Done(StreamRef),
    #[serde(rename = "ERROR")]
    Error(StreamErrorPayload),
}

impl StreamFrame {
    pub fn stream_id(&self) -> StreamId {
        match self {
            StreamFrame::Token(p) => p.stream_id,
            StreamFrame::Stats(p) => p.stream_id,
            StreamFrame::Event(p) => p.stream_id,
            StreamFrame::Done(p) => p.stream_id,
            StreamFrame::Error(p) => p.stream_id,
        }
    }
}

// ── Inbound demultiplexing ────────────────────────────────────────────────────

/// Any message a worker can send to the gateway.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Reply to an outstanding request.
    Response(RpcResponse),
    /// Binary-channel stream message.
    Stream(StreamFrame),
    /// JSON-envelope notification (e.g. `stream.timeout`).
    Notification(RpcNotification),
}

impl Inbound {
    /// Parse one frame payload. The shape is discriminated structurally:
    /// `t` marks a stream frame, `id` without `method` a response, and
    /// `method` without `id` a notification.
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_slice(payload)?;
        if value.get("t").is_some() {
            return serde_json::from_value::<StreamFrame>(value).map(Inbound::Stream);
        }
        if value.get("id").is_some() && value.get("method").is_none() {
            return serde_json::from_value::<RpcResponse>(value).map(Inbound::Response);
        }
        if value.get("method").is_some() {
            return serde_json::from_value::<RpcNotification>(value).map(Inbound::Notification);
        }
        Err(serde::de::Error::custom(
            "frame is neither a stream message, a response, nor a notification",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_frame_round_trip() {
        let id = StreamId::fresh();
        let frame = StreamFrame::Token(TokenPayload {
            stream_id: id,
            token: "Hi".into(),
            token_id: Some(7),
            logprob: Some(-0.2),
            cumulative_text: None,
            is_final: None,
            tokens: None,
        });
        let json = serde_json::to_vec(&frame).unwrap();
        match Inbound::decode(&json).unwrap() {
            Inbound::Stream(StreamFrame::Token(p)) => {
                assert_eq!(p.stream_id, id);
                assert_eq!(p.token, "Hi");
                assert_eq!(p.token_id, Some(7));
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn discriminator_field_names_match_protocol() {
        let id = StreamId::fresh();
        let frame = StreamFrame::Done(StreamRef { stream_id: id });
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["t"], "DONE");
        assert_eq!(v["p"]["stream_id"], serde_json::to_value(id).unwrap());
    }

    #[test]
    fn batched_token_payload_expands_in_order() {
        let id = StreamId::fresh();
        let payload = TokenPayload {
            stream_id: id,
            token: String::new(),
            token_id: None,
            logprob: None,
            cumulative_text: None,
            is_final: None,
            tokens: Some(vec![
                WireBatchToken { token: "a".into(), token_id: Some(1) },
                WireBatchToken { token: "b".into(), token_id: Some(2) },
                WireBatchToken { token: "c".into(), token_id: None },
            ]),
        };
        let chunks = payload.expand();
        assert_eq!(chunks.len(), 3);
        let texts: Vec<&str> = chunks.iter().map(|c| c.token.as_str()).collect();
        assert_eq!(texts, ["a", "b", "c"]);
        assert!(chunks.iter().all(|c| c.stream_id == id));
    }

    #[test]
    fn response_with_error_maps_to_engine_error() {
        let resp = RpcResponse {
            id: 9,
            result: None,
            error: Some(ErrorBody {
                code: strand_types::ErrorCode::InvalidArgument,
                message: "bad temperature".into(),
            }),
        };
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.code(), strand_types::ErrorCode::InvalidArgument);
    }

    #[test]
    fn notification_decodes_when_id_absent() {
        let id = StreamId::fresh();
        let json = serde_json::json!({
            "method": notifications::STREAM_TIMEOUT,
            "params": { "stream_id": id },
        });
        match Inbound::decode(&serde_json::to_vec(&json).unwrap()).unwrap() {
            Inbound::Notification(n) => assert_eq!(n.method, notifications::STREAM_TIMEOUT),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn event_kind_serializes_snake_case() {
        let v = serde_json::to_value(StreamEventKind::Completed).unwrap();
        assert_eq!(v, "completed");
    }
}
