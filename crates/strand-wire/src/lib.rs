//! Wire protocol between the gateway and runtime workers.
//!
//! Frames are 4-byte big-endian length prefixes followed by a JSON payload.
//! Three payload shapes travel on the channel:
//!
//! - outbound RPC requests `{ "id": n, "method": "...", "params": {...} }`
//!   and one-way notifications `{ "method": "...", "params": {...} }`,
//! - inbound RPC responses `{ "id": n, "result": ... }` or
//!   `{ "id": n, "error": { "code": ..., "message": ... } }`,
//! - inbound stream messages `{ "t": "TOKEN" | "STATS" | "EVENT" | "DONE"
//!   | "ERROR", "p": {...} }`.
//!
//! [`frame::FrameDecoder`] handles the framing layer; [`message`] defines the
//! typed payloads and the inbound demultiplexer.

pub mod frame;
pub mod message;

pub use frame::{DecodeStats, FrameDecodeError, FrameDecoder, MessageDecoder, encode_frame};
pub use message::{
    Inbound, RpcNotification, RpcRequest, RpcResponse, StreamErrorPayload, StreamEventKind,
    StreamEventPayload, StreamFrame, StreamRef, TokenPayload, WireBatchToken,
};
