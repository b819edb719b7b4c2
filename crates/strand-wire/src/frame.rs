use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::warn;

use crate::message::Inbound;

/// Length of the big-endian frame-size prefix.
const PREFIX_LEN: usize = 4;

/// Fatal framing failures. Once one is returned the decode session is dead;
/// further input is rejected with the same error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameDecodeError {
    /// A frame advertised a payload larger than the configured maximum.
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },
}

/// Resettable decode counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Total bytes consumed from the wire, prefixes included.
    pub bytes_decoded: u64,
    /// Frames whose payload parsed into a typed message.
    pub messages_decoded: u64,
}

/// Incremental length-prefixed frame decoder.
///
/// Input arrives as byte chunks of arbitrary size; a chunk may split a frame
/// anywhere, including inside the 4-byte prefix, and may carry many frames.
/// The decoder buffers partial input and yields complete payloads in order.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: usize,
    stats: DecodeStats,
    /// Set after a fatal error; the session cannot recover.
    dead: Option<FrameDecodeError>,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_len,
            stats: DecodeStats::default(),
            dead: None,
        }
    }

    /// Append a chunk of bytes from the wire.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame payload, if one is buffered.
    ///
    /// Returns `Ok(None)` when more input is needed. A zero-length prefix
    /// yields an empty payload. An oversize prefix is fatal.
    pub fn try_next(&mut self) -> Result<Option<Bytes>, FrameDecodeError> {
        if let Some(err) = &self.dead {
            return Err(err.clone());
        }
        if self.buf.len() < PREFIX_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_frame_len {
            let err = FrameDecodeError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            };
            self.dead = Some(err.clone());
            return Err(err);
        }
        if self.buf.len() < PREFIX_LEN + len {
            return Ok(None);
        }
        self.buf.advance(PREFIX_LEN);
        let payload = self.buf.split_to(len).freeze();
        self.stats.bytes_decoded += (PREFIX_LEN + len) as u64;
        Ok(Some(payload))
    }

    /// Signal end-of-stream. Any buffered residue is discarded with a
    /// warning; returns the number of discarded bytes.
    pub fn finish(&mut self) -> usize {
        let residue = self.buf.len();
        if residue > 0 {
            warn!(residue, "discarding trailing bytes at end of frame stream");
            self.buf.clear();
        }
        residue
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = DecodeStats::default();
    }

    fn note_message(&mut self) {
        self.stats.messages_decoded += 1;
    }
}

/// Typed layer over [`FrameDecoder`]: parses each payload into an [`Inbound`]
/// message.
///
/// A payload that fails to parse is logged and skipped; decoding continues
/// with the next frame. Only framing-level failures are fatal.
#[derive(Debug)]
pub struct MessageDecoder {
    frames: FrameDecoder,
}

impl MessageDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            frames: FrameDecoder::new(max_frame_len),
        }
    }

    /// Feed a chunk and drain every message it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Inbound>, FrameDecodeError> {
        self.frames.push(chunk);
        let mut out = Vec::new();
        while let Some(payload) = self.frames.try_next()? {
            match Inbound::decode(&payload) {
                Ok(msg) => {
                    self.frames.note_message();
                    out.push(msg);
                }
                Err(e) => {
                    warn!(
                        payload_len = payload.len(),
                        error = %e,
                        "skipping malformed frame payload"
                    );
                }
            }
        }
        Ok(out)
    }

    /// End-of-stream; discards any residue (warned) and reports its size.
    pub fn finish(&mut self) -> usize {
        self.frames.finish()
    }

    pub fn stats(&self) -> DecodeStats {
        self.frames.stats()
    }

    pub fn reset_stats(&mut self) {
        self.frames.reset_stats();
    }
}

/// Encode one payload into a length-prefixed frame.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PREFIX_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}
