use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique identifier of one generation stream.
///
/// Minted once per registration and never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(Uuid);

impl StreamId {
    /// Mint a fresh, never-before-seen id.
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for StreamId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl From<Uuid> for StreamId {
    fn from(u: Uuid) -> Self {
        Self(u)
    }
}

/// One token emitted on a generation stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub stream_id: StreamId,
    /// The decoded token text.
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprob: Option<f64>,
    /// Full text generated so far, when the runtime chooses to send it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumulative_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_final: Option<bool>,
}

/// Per-generation throughput statistics reported by the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationStats {
    pub stream_id: StreamId,
    pub tokens_generated: u64,
    pub tokens_per_second: f64,
    /// Seconds from request acceptance to the first emitted token.
    pub time_to_first_token: f64,
    /// Seconds from request acceptance to completion.
    pub total_time: f64,
}

/// One item yielded by a generation iterator.
///
/// End of sequence is signalled by the iterator finishing, never by a
/// sentinel chunk.
#[derive(Debug, Clone)]
pub enum GeneratorChunk {
    /// One generated token.
    Token(StreamChunk),
    /// Throughput statistics; emitted at least once before completion.
    Metadata(GenerationStats),
    /// Stream-terminating error; the iterator finishes after yielding it.
    Error(crate::EngineError),
}

/// Why a stream left the `active` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StreamCloseReason {
    Completed,
    Errored,
    TimedOut,
    Cancelled,
}
