use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error code carried on the wire and surfaced to callers.
///
/// Codes are the contract; variant names of [`EngineError`] are not. A new
/// failure mode must map onto one of these codes (or `Internal`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    ResourceExhausted,
    PreconditionFailed,
    Timeout,
    Cancelled,
    WorkerUnavailable,
    WorkerFailed,
    Transport,
    GenerationError,
    Internal,
}

impl ErrorCode {
    /// Whether a request failing with this code may be retried by the
    /// transport retry helper. Closed set; everything else is final.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout | ErrorCode::WorkerUnavailable | ErrorCode::WorkerFailed
        )
    }
}

/// The `{ code, message }` error object as it travels on the wire.
///
/// `message` is user-visible: no paths, no internal symbols, no causes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// Errors produced by the gateway core.
///
/// The `Display` output of each variant is the user-visible message; detailed
/// causes go to the log, never into the error value.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A caller-supplied value failed validation.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The referenced model or stream does not exist.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// A stream id was registered twice.
    #[error("stream already registered: {stream_id}")]
    AlreadyRegistered { stream_id: crate::StreamId },

    /// A bounded resource (queue pool, scheduler queue, tenant budget) is full.
    #[error("resource exhausted: {what}")]
    ResourceExhausted { what: String },

    /// The operation was attempted in the wrong lifecycle state.
    #[error("precondition failed: {message}")]
    PreconditionFailed { message: String },

    /// The operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The caller aborted the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// No worker can currently serve the request.
    #[error("no worker available")]
    WorkerUnavailable,

    /// The serving worker crashed or reported a fatal error.
    #[error("worker failed")]
    WorkerFailed,

    /// Framing or pipe-level failure on the worker channel.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The worker signalled a stream-level generation error.
    #[error("generation failed: {message}")]
    Generation { message: String },

    /// An invariant inside the gateway was violated.
    #[error("internal error")]
    Internal,
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            EngineError::NotFound { .. } => ErrorCode::NotFound,
            EngineError::AlreadyRegistered { .. } => ErrorCode::AlreadyExists,
            EngineError::ResourceExhausted { .. } => ErrorCode::ResourceExhausted,
            EngineError::PreconditionFailed { .. } => ErrorCode::PreconditionFailed,
            EngineError::Timeout => ErrorCode::Timeout,
            EngineError::Cancelled => ErrorCode::Cancelled,
            EngineError::WorkerUnavailable => ErrorCode::WorkerUnavailable,
            EngineError::WorkerFailed => ErrorCode::WorkerFailed,
            EngineError::Transport { .. } => ErrorCode::Transport,
            EngineError::Generation { .. } => ErrorCode::GenerationError,
            EngineError::Internal => ErrorCode::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// Convert to the wire-level `{ code, message }` object.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
        }
    }

    /// Reconstruct from a wire-level error object.
    ///
    /// Unknown combinations collapse to the closest variant; the message is
    /// preserved only where the variant carries one.
    pub fn from_body(body: ErrorBody) -> Self {
        match body.code {
            ErrorCode::InvalidArgument => EngineError::InvalidArgument { message: body.message },
            ErrorCode::NotFound => EngineError::NotFound { what: body.message },
            ErrorCode::AlreadyExists => EngineError::PreconditionFailed { message: body.message },
            ErrorCode::ResourceExhausted => EngineError::ResourceExhausted { what: body.message },
            ErrorCode::PreconditionFailed => EngineError::PreconditionFailed { message: body.message },
            ErrorCode::Timeout => EngineError::Timeout,
            ErrorCode::Cancelled => EngineError::Cancelled,
            ErrorCode::WorkerUnavailable => EngineError::WorkerUnavailable,
            ErrorCode::WorkerFailed => EngineError::WorkerFailed,
            ErrorCode::Transport => EngineError::Transport { message: body.message },
            ErrorCode::GenerationError => EngineError::Generation { message: body.message },
            ErrorCode::Internal => EngineError::Internal,
        }
    }
}
