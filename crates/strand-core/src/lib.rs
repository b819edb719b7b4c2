//! The strand gateway core.
//!
//! strand multiplexes many concurrent generation requests onto a small set of
//! out-of-process runtime workers. This crate is the orchestration layer
//! between the two: the RPC transport and worker supervisor on the bottom,
//! the stream registry / generator factory in the middle, and the scheduler,
//! router, and admission governor deciding what runs where and when.
//!
//! User code goes through [`engine::Engine`]; everything else is exposed for
//! composition and testing but is not a stability surface.

pub mod admission;
pub mod batcher;
pub mod cleanup;
pub mod config;
pub mod engine;
pub mod generator;
pub mod pool;
pub mod prompt;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod supervisor;
pub mod telemetry;
pub mod transport;

pub use config::EngineConfig;
pub use engine::{Engine, EngineStats, GenerateOutcome, LoadModelRequest};
pub use generator::{GenerateOptions, TokenGenerator};
pub use strand_types::{EngineError, GeneratorChunk};
