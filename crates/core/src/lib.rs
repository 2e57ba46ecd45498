//! Core logic including the reasoning loop, tool dispatch, transcripts and
//! configurations.

#![deny(missing_docs)]
#![deny(clippy::missing_safety_doc)]

#[macro_use]
extern crate tracing;

mod config;
mod model_client;
mod reasoning;
pub mod tool;
pub mod transcript;

pub use config::{LoopConfig, LoopConfigBuilder};
pub use model_client::{DeltaCallback, ModelClient, ModelClientResponse};
pub use reasoning::{
    LoopError, LoopEvent, LoopResult, LoopState, ReasoningLoop,
    ReasoningLoopBuilder, RunReport, RunStats,
};
pub use tokio_util::sync::CancellationToken;
pub use transcript::{CorrelationError, Transcript};
