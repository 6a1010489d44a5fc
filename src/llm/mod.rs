//! Upstream LLM adapter (C2): single-call and parallel fan-out to a council
//! of models, with partial-failure tolerance baked into the fan-out contract.

pub mod client;

pub use client::{CouncilClient, Response, UpstreamError};
