//! # LLM Council
//!
//! A deliberation service that fans a question out to a council of LLMs,
//! has them peer-rank each other's answers, and asks a chairman model to
//! synthesize a final response — streamed to the caller as it happens.
//!
//! ## Core Concepts
//!
//! - **[`backend`]** — the [`backend::Backend`] trait abstracts over LLM
//!   providers ([`backend::OllamaBackend`], [`backend::OpenAiBackend`],
//!   [`backend::MockBackend`] for tests).
//! - **[`llm`]** — [`llm::CouncilClient`] wraps a backend with concurrent
//!   fan-out to several models, tolerating partial failures.
//! - **[`engine`]** — the workflow engine: a [`engine::WorkflowRegistry`] of
//!   named, staged workflows, an executor that runs a workflow's stages in
//!   order, and the three concrete stages (parallel query, peer ranking,
//!   synthesis) that make up the council workflow.
//! - **[`storage`]** — a file-backed [`storage::ConversationStore`] that
//!   persists conversations and the three-stage assistant response shape.
//! - **[`http`]** — the Axum adapter exposing conversations and workflow
//!   execution over HTTP, with SSE streaming of progress events.
//! - **[`config`]** — environment/CLI configuration and process bootstrap.
//! - **[`ratelimit`]** — a fixed-window rate limiter keyed by policy and
//!   caller identity.
//!
//! ## Quick Start
//!
//! ```no_run
//! use llm_council::backend::{ChatMessage, MockBackend, Role};
//! use llm_council::llm::CouncilClient;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = CouncilClient::new("http://mock", Arc::new(MockBackend::fixed("hello")));
//!     let messages = [ChatMessage { role: Role::User, content: "What is the capital of France?".into() }];
//!     let response = client.query("council-member", &messages, None).await?;
//!     println!("{:?}", response.content);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod llm;
pub mod parsing;
pub mod ratelimit;
pub mod storage;

pub use backend::{BackoffConfig, MockBackend, OllamaBackend};
#[cfg(feature = "openai")]
pub use backend::OpenAiBackend;
pub use client::LlmConfig;
pub use config::AppConfig;
pub use error::{PipelineError, Result};
pub use llm::{CouncilClient, UpstreamError};
