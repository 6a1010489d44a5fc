//! [`CouncilClient`] wraps the transport-level [`Backend`] abstraction with
//! the two operations a deliberation workflow actually needs: a single
//! deadline-bounded `query` and a `query_parallel` fan-out that never fails
//! as a whole — individual model failures are represented as `None` in the
//! returned map, never propagated as an error.

use crate::backend::{self, Backend, BackoffConfig, ChatMessage, LlmRequest, OllamaBackend, Role};
#[cfg(feature = "openai")]
use crate::backend::OpenAiBackend;
use crate::client::LlmConfig;
use crate::error::PipelineError;
use crate::parsing;
use futures::future::join_all;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a single upstream call.
#[derive(Debug, Clone)]
pub struct Response {
    /// The model's answer text, with any `<think>` block removed.
    pub content: Option<String>,
    /// Extracted reasoning/thinking content, when the model produced one.
    pub reasoning: Option<String>,
}

/// Classified failure of a single upstream call.
///
/// Stages translate this into a `StageExecutionError` with `cause` when it
/// is fatal (see §4.3); [`CouncilClient::query_parallel`] instead folds it
/// into `None` so a single bad model never aborts the fan-out.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("call to {model} exceeded the {timeout_ms}ms deadline")]
    Timeout { model: String, timeout_ms: u64 },
    #[error("{model} returned HTTP {status}: {message}")]
    Http {
        model: String,
        status: u16,
        message: String,
    },
    #[error("{model} returned a malformed response: {message}")]
    Malformed { model: String, message: String },
    #[error("transport error calling {model}: {message}")]
    Transport { model: String, message: String },
}

/// Strip the known provider path suffixes so a base URL copy-pasted with a
/// full API path (e.g. `https://openrouter.ai/api/v1`) still composes
/// correctly with a backend that appends its own suffix.
fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    for suffix in &[
        "/v1/chat/completions",
        "/v1/chat",
        "/v1",
        "/api/generate",
        "/api/chat",
        "/api",
    ] {
        if let Some(stripped) = trimmed.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    trimmed.to_string()
}

fn split_messages(messages: &[ChatMessage]) -> (Option<String>, String) {
    let system = messages
        .iter()
        .find(|m| m.role == Role::System)
        .map(|m| m.content.clone());
    let user = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    (system, user)
}

/// Upstream LLM adapter. One instance is shared across requests.
pub struct CouncilClient {
    http: Client,
    base_url: String,
    backend: Arc<dyn Backend>,
    backoff: BackoffConfig,
    api_timeout: Duration,
    default_max_tokens: u32,
}

impl CouncilClient {
    /// Build a client against an OpenAI-compatible endpoint (OpenRouter and
    /// most hosted providers speak this dialect).
    #[cfg(feature = "openai")]
    pub fn openai_compatible(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::new(
            base_url,
            Arc::new(OpenAiBackend::new().with_api_key(api_key)),
        )
    }

    /// Build a client against any [`Backend`] implementation directly —
    /// used for the Ollama backend and for tests via `MockBackend`.
    pub fn new(base_url: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self {
            http: Client::new(),
            base_url: normalize_base_url(&base_url.into()),
            backend,
            backoff: BackoffConfig::standard(),
            api_timeout: Duration::from_secs(120),
            default_max_tokens: 2048,
        }
    }

    /// Build a client talking to Ollama's native API (used for local/dev
    /// deployments where `MOCK_MODE` and hosted providers don't apply).
    pub fn ollama(base_url: impl Into<String>) -> Self {
        Self::new(base_url, Arc::new(OllamaBackend))
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = timeout;
        self
    }

    pub fn with_default_max_tokens(mut self, max_tokens: u32) -> Self {
        self.default_max_tokens = max_tokens;
        self
    }

    /// `Query(model, messages, maxTokens?) → Response | UpstreamError` (§4.2).
    pub async fn query(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: Option<u32>,
    ) -> Result<Response, UpstreamError> {
        let (system_prompt, prompt) = split_messages(messages);
        let config = LlmConfig {
            max_tokens: max_tokens.unwrap_or(self.default_max_tokens),
            ..LlmConfig::default()
        };
        let request = LlmRequest {
            model: model.to_string(),
            system_prompt,
            prompt,
            messages: Vec::new(),
            config,
            stream: false,
        };

        let call = backend::with_backoff(
            &self.backend,
            &self.http,
            &self.base_url,
            &request,
            &self.backoff,
            None,
            None,
        );

        let outcome = tokio::time::timeout(self.api_timeout, call).await.map_err(|_| {
            UpstreamError::Timeout {
                model: model.to_string(),
                timeout_ms: self.api_timeout.as_millis() as u64,
            }
        })?;

        match outcome {
            Ok(response) => {
                if response.text.trim().is_empty() {
                    return Err(UpstreamError::Malformed {
                        model: model.to_string(),
                        message: "empty response body".to_string(),
                    });
                }
                let (reasoning, content) = parsing::extract_thinking(&response.text);
                Ok(Response {
                    content: Some(content),
                    reasoning,
                })
            }
            Err(PipelineError::HttpError { status, body, .. }) => Err(UpstreamError::Http {
                model: model.to_string(),
                status,
                message: body,
            }),
            Err(PipelineError::Request(e)) => Err(UpstreamError::Transport {
                model: model.to_string(),
                message: e.to_string(),
            }),
            Err(PipelineError::Cancelled) => Err(UpstreamError::Transport {
                model: model.to_string(),
                message: "cancelled".to_string(),
            }),
            Err(e) => Err(UpstreamError::Malformed {
                model: model.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// `QueryParallel(models, messages) → map[model]→Response?` (§4.2).
    ///
    /// Runs one concurrent task per model and never fails as a whole: a
    /// failed call becomes `None` for that model, never a propagated error.
    /// The returned map has exactly one entry per input model.
    pub async fn query_parallel(
        &self,
        models: &[String],
        messages: &[ChatMessage],
    ) -> HashMap<String, Option<Response>> {
        let calls = models.iter().map(|model| async move {
            let result = self.query(model, messages, None).await.ok();
            (model.clone(), result)
        });
        join_all(calls).await.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;

    #[test]
    fn normalizes_full_v1_path() {
        assert_eq!(
            normalize_base_url("https://openrouter.ai/api/v1"),
            "https://openrouter.ai/api"
        );
        assert_eq!(
            normalize_base_url("https://api.openai.com/v1/chat/completions"),
            "https://api.openai.com"
        );
    }

    #[test]
    fn normalizes_preserves_clean_host() {
        assert_eq!(
            normalize_base_url("http://localhost:11434"),
            "http://localhost:11434"
        );
    }

    #[test]
    fn split_messages_separates_system_and_user() {
        let messages = vec![
            ChatMessage {
                role: Role::System,
                content: "be terse".into(),
            },
            ChatMessage {
                role: Role::User,
                content: "hello".into(),
            },
        ];
        let (system, user) = split_messages(&messages);
        assert_eq!(system.as_deref(), Some("be terse"));
        assert_eq!(user, "hello");
    }

    #[tokio::test]
    async fn query_parallel_has_one_entry_per_model() {
        let client = CouncilClient::new("http://mock", Arc::new(MockBackend::fixed("ok")));
        let models = vec!["m1".to_string(), "m2".to_string(), "m3".to_string()];
        let messages = vec![ChatMessage {
            role: Role::User,
            content: "hi".into(),
        }];
        let results = client.query_parallel(&models, &messages).await;
        assert_eq!(results.len(), 3);
        for model in &models {
            assert!(results.contains_key(model));
        }
    }

    #[tokio::test]
    async fn query_succeeds_with_mock_backend() {
        let client = CouncilClient::new("http://mock", Arc::new(MockBackend::fixed("Paris")));
        let messages = vec![ChatMessage {
            role: Role::User,
            content: "capital of france?".into(),
        }];
        let resp = client.query("m1", &messages, None).await.unwrap();
        assert_eq!(resp.content.as_deref(), Some("Paris"));
    }

    #[tokio::test]
    async fn query_separates_think_block_into_reasoning() {
        let client = CouncilClient::new(
            "http://mock",
            Arc::new(MockBackend::fixed("<think>pondering</think>Paris")),
        );
        let messages = vec![ChatMessage {
            role: Role::User,
            content: "capital of france?".into(),
        }];
        let resp = client.query("m1", &messages, None).await.unwrap();
        assert_eq!(resp.content.as_deref(), Some("Paris"));
        assert_eq!(resp.reasoning.as_deref(), Some("pondering"));
    }
}
