//! Stage 1 — Parallel Query (§4.3.1): fans the user's question out to every
//! council model concurrently. Never fails as a whole; a model that errors
//! or times out simply has a `null` response in the output, matching
//! [`crate::llm::CouncilClient::query_parallel`]'s fan-out contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};

use crate::backend::{ChatMessage, Role};
use crate::engine::context::WorkflowContext;
use crate::engine::stage::{Stage, StageExecutionError, StageResult};

const DEFAULT_USER_TEMPLATE: &str = "{{ userQuery }}";

#[derive(Debug, Clone)]
pub struct ParallelQueryConfig {
    pub models: Vec<String>,
    pub system_prompt: Option<String>,
    pub user_prompt_template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelQuery {
    pub model: String,
    pub response: Option<String>,
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelQueryOutput {
    pub queries: Vec<ModelQuery>,
    #[serde(rename = "successCount")]
    pub success_count: usize,
    #[serde(rename = "failureCount")]
    pub failure_count: usize,
}

pub struct ParallelQueryStage {
    dependencies: HashSet<String>,
    config: ParallelQueryConfig,
}

impl ParallelQueryStage {
    pub const ID: &'static str = "parallel-query";

    pub fn new(config: ParallelQueryConfig) -> Self {
        Self {
            dependencies: HashSet::new(),
            config,
        }
    }
}

#[async_trait]
impl Stage for ParallelQueryStage {
    fn id(&self) -> &str {
        Self::ID
    }
    fn name(&self) -> &str {
        "Parallel Query"
    }
    fn stage_type(&self) -> &str {
        "parallel-query"
    }
    fn dependencies(&self) -> &HashSet<String> {
        &self.dependencies
    }

    async fn validate(&self) -> Result<(), StageExecutionError> {
        if self.config.models.is_empty() {
            return Err(StageExecutionError::new(
                Self::ID,
                "at least one council model is required",
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &WorkflowContext,
        _dependencies: &HashMap<String, StageResult>,
    ) -> Result<StageResult, StageExecutionError> {
        let template = self
            .config
            .user_prompt_template
            .as_deref()
            .unwrap_or(DEFAULT_USER_TEMPLATE);
        let vars = json!({ "userQuery": ctx.user_query });
        let rendered = ctx
            .services
            .templates
            .render(Self::ID, template, &vars)
            .map_err(|e| StageExecutionError::with_cause(Self::ID, "failed to render user prompt", e))?;

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.config.system_prompt {
            messages.push(ChatMessage {
                role: Role::System,
                content: system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: Role::User,
            content: rendered,
        });

        let results = ctx
            .services
            .llm
            .query_parallel(&self.config.models, &messages)
            .await;

        let mut queries = Vec::with_capacity(self.config.models.len());
        let mut success_count = 0;
        let mut failure_count = 0;
        for model in &self.config.models {
            match results.get(model).cloned().flatten() {
                Some(response) => {
                    success_count += 1;
                    queries.push(ModelQuery {
                        model: model.clone(),
                        response: response.content,
                        reasoning: response.reasoning,
                    });
                }
                None => {
                    failure_count += 1;
                    queries.push(ModelQuery {
                        model: model.clone(),
                        response: None,
                        reasoning: None,
                    });
                }
            }
        }

        if success_count == 0 {
            return Err(StageExecutionError::new(
                Self::ID,
                "every council model failed to respond",
            ));
        }

        Ok(StageResult::new(
            ParallelQueryOutput {
                queries,
                success_count,
                failure_count,
            },
            None,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::config::AppConfig;
    use crate::engine::context::WorkflowServices;
    use crate::engine::template::TemplateRenderer;
    use crate::llm::CouncilClient;
    use crate::storage::NullStore;
    use std::sync::Arc;

    fn ctx_with_backend(backend: Arc<dyn crate::backend::Backend>) -> WorkflowContext {
        WorkflowContext::new(
            "what is the capital of france?",
            WorkflowServices {
                llm: Arc::new(CouncilClient::new("http://mock", backend)),
                storage: Arc::new(NullStore),
                config: Arc::new(AppConfig::for_tests()),
                templates: Arc::new(TemplateRenderer::new()),
            },
        )
    }

    #[tokio::test]
    async fn queries_every_model_and_records_success_count() {
        let stage = ParallelQueryStage::new(ParallelQueryConfig {
            models: vec!["m1".to_string(), "m2".to_string()],
            system_prompt: None,
            user_prompt_template: None,
        });
        let ctx = ctx_with_backend(Arc::new(MockBackend::fixed("Paris")));
        let result = stage.execute(&ctx, &HashMap::new()).await.unwrap();
        let output = result.downcast::<ParallelQueryOutput>().unwrap();
        assert_eq!(output.success_count, 2);
        assert_eq!(output.failure_count, 0);
        assert_eq!(output.queries.len(), 2);
    }

    #[tokio::test]
    async fn validate_rejects_empty_model_list() {
        let stage = ParallelQueryStage::new(ParallelQueryConfig {
            models: vec![],
            system_prompt: None,
            user_prompt_template: None,
        });
        assert!(stage.validate().await.is_err());
    }
}
