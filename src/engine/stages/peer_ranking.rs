//! Stage 2 — Peer Ranking (§4.3.2): anonymizes the successful Stage 1
//! responses behind `Response A/B/C...` labels, asks a panel of evaluator
//! models to rank them, parses each evaluation, and aggregates the parsed
//! rankings into one average rank per model.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

use crate::backend::{ChatMessage, Role};
use crate::engine::context::WorkflowContext;
use crate::engine::ranking::{aggregate_rankings, build_label_to_model, parse_ranking, AggregateRanking};
use crate::engine::stage::{Stage, StageExecutionError, StageResult};

use super::parallel_query::{ParallelQueryOutput, ParallelQueryStage};

const DEFAULT_RANKING_TEMPLATE: &str = "\
You are evaluating anonymized responses to the question: {{ userQuery }}

{% for r in responses %}## {{ r.label }}
{{ r.text }}

{% endfor %}
Rank the responses from best to worst. End your evaluation with a section \
starting with the line `FINAL RANKING:` followed by a numbered list of \
response labels, best first, for example:

FINAL RANKING:
1. Response B
2. Response A
";

#[derive(Debug, Clone)]
pub struct PeerRankingConfig {
    pub models: Vec<String>,
    pub ranking_prompt_template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorRanking {
    pub model: String,
    #[serde(rename = "rawEvaluation")]
    pub raw_evaluation: String,
    #[serde(rename = "parsedRanking")]
    pub parsed_ranking: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRankingOutput {
    #[serde(rename = "labelToModel")]
    pub label_to_model: HashMap<String, String>,
    pub rankings: Vec<EvaluatorRanking>,
    #[serde(rename = "aggregateRankings")]
    pub aggregate_rankings: Vec<AggregateRanking>,
}

pub struct PeerRankingStage {
    dependencies: HashSet<String>,
    config: PeerRankingConfig,
}

impl PeerRankingStage {
    pub const ID: &'static str = "peer-ranking";

    pub fn new(config: PeerRankingConfig) -> Self {
        let mut dependencies = HashSet::new();
        dependencies.insert(ParallelQueryStage::ID.to_string());
        Self {
            dependencies,
            config,
        }
    }
}

#[async_trait]
impl Stage for PeerRankingStage {
    fn id(&self) -> &str {
        Self::ID
    }
    fn name(&self) -> &str {
        "Peer Ranking"
    }
    fn stage_type(&self) -> &str {
        "peer-ranking"
    }
    fn dependencies(&self) -> &HashSet<String> {
        &self.dependencies
    }

    async fn validate(&self) -> Result<(), StageExecutionError> {
        if self.config.models.is_empty() {
            return Err(StageExecutionError::new(
                Self::ID,
                "at least one evaluator model is required",
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &WorkflowContext,
        dependencies: &HashMap<String, StageResult>,
    ) -> Result<StageResult, StageExecutionError> {
        let parallel = dependencies
            .get(ParallelQueryStage::ID)
            .and_then(|r| r.downcast::<ParallelQueryOutput>())
            .ok_or_else(|| {
                StageExecutionError::new(Self::ID, "missing parallel-query dependency result")
            })?;

        let successes: Vec<_> = parallel
            .queries
            .iter()
            .filter(|q| q.response.is_some())
            .collect();
        if successes.is_empty() {
            return Err(StageExecutionError::new(
                Self::ID,
                "no successful parallel-query responses to rank",
            ));
        }

        let model_order: Vec<String> = successes.iter().map(|q| q.model.clone()).collect();
        let label_to_model = build_label_to_model(&model_order);
        let model_to_label: HashMap<&str, &str> = label_to_model
            .iter()
            .map(|(label, model)| (model.as_str(), label.as_str()))
            .collect();

        let responses_json: Vec<Value> = successes
            .iter()
            .map(|q| {
                json!({
                    "label": model_to_label[q.model.as_str()],
                    "text": q.response.clone().unwrap_or_default(),
                })
            })
            .collect();

        let template = self
            .config
            .ranking_prompt_template
            .as_deref()
            .unwrap_or(DEFAULT_RANKING_TEMPLATE);
        let vars = json!({ "userQuery": ctx.user_query, "responses": responses_json });
        let rendered = ctx
            .services
            .templates
            .render(Self::ID, template, &vars)
            .map_err(|e| {
                StageExecutionError::with_cause(Self::ID, "failed to render ranking prompt", e)
            })?;

        let messages = vec![ChatMessage {
            role: Role::User,
            content: rendered,
        }];
        let results = ctx
            .services
            .llm
            .query_parallel(&self.config.models, &messages)
            .await;

        let mut rankings = Vec::new();
        for model in &self.config.models {
            let Some(Some(response)) = results.get(model) else {
                continue;
            };
            let Some(text) = &response.content else {
                continue;
            };
            if text.trim().is_empty() {
                continue;
            }
            rankings.push(EvaluatorRanking {
                model: model.clone(),
                raw_evaluation: text.clone(),
                parsed_ranking: parse_ranking(text),
            });
        }

        if rankings.is_empty() {
            return Err(StageExecutionError::new(
                Self::ID,
                "no evaluator produced a parseable ranking",
            ));
        }

        let parsed: Vec<Vec<String>> = rankings.iter().map(|r| r.parsed_ranking.clone()).collect();
        let aggregate_rankings = aggregate_rankings(&parsed, &label_to_model);

        Ok(StageResult::new(
            PeerRankingOutput {
                label_to_model,
                rankings,
                aggregate_rankings,
            },
            None,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, LlmRequest, LlmResponse, MockBackend};
    use crate::config::AppConfig;
    use crate::engine::context::WorkflowServices;
    use crate::engine::stages::parallel_query::ModelQuery;
    use crate::engine::template::TemplateRenderer;
    use crate::error::PipelineError;
    use crate::llm::CouncilClient;
    use crate::storage::NullStore;
    use async_trait::async_trait;
    use reqwest::Client;
    use std::sync::Arc;

    fn ctx_with_backend(backend: Arc<dyn Backend>) -> WorkflowContext {
        WorkflowContext::new(
            "which answer is best?",
            WorkflowServices {
                llm: Arc::new(CouncilClient::new("http://mock", backend)),
                storage: Arc::new(NullStore),
                config: Arc::new(AppConfig::for_tests()),
                templates: Arc::new(TemplateRenderer::new()),
            },
        )
    }

    fn parallel_result(responses: &[&str]) -> StageResult {
        let queries = responses
            .iter()
            .enumerate()
            .map(|(i, r)| ModelQuery {
                model: format!("m{i}"),
                response: Some(r.to_string()),
                reasoning: None,
            })
            .collect();
        StageResult::new(
            ParallelQueryOutput {
                queries,
                success_count: responses.len(),
                failure_count: 0,
            },
            None,
        )
    }

    struct FixedEvaluator(String);

    #[async_trait]
    impl Backend for FixedEvaluator {
        async fn complete(
            &self,
            _client: &Client,
            _base_url: &str,
            _request: &LlmRequest,
        ) -> Result<LlmResponse, PipelineError> {
            Ok(LlmResponse {
                text: self.0.clone(),
                status: 200,
                metadata: None,
            })
        }

        fn name(&self) -> &'static str {
            "fixed-evaluator"
        }
    }

    #[tokio::test]
    async fn produces_aggregate_rankings_from_evaluator_text() {
        let stage = PeerRankingStage::new(PeerRankingConfig {
            models: vec!["judge".to_string()],
            ranking_prompt_template: None,
        });
        let ctx = ctx_with_backend(Arc::new(FixedEvaluator(
            "FINAL RANKING:\n1. Response B\n2. Response A\n".to_string(),
        )));
        let mut deps = HashMap::new();
        deps.insert(ParallelQueryStage::ID.to_string(), parallel_result(&["alpha", "beta"]));

        let result = stage.execute(&ctx, &deps).await.unwrap();
        let output = result.downcast::<PeerRankingOutput>().unwrap();
        assert_eq!(output.aggregate_rankings.len(), 2);
        assert_eq!(output.aggregate_rankings[0].model, "m1");
    }

    #[tokio::test]
    async fn skips_failed_models_when_assigning_labels() {
        let stage = PeerRankingStage::new(PeerRankingConfig {
            models: vec!["judge".to_string()],
            ranking_prompt_template: None,
        });
        let ctx = ctx_with_backend(Arc::new(FixedEvaluator(
            "FINAL RANKING:\n1. Response A\n2. Response B\n".to_string(),
        )));

        let mut deps = HashMap::new();
        let queries = vec![
            ModelQuery { model: "m1".to_string(), response: Some("alpha".to_string()), reasoning: None },
            ModelQuery { model: "m2".to_string(), response: None, reasoning: None },
            ModelQuery { model: "m3".to_string(), response: Some("gamma".to_string()), reasoning: None },
        ];
        deps.insert(
            ParallelQueryStage::ID.to_string(),
            StageResult::new(
                ParallelQueryOutput { queries, success_count: 2, failure_count: 1 },
                None,
            ),
        );

        let result = stage.execute(&ctx, &deps).await.unwrap();
        let output = result.downcast::<PeerRankingOutput>().unwrap();
        assert_eq!(output.label_to_model.len(), 2);
        assert_eq!(output.label_to_model["Response A"], "m1");
        assert_eq!(output.label_to_model["Response B"], "m3");
        assert!(!output.label_to_model.values().any(|m| m == "m2"));
    }

    #[tokio::test]
    async fn fails_when_every_evaluator_returns_empty_text() {
        let stage = PeerRankingStage::new(PeerRankingConfig {
            models: vec!["judge".to_string()],
            ranking_prompt_template: None,
        });
        let ctx = ctx_with_backend(Arc::new(MockBackend::fixed("")));
        let mut deps = HashMap::new();
        deps.insert(ParallelQueryStage::ID.to_string(), parallel_result(&["alpha"]));

        assert!(stage.execute(&ctx, &deps).await.is_err());
    }

    #[tokio::test]
    async fn fails_when_no_parallel_query_dependency_present() {
        let stage = PeerRankingStage::new(PeerRankingConfig {
            models: vec!["judge".to_string()],
            ranking_prompt_template: None,
        });
        let ctx = ctx_with_backend(Arc::new(MockBackend::fixed("FINAL RANKING:\n1. Response A\n")));
        assert!(stage.execute(&ctx, &HashMap::new()).await.is_err());
    }
}
