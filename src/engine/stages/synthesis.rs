//! Stage 3 — Synthesis (§4.3.3): a single chairman model reads the original
//! responses (with their aggregate rank for context) and produces the final
//! answer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

use crate::backend::{ChatMessage, Role};
use crate::engine::context::WorkflowContext;
use crate::engine::stage::{Stage, StageExecutionError, StageResult};

use super::parallel_query::{ParallelQueryOutput, ParallelQueryStage};
use super::peer_ranking::{PeerRankingOutput, PeerRankingStage};

const DEFAULT_SYNTHESIS_TEMPLATE: &str = "\
A panel of models answered the question: {{ userQuery }}

{% for r in responses %}## {{ r.label }} (average rank {{ r.rank }})
{{ r.text }}

{% endfor %}
Synthesize a single best final answer to the original question, drawing on \
the panel's strongest points and resolving any disagreements between them.
";

#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    pub chairman_model: String,
    pub chairman_max_tokens: Option<u32>,
    pub synthesis_prompt_template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisOutput {
    #[serde(rename = "finalAnswer")]
    pub final_answer: String,
    pub reasoning: Option<String>,
    #[serde(rename = "chairmanModel")]
    pub chairman_model: String,
}

pub struct SynthesisStage {
    dependencies: HashSet<String>,
    config: SynthesisConfig,
}

impl SynthesisStage {
    pub const ID: &'static str = "synthesis";

    pub fn new(config: SynthesisConfig) -> Self {
        let mut dependencies = HashSet::new();
        dependencies.insert(ParallelQueryStage::ID.to_string());
        dependencies.insert(PeerRankingStage::ID.to_string());
        Self {
            dependencies,
            config,
        }
    }
}

#[async_trait]
impl Stage for SynthesisStage {
    fn id(&self) -> &str {
        Self::ID
    }
    fn name(&self) -> &str {
        "Synthesis"
    }
    fn stage_type(&self) -> &str {
        "synthesis"
    }
    fn dependencies(&self) -> &HashSet<String> {
        &self.dependencies
    }

    async fn validate(&self) -> Result<(), StageExecutionError> {
        if self.config.chairman_model.trim().is_empty() {
            return Err(StageExecutionError::new(Self::ID, "a chairman model is required"));
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
        let peer = dependencies
            .get(PeerRankingStage::ID)
            .and_then(|r| r.downcast::<PeerRankingOutput>())
            .ok_or_else(|| {
                StageExecutionError::new(Self::ID, "missing peer-ranking dependency result")
            })?;

        let model_to_label: HashMap<&str, &str> = peer
            .label_to_model
            .iter()
            .map(|(label, model)| (model.as_str(), label.as_str()))
            .collect();
        let rank_by_model: HashMap<&str, f64> = peer
            .aggregate_rankings
            .iter()
            .map(|r| (r.model.as_str(), r.average_rank))
            .collect();

        let responses_json: Vec<Value> = parallel
            .queries
            .iter()
            .filter_map(|q| q.response.as_ref().map(|text| (q, text)))
            .map(|(q, text)| {
                let label = model_to_label.get(q.model.as_str()).copied().unwrap_or("?");
                let rank = rank_by_model.get(q.model.as_str()).copied();
                json!({ "label": label, "rank": rank, "text": text })
            })
            .collect();

        let template = self
            .config
            .synthesis_prompt_template
            .as_deref()
            .unwrap_or(DEFAULT_SYNTHESIS_TEMPLATE);
        let vars = json!({ "userQuery": ctx.user_query, "responses": responses_json });
        let rendered = ctx
            .services
            .templates
            .render(Self::ID, template, &vars)
            .map_err(|e| {
                StageExecutionError::with_cause(Self::ID, "failed to render synthesis prompt", e)
            })?;

        let messages = vec![ChatMessage {
            role: Role::User,
            content: rendered,
        }];
        let response = ctx
            .services
            .llm
            .query(&self.config.chairman_model, &messages, self.config.chairman_max_tokens)
            .await
            .map_err(|e| {
                StageExecutionError::with_cause(
                    Self::ID,
                    format!("chairman model {} failed", self.config.chairman_model),
                    e,
                )
            })?;

        let final_answer = response
            .content
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| StageExecutionError::new(Self::ID, "chairman returned an empty response"))?;

        Ok(StageResult::new(
            SynthesisOutput {
                final_answer,
                reasoning: response.reasoning,
                chairman_model: self.config.chairman_model.clone(),
            },
            None,
        ))
    }
}
