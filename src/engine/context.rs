//! Workflow Context (C5): the immutable, append-only state threaded through
//! a workflow's stages. Each completed stage produces a *new* context via
//! [`WorkflowContext::with_stage_result`] — nothing already published is
//! ever mutated in place, so a reference held by an in-flight stage never
//! observes a later stage's result.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::stage::{StageExecutionError, StageResult};
use super::template::TemplateRenderer;
use crate::config::AppConfig;
use crate::llm::CouncilClient;
use crate::storage::ConversationStore;

/// Shared, request-independent collaborators every stage may reach for.
/// Cloning a `WorkflowServices` only clones `Arc` pointers.
#[derive(Clone)]
pub struct WorkflowServices {
    pub llm: Arc<CouncilClient>,
    pub storage: Arc<dyn ConversationStore>,
    pub config: Arc<AppConfig>,
    pub templates: Arc<TemplateRenderer>,
}

/// Logical immutability is achieved with structural sharing: the stage
/// result map is an `Arc<HashMap<..>>` that gets cloned and extended (not
/// mutated) on every `with_stage_result` call.
#[derive(Clone)]
pub struct WorkflowContext {
    pub user_query: String,
    stage_results: Arc<HashMap<String, StageResult>>,
    pub metadata: Arc<HashMap<String, serde_json::Value>>,
    pub services: WorkflowServices,
}

impl WorkflowContext {
    pub fn new(user_query: impl Into<String>, services: WorkflowServices) -> Self {
        Self {
            user_query: user_query.into(),
            stage_results: Arc::new(HashMap::new()),
            metadata: Arc::new(HashMap::new()),
            services,
        }
    }

    /// Returns a new context with `stage_id`'s result published. The
    /// receiver is left untouched — any stage still holding a reference to
    /// the prior context sees the old, smaller result set.
    pub fn with_stage_result(&self, stage_id: impl Into<String>, result: StageResult) -> Self {
        let mut results = (*self.stage_results).clone();
        results.insert(stage_id.into(), result);
        Self {
            user_query: self.user_query.clone(),
            stage_results: Arc::new(results),
            metadata: self.metadata.clone(),
            services: self.services.clone(),
        }
    }

    /// Fetches the published results for exactly the stage ids in
    /// `dependencies`. The DAG planner guarantees each dependency already
    /// ran by the time its dependent executes, so a miss here indicates an
    /// executor bug rather than a normal runtime condition.
    pub fn get_results(
        &self,
        dependencies: &HashSet<String>,
    ) -> Result<HashMap<String, StageResult>, StageExecutionError> {
        let mut out = HashMap::with_capacity(dependencies.len());
        for dep in dependencies {
            match self.stage_results.get(dep) {
                Some(result) => {
                    out.insert(dep.clone(), result.clone());
                }
                None => {
                    return Err(StageExecutionError::new(
                        "workflow",
                        format!("missing dependency result: {dep}"),
                    ))
                }
            }
        }
        Ok(out)
    }

    pub fn stage_results_snapshot(&self) -> HashMap<String, StageResult> {
        (*self.stage_results).clone()
    }
}
