//! DAG Planner (C4): validates a workflow definition and produces a
//! dependency-respecting execution order via Kahn's algorithm — the same
//! preference for an explicit, iterative loop (over recursion) that the
//! transport layer's retry loop uses.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;

use super::registry::WorkflowDefinition;
use super::stage::{Stage, StageExecutionError};

#[derive(Debug, Error)]
pub enum WorkflowDefinitionError {
    #[error("workflow must declare a non-empty id, name, and version")]
    MissingMetadata,
    #[error("workflow must declare at least one stage")]
    Empty,
    #[error("duplicate stage id: {0}")]
    DuplicateStageId(String),
    #[error("stage '{stage_id}' depends on unknown stage '{missing_dependency}'")]
    MissingDependency {
        stage_id: String,
        missing_dependency: String,
    },
    #[error("workflow contains a dependency cycle")]
    Cycle,
}

/// Top-level error surfaced by planning and executing a workflow — the
/// union of the two failure modes described in the component design.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("invalid workflow definition: {0}")]
    Definition(#[from] WorkflowDefinitionError),
    #[error(transparent)]
    Stage(#[from] StageExecutionError),
}

/// Validates `workflow` and returns its stages in execution order.
///
/// Checks, in order: required metadata present, at least one stage, no
/// duplicate stage ids, every declared dependency resolves to a real stage,
/// no dependency cycle, and finally each stage's own `validate()` passes.
pub async fn plan(workflow: &WorkflowDefinition) -> Result<Vec<Arc<dyn Stage>>, WorkflowError> {
    if workflow.id.is_empty() || workflow.name.is_empty() || workflow.version.is_empty() {
        return Err(WorkflowDefinitionError::MissingMetadata.into());
    }
    if workflow.stages.is_empty() {
        return Err(WorkflowDefinitionError::Empty.into());
    }

    let mut seen = HashSet::with_capacity(workflow.stages.len());
    for stage in &workflow.stages {
        if !seen.insert(stage.id().to_string()) {
            return Err(WorkflowDefinitionError::DuplicateStageId(stage.id().to_string()).into());
        }
    }
    for stage in &workflow.stages {
        for dep in stage.dependencies() {
            if !seen.contains(dep) {
                return Err(WorkflowDefinitionError::MissingDependency {
                    stage_id: stage.id().to_string(),
                    missing_dependency: dep.clone(),
                }
                .into());
            }
        }
    }

    let ordered = topological_order(&workflow.stages)?;

    let validations = futures::future::join_all(ordered.iter().map(|stage| stage.validate())).await;
    for result in validations {
        result?;
    }

    Ok(ordered)
}

fn topological_order(
    stages: &[Arc<dyn Stage>],
) -> Result<Vec<Arc<dyn Stage>>, WorkflowDefinitionError> {
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for stage in stages {
        indegree.entry(stage.id()).or_insert(0);
        for dep in stage.dependencies() {
            *indegree.entry(stage.id()).or_insert(0) += 1;
            dependents.entry(dep.as_str()).or_default().push(stage.id());
        }
    }

    let by_id: HashMap<&str, Arc<dyn Stage>> =
        stages.iter().map(|s| (s.id(), s.clone())).collect();

    // Seeding the queue by iterating `stages` in declaration order (rather
    // than over the hash map) keeps same-level ties in the order they were
    // declared.
    let mut queue: VecDeque<&str> = stages
        .iter()
        .filter(|s| indegree[s.id()] == 0)
        .map(|s| s.id())
        .collect();

    let mut ordered_ids = Vec::with_capacity(stages.len());
    while let Some(id) = queue.pop_front() {
        ordered_ids.push(id);
        if let Some(deps_of) = dependents.get(id) {
            for &dependent in deps_of {
                let entry = indegree.get_mut(dependent).unwrap();
                *entry -= 1;
                if *entry == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if ordered_ids.len() != stages.len() {
        return Err(WorkflowDefinitionError::Cycle);
    }

    Ok(ordered_ids.into_iter().map(|id| by_id[id].clone()).collect())
}

/// Per-stage depth from the nearest root (a stage with no dependencies),
/// used only by [`super::registry::WorkflowRegistry::to_dag`] for
/// visualization layout — the executor always runs stages strictly
/// sequentially in topological order regardless of level.
pub fn levels(stages: &[Arc<dyn Stage>]) -> HashMap<String, usize> {
    let mut level: HashMap<String, usize> = HashMap::new();
    for stage in stages {
        level.insert(stage.id().to_string(), 0);
    }
    // `stages` is already topologically sorted by the time this is called,
    // so a single forward pass suffices.
    for stage in stages {
        let current = level[stage.id()];
        for dep in stage.dependencies() {
            if let Some(dep_level) = level.get(dep) {
                let candidate = dep_level + 1;
                if candidate > current {
                    level.insert(stage.id().to_string(), candidate);
                }
            }
        }
    }
    level
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::WorkflowContext;
    use crate::engine::stage::StageResult;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct StubStage {
        id: String,
        deps: HashSet<String>,
    }

    #[async_trait]
    impl Stage for StubStage {
        fn id(&self) -> &str {
            &self.id
        }
        fn name(&self) -> &str {
            &self.id
        }
        fn stage_type(&self) -> &str {
            "stub"
        }
        fn dependencies(&self) -> &HashSet<String> {
            &self.deps
        }
        async fn validate(&self) -> Result<(), StageExecutionError> {
            Ok(())
        }
        async fn execute(
            &self,
            _ctx: &WorkflowContext,
            _deps: &HashMap<String, StageResult>,
        ) -> Result<StageResult, StageExecutionError> {
            Ok(StageResult::new(self.id.clone(), None))
        }
    }

    fn stub(id: &str, deps: &[&str]) -> Arc<dyn Stage> {
        Arc::new(StubStage {
            id: id.to_string(),
            deps: deps.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn workflow(stages: Vec<Arc<dyn Stage>>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".to_string(),
            name: "wf".to_string(),
            version: "1".to_string(),
            description: None,
            stages,
            config: Default::default(),
        }
    }

    #[tokio::test]
    async fn orders_stages_by_dependency() {
        let wf = workflow(vec![stub("c", &["b"]), stub("a", &[]), stub("b", &["a"])]);
        let order = plan(&wf).await.unwrap();
        let ids: Vec<&str> = order.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn detects_missing_dependency() {
        let wf = workflow(vec![stub("a", &["ghost"])]);
        let err = plan(&wf).await.unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Definition(WorkflowDefinitionError::MissingDependency { .. })
        ));
    }

    #[tokio::test]
    async fn detects_duplicate_stage_ids() {
        let wf = workflow(vec![stub("a", &[]), stub("a", &[])]);
        let err = plan(&wf).await.unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Definition(WorkflowDefinitionError::DuplicateStageId(_))
        ));
    }

    #[tokio::test]
    async fn detects_cycle() {
        let wf = workflow(vec![stub("a", &["b"]), stub("b", &["a"])]);
        let err = plan(&wf).await.unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Definition(WorkflowDefinitionError::Cycle)
        ));
    }

    #[tokio::test]
    async fn rejects_empty_workflow() {
        let wf = workflow(vec![]);
        let err = plan(&wf).await.unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Definition(WorkflowDefinitionError::Empty)
        ));
    }

    #[test]
    fn levels_reflect_longest_path_from_a_root() {
        let stages = vec![stub("a", &[]), stub("b", &["a"]), stub("c", &["b"])];
        let lv = levels(&stages);
        assert_eq!(lv["a"], 0);
        assert_eq!(lv["b"], 1);
        assert_eq!(lv["c"], 2);
    }
}
