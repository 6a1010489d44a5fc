//! Workflow Registry (C8): the catalog of known workflow definitions and
//! their DAG visualization layout.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use super::dag::levels;
use super::stage::Stage;

#[derive(Debug, Clone, Default)]
pub struct WorkflowConfig {
    pub timeout_ms: Option<u64>,
    /// Reserved: accepted and stored, but no stage-level semantic retry is
    /// implemented (see the engine's open question on retry stability).
    pub max_retries: Option<u32>,
    pub streaming_enabled: bool,
}

pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub stages: Vec<Arc<dyn Stage>>,
    pub config: WorkflowConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    #[serde(rename = "stageCount")]
    pub stage_count: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DagPosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DagNodeData {
    pub label: String,
    #[serde(rename = "type")]
    pub stage_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DagNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: &'static str,
    pub data: DagNodeData,
    pub position: DagPosition,
}

#[derive(Debug, Clone, Serialize)]
pub struct DagEdge {
    pub id: String,
    pub source: String,
    pub target: String,
}

/// Vertical distance between successive levels in the visualization layout.
const LEVEL_SPACING_Y: f64 = 150.0;
/// Horizontal distance between sibling nodes at the same level.
const SIBLING_SPACING_X: f64 = 250.0;

#[derive(Debug, Clone, Serialize)]
pub struct DagView {
    pub nodes: Vec<DagNode>,
    pub edges: Vec<DagEdge>,
}

/// In-memory catalog of workflow definitions, populated once at startup.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: WorkflowDefinition) {
        self.workflows
            .insert(definition.id.clone(), Arc::new(definition));
    }

    pub fn get(&self, id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.get(id).cloned()
    }

    pub fn list(&self) -> Vec<WorkflowMetadata> {
        let mut out: Vec<WorkflowMetadata> = self
            .workflows
            .values()
            .map(|w| WorkflowMetadata {
                id: w.id.clone(),
                name: w.name.clone(),
                version: w.version.clone(),
                description: w.description.clone(),
                stage_count: w.stages.len(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Builds a node/edge view of a workflow's DAG for visualization. Levels
    /// only feed layout — the executor itself always runs stages
    /// sequentially regardless of level.
    pub fn to_dag(&self, id: &str) -> Option<DagView> {
        let workflow = self.workflows.get(id)?;
        let level_by_id = levels(&workflow.stages);

        // Nodes sharing a level are centered around x=0 in declaration order,
        // so the layout is deterministic across calls.
        let mut siblings_seen: HashMap<usize, usize> = HashMap::new();
        let mut count_by_level: HashMap<usize, usize> = HashMap::new();
        for stage in &workflow.stages {
            let level = level_by_id.get(stage.id()).copied().unwrap_or(0);
            *count_by_level.entry(level).or_insert(0) += 1;
        }

        let nodes = workflow
            .stages
            .iter()
            .map(|stage| {
                let level = level_by_id.get(stage.id()).copied().unwrap_or(0);
                let index_in_level = siblings_seen.entry(level).or_insert(0);
                let count = count_by_level[&level] as f64;
                let x = (*index_in_level as f64 - (count - 1.0) / 2.0) * SIBLING_SPACING_X;
                *index_in_level += 1;

                DagNode {
                    id: stage.id().to_string(),
                    node_type: "stage",
                    data: DagNodeData {
                        label: stage.name().to_string(),
                        stage_type: stage.stage_type().to_string(),
                        description: None,
                    },
                    position: DagPosition {
                        x,
                        y: level as f64 * LEVEL_SPACING_Y,
                    },
                }
            })
            .collect();

        let edges = workflow
            .stages
            .iter()
            .flat_map(|stage| {
                stage.dependencies().iter().map(|dep| DagEdge {
                    id: format!("{dep}->{}", stage.id()),
                    source: dep.clone(),
                    target: stage.id().to_string(),
                })
            })
            .collect();

        Some(DagView { nodes, edges })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::WorkflowContext;
    use crate::engine::stage::{StageExecutionError, StageResult};
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;
    use std::collections::HashSet;

    struct StubStage {
        id: &'static str,
        deps: HashSet<String>,
    }

    #[async_trait]
    impl Stage for StubStage {
        fn id(&self) -> &str {
            self.id
        }
        fn name(&self) -> &str {
            self.id
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
            _deps: &StdHashMap<String, StageResult>,
        ) -> Result<StageResult, StageExecutionError> {
            unreachable!("registry tests never execute stages")
        }
    }

    fn sample_registry() -> WorkflowRegistry {
        let mut registry = WorkflowRegistry::new();
        registry.register(WorkflowDefinition {
            id: "council".to_string(),
            name: "LLM Council".to_string(),
            version: "1".to_string(),
            description: Some("deliberation workflow".to_string()),
            stages: vec![
                Arc::new(StubStage {
                    id: "parallel-query",
                    deps: HashSet::new(),
                }),
                Arc::new(StubStage {
                    id: "peer-ranking",
                    deps: ["parallel-query".to_string()].into_iter().collect(),
                }),
            ],
            config: WorkflowConfig::default(),
        });
        registry
    }

    #[test]
    fn list_returns_metadata_sorted_by_id() {
        let registry = sample_registry();
        let list = registry.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].stage_count, 2);
    }

    #[test]
    fn get_returns_none_for_unknown_workflow() {
        let registry = sample_registry();
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn to_dag_produces_one_edge_per_dependency() {
        let registry = sample_registry();
        let dag = registry.to_dag("council").unwrap();
        assert_eq!(dag.nodes.len(), 2);
        assert_eq!(dag.edges.len(), 1);
        assert_eq!(dag.edges[0].id, "parallel-query->peer-ranking");
        assert_eq!(dag.edges[0].source, "parallel-query");
        assert_eq!(dag.edges[0].target, "peer-ranking");
    }

    #[test]
    fn to_dag_nodes_carry_wire_shape_and_layout() {
        let registry = sample_registry();
        let dag = registry.to_dag("council").unwrap();

        for node in &dag.nodes {
            assert_eq!(node.node_type, "stage");
        }

        let root = dag.nodes.iter().find(|n| n.id == "parallel-query").unwrap();
        assert_eq!(root.data.label, "parallel-query");
        assert_eq!(root.data.stage_type, "stub");
        assert_eq!(root.position.y, 0.0);
        assert_eq!(root.position.x, 0.0);

        let child = dag.nodes.iter().find(|n| n.id == "peer-ranking").unwrap();
        assert_eq!(child.position.y, 150.0);
        assert_eq!(child.position.x, 0.0);
    }

    #[test]
    fn to_dag_centers_siblings_at_the_same_level() {
        let mut registry = WorkflowRegistry::new();
        registry.register(WorkflowDefinition {
            id: "fanout".to_string(),
            name: "Fan-out".to_string(),
            version: "1".to_string(),
            description: None,
            stages: vec![
                Arc::new(StubStage { id: "root", deps: HashSet::new() }),
                Arc::new(StubStage {
                    id: "left",
                    deps: ["root".to_string()].into_iter().collect(),
                }),
                Arc::new(StubStage {
                    id: "right",
                    deps: ["root".to_string()].into_iter().collect(),
                }),
            ],
            config: WorkflowConfig::default(),
        });

        let dag = registry.to_dag("fanout").unwrap();
        let left = dag.nodes.iter().find(|n| n.id == "left").unwrap();
        let right = dag.nodes.iter().find(|n| n.id == "right").unwrap();
        assert_eq!(left.position.x, -125.0);
        assert_eq!(right.position.x, 125.0);
        assert_eq!(left.position.y, right.position.y);
    }
}
