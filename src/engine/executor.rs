//! Executor (C6): drives a planned workflow stage-by-stage, threading an
//! evolving [`WorkflowContext`] through them and emitting ordered progress
//! events. Mirrors the transport layer's cancellation-flag-checked loop,
//! generalized from one HTTP call per iteration to one stage per iteration.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use super::context::{WorkflowContext, WorkflowServices};
use super::dag::{plan, WorkflowDefinitionError, WorkflowError};
use super::registry::WorkflowDefinition;
use super::sink::{ProgressEvent, ProgressSink};
use super::stage::{StageExecutionError, StageResult};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub workflow_version: String,
    pub stage_results: HashMap<String, StageResult>,
    pub metadata: serde_json::Value,
    pub execution_time_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl WorkflowResult {
    pub fn stage_result<T: Send + Sync + 'static>(&self, stage_id: &str) -> Option<&T> {
        self.stage_results.get(stage_id)?.downcast::<T>()
    }
}

fn emit(sink: Option<&dyn ProgressSink>, event: ProgressEvent) {
    if let Some(sink) = sink {
        sink.emit(event);
    }
}

/// Plans and runs `workflow` end to end. Stages always execute strictly
/// sequentially in topological order, even when the DAG has independent
/// branches — fan-out happens *within* a stage (e.g. `ParallelQueryStage`
/// querying several models), never *across* stages.
pub async fn execute(
    workflow: &WorkflowDefinition,
    user_query: impl Into<String>,
    services: WorkflowServices,
    sink: Option<&dyn ProgressSink>,
    cancellation: Option<&AtomicBool>,
) -> Result<WorkflowResult, WorkflowError> {
    let started_at = Utc::now();
    let start = Instant::now();

    let ordered = plan(workflow).await?;
    let mut ctx = WorkflowContext::new(user_query, services);

    for stage in &ordered {
        if cancellation.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            return Err(StageExecutionError::new(stage.id(), "workflow cancelled").into());
        }

        emit(
            sink,
            ProgressEvent::StageStart {
                stage_id: stage.id().to_string(),
                t: Utc::now(),
            },
        );

        let dependencies = ctx
            .get_results(stage.dependencies())
            .map_err(WorkflowError::Stage)?;

        match stage.execute(&ctx, &dependencies).await {
            Ok(result) => {
                emit(
                    sink,
                    ProgressEvent::StageComplete {
                        stage_id: stage.id().to_string(),
                        data: result.as_json().clone(),
                        metadata: result.metadata.clone(),
                        t: Utc::now(),
                    },
                );
                ctx = ctx.with_stage_result(stage.id().to_string(), result);
            }
            Err(error) => {
                emit(
                    sink,
                    ProgressEvent::StageError {
                        stage_id: stage.id().to_string(),
                        error: error.message.clone(),
                        t: Utc::now(),
                    },
                );
                return Err(error.into());
            }
        }
    }

    let summary = json!({ "stagesCompleted": ordered.len() });
    emit(
        sink,
        ProgressEvent::WorkflowComplete {
            summary: summary.clone(),
            t: Utc::now(),
        },
    );

    Ok(WorkflowResult {
        workflow_id: workflow.id.clone(),
        workflow_version: workflow.version.clone(),
        stage_results: ctx.stage_results_snapshot(),
        metadata: summary,
        execution_time_ms: start.elapsed().as_millis() as u64,
        started_at,
        completed_at: Utc::now(),
    })
}

// Re-exported so callers matching on definition errors don't need to reach
// into `super::dag` directly.
pub use super::dag::WorkflowDefinitionError as DefinitionError;
