//! Stage (C3): the executor's unit of work. Every concrete stage under
//! `stages/` implements this trait; the executor only ever talks to
//! `dyn Stage` objects discovered through a [`WorkflowDefinition`].

use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::context::WorkflowContext;

/// A stage's typed output, erased to `dyn Any` so the executor can hold
/// heterogeneous results from different stages in one map. Stages recover
/// their dependencies' concrete types with [`StageResult::downcast`].
#[derive(Clone)]
pub struct StageResult {
    data: Arc<dyn Any + Send + Sync>,
    json: Value,
    pub metadata: Option<Value>,
}

impl StageResult {
    /// Wraps a stage's typed output. `T` must be `Serialize` so the value can
    /// be surfaced verbatim in a `stage_complete` progress event without the
    /// executor needing to know its concrete type.
    pub fn new<T>(data: T, metadata: Option<Value>) -> Self
    where
        T: serde::Serialize + Send + Sync + 'static,
    {
        let json = serde_json::to_value(&data).unwrap_or(Value::Null);
        Self {
            data: Arc::new(data),
            json,
            metadata,
        }
    }

    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }

    pub fn as_json(&self) -> &Value {
        &self.json
    }
}

impl fmt::Debug for StageResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageResult")
            .field("data", &self.json)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Raised by a stage's `validate` or `execute`. Carries the failing stage's
/// id so the executor and HTTP layer can attribute it precisely.
#[derive(Debug, Error)]
#[error("stage '{stage_id}' failed: {message}")]
pub struct StageExecutionError {
    pub stage_id: String,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl StageExecutionError {
    pub fn new(stage_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(
        stage_id: impl Into<String>,
        message: impl Into<String>,
        cause: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }
}

/// A single step of a workflow. Stages declare their dependencies up front
/// so the engine can validate and order the workflow before anything runs.
#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn stage_type(&self) -> &str;
    fn dependencies(&self) -> &HashSet<String>;

    /// Cheap, side-effect-free sanity check run once per plan, before any
    /// stage executes (e.g. a referenced template fails to parse).
    async fn validate(&self) -> Result<(), StageExecutionError>;

    async fn execute(
        &self,
        ctx: &WorkflowContext,
        dependencies: &HashMap<String, StageResult>,
    ) -> Result<StageResult, StageExecutionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Payload {
        value: u32,
    }

    #[test]
    fn downcast_recovers_concrete_type() {
        let result = StageResult::new(Payload { value: 7 }, None);
        assert_eq!(result.downcast::<Payload>().unwrap().value, 7);
        assert!(result.downcast::<String>().is_none());
    }

    #[test]
    fn as_json_mirrors_serialized_value() {
        let result = StageResult::new(Payload { value: 7 }, None);
        assert_eq!(result.as_json()["value"], 7);
    }

    #[test]
    fn with_cause_chains_source_error() {
        let source = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = StageExecutionError::with_cause("s1", "wrapped", source);
        assert!(err.cause.is_some());
        assert_eq!(err.stage_id, "s1");
    }
}
