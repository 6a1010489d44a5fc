//! The Workflow Engine: a reusable DAG-based stage executor.
//!
//! Validates and topologically orders stages (`dag`), threads an evolving
//! execution context through them (`context`), fans out to unreliable
//! upstream providers from inside each stage, emits ordered progress events
//! while execution proceeds (`sink`), and composes with request-scoped
//! cross-cutting concerns from the HTTP layer above it.

pub mod context;
pub mod dag;
pub mod executor;
pub mod ranking;
pub mod registry;
pub mod sink;
pub mod stage;
pub mod stages;
pub mod template;

pub use context::{WorkflowContext, WorkflowServices};
pub use dag::{plan, WorkflowDefinitionError, WorkflowError};
pub use executor::{execute, WorkflowResult};
pub use registry::{DagView, WorkflowDefinition, WorkflowRegistry};
pub use sink::{NullSink, ProgressEvent, ProgressSink, SseSink};
pub use stage::{Stage, StageExecutionError, StageResult};
