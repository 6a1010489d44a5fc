//! HTTP error taxonomy (§7): maps every collaborator error type this
//! service produces onto the status codes the external interface promises,
//! the same `#[from]`-per-collaborator shape `PipelineError` already uses
//! for transport-level errors.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::engine::dag::{WorkflowDefinitionError, WorkflowError};
use crate::engine::stage::StageExecutionError;
use crate::engine::template::TemplateError;
use crate::llm::client::UpstreamError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("missing authorization token")]
    MissingToken,
    #[error("invalid authorization token")]
    InvalidToken,

    #[error("caller does not own {resource} {resource_id}")]
    Forbidden { resource: &'static str, resource_id: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Stage(#[from] StageExecutionError),

    #[error(transparent)]
    Definition(#[from] WorkflowDefinitionError),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl From<WorkflowError> for ApiError {
    fn from(e: WorkflowError) -> Self {
        match e {
            WorkflowError::Definition(e) => ApiError::Definition(e),
            WorkflowError::Stage(e) => ApiError::Stage(e),
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::MissingToken | ApiError::InvalidToken => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden { .. } => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Storage(StorageError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Upstream(UpstreamError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Upstream(UpstreamError::Http { status, .. }) if *status >= 500 => {
                StatusCode::BAD_GATEWAY
            }
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Template(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Stage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Definition(WorkflowDefinitionError::MissingDependency { .. }) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Definition(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "unhandled error");
            return (status, Json(json!({ "error": "Internal server error" }))).into_response();
        }

        let mut response = (status, Json(json!({ "error": self.to_string() }))).into_response();
        if let ApiError::RateLimited { retry_after_secs } = &self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
