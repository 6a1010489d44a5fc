//! Route handlers (§6). Non-streaming routes talk to the conversation store
//! directly; the execute route drives the executor (C6) and turns its
//! progress events into an SSE body.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

use crate::engine::context::WorkflowServices;
use crate::engine::executor::execute;
use crate::engine::sink::SseSink;
use crate::engine::stages::parallel_query::{ParallelQueryOutput, ParallelQueryStage};
use crate::engine::stages::peer_ranking::{PeerRankingOutput, PeerRankingStage};
use crate::engine::stages::synthesis::{SynthesisOutput, SynthesisStage};
use crate::ratelimit::Policy;
use crate::storage::{Conversation, Stage1Entry, Stage2Entry, Stage3Entry};

use super::auth::UserIdentity;
use super::error::{ApiError, ApiResult};
use super::AppState;

fn retry_after_secs(window_ms: u64) -> u64 {
    (window_ms + 999) / 1000
}

fn check_rate_limit(state: &AppState, identity: &UserIdentity, policy: Policy) -> ApiResult<()> {
    if state.rate_limiter.check_and_increment(policy, &identity.user_id) {
        Ok(())
    } else {
        Err(ApiError::RateLimited {
            retry_after_secs: retry_after_secs(state.config.rate_limit_window_ms),
        })
    }
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "LLM Council API" }))
}

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    identity: UserIdentity,
) -> ApiResult<impl IntoResponse> {
    check_rate_limit(&state, &identity, Policy::Api)?;
    let conversations = state.storage.list_by_user(&identity.user_id).await?;
    Ok(Json(conversations))
}

pub async fn create_conversation(
    State(state): State<Arc<AppState>>,
    identity: UserIdentity,
) -> ApiResult<impl IntoResponse> {
    check_rate_limit(&state, &identity, Policy::Api)?;
    let conversation = Conversation::new(crate::storage::new_conversation_id(), &identity.user_id);
    let created = state.storage.create(conversation).await?;
    Ok(Json(created))
}

async fn owned_conversation(
    state: &AppState,
    identity: &UserIdentity,
    id: &str,
) -> ApiResult<Conversation> {
    let conversation = state.storage.get(id).await?;
    if conversation.user_id != identity.user_id {
        return Err(ApiError::Forbidden {
            resource: "conversation",
            resource_id: id.to_string(),
        });
    }
    Ok(conversation)
}

pub async fn get_conversation(
    State(state): State<Arc<AppState>>,
    identity: UserIdentity,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    check_rate_limit(&state, &identity, Policy::Api)?;
    let conversation = owned_conversation(&state, &identity, &id).await?;
    Ok(Json(conversation))
}

pub async fn list_workflows(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.list())
}

pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let workflow = state
        .registry
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("workflow '{id}'")))?;
    let dag = state.registry.to_dag(&id);
    Ok(Json(json!({
        "id": workflow.id,
        "name": workflow.name,
        "version": workflow.version,
        "description": workflow.description,
        "dag": dag,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub content: String,
    #[serde(rename = "workflowId")]
    pub workflow_id: String,
}

/// Sets a shared cancellation flag when dropped, regardless of whether the
/// wrapped stream ran to completion. Wrapping the SSE body stream in this
/// lets the executor (C6) learn about a client disconnect — hyper drops the
/// response body's stream as soon as the connection goes away, without
/// polling it to exhaustion first.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

struct CancelGuardedStream<S> {
    inner: S,
    _guard: CancelOnDrop,
}

impl<S: Stream + Unpin> Stream for CancelGuardedStream<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_next(cx)
    }
}

fn validate_execute_request(req: &ExecuteRequest) -> ApiResult<()> {
    if req.content.is_empty() || req.content.chars().count() > 100_000 {
        return Err(ApiError::Validation(
            "content must be 1..100000 characters".to_string(),
        ));
    }
    if req.workflow_id.is_empty() || req.workflow_id.chars().count() > 255 {
        return Err(ApiError::Validation(
            "workflowId must be 1..255 characters".to_string(),
        ));
    }
    Ok(())
}

pub async fn execute_stream(
    State(state): State<Arc<AppState>>,
    identity: UserIdentity,
    Path(id): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> ApiResult<Response> {
    check_rate_limit(&state, &identity, Policy::Api)?;
    check_rate_limit(&state, &identity, Policy::WorkflowExecution)?;
    validate_execute_request(&req)?;

    owned_conversation(&state, &identity, &id).await?;
    let workflow = state
        .registry
        .get(&req.workflow_id)
        .ok_or_else(|| ApiError::NotFound(format!("workflow '{}'", req.workflow_id)))?;

    state.storage.append_user_message(&id, req.content.clone()).await?;

    let (tx, rx) = tokio::sync::mpsc::channel::<String>(32);
    let sink = SseSink::new(tx);
    let services = WorkflowServices {
        llm: state.llm.clone(),
        storage: state.storage.clone(),
        config: state.config.clone(),
        templates: state.templates.clone(),
    };
    let storage = state.storage.clone();
    let conversation_id = id.clone();
    let content = req.content.clone();
    let cancellation = Arc::new(AtomicBool::new(false));
    let cancellation_for_task = cancellation.clone();

    tokio::spawn(async move {
        let cancellation = cancellation_for_task;
        match execute(&workflow, content, services, Some(&sink), Some(cancellation.as_ref())).await {
            Ok(result) => {
                let stage1 = result
                    .stage_result::<ParallelQueryOutput>(ParallelQueryStage::ID)
                    .map(|o| {
                        o.queries
                            .iter()
                            .map(|q| Stage1Entry {
                                model: q.model.clone(),
                                response: q.response.clone(),
                            })
                            .collect::<Vec<_>>()
                    });
                let stage2 = result
                    .stage_result::<PeerRankingOutput>(PeerRankingStage::ID)
                    .map(|o| {
                        o.rankings
                            .iter()
                            .map(|r| Stage2Entry {
                                model: r.model.clone(),
                                ranking: r.raw_evaluation.clone(),
                                parsed_ranking: r.parsed_ranking.clone(),
                            })
                            .collect::<Vec<_>>()
                    });
                let stage3 = result
                    .stage_result::<SynthesisOutput>(SynthesisStage::ID)
                    .map(|o| Stage3Entry {
                        model: o.chairman_model.clone(),
                        response: o.final_answer.clone(),
                    });
                if let (Some(stage1), Some(stage2), Some(stage3)) = (stage1, stage2, stage3) {
                    let _ = storage
                        .append_assistant_message(&conversation_id, stage1, stage2, stage3)
                        .await;
                }
            }
            Err(error) => {
                tracing::warn!(%error, conversation_id = %conversation_id, "workflow execution failed");
            }
        }
    });

    let stream = CancelGuardedStream {
        inner: ReceiverStream::new(rx).map(Ok::<_, Infallible>),
        _guard: CancelOnDrop(cancellation),
    };
    let body = Body::from_stream(stream);
    Ok(Response::builder()
        .status(200)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(body)
        .expect("static SSE response headers are always valid"))
}
