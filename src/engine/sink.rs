//! Progress Sink (C10): the executor's event output. `SseSink` encodes each
//! event as a `data: <json>\n\n` frame, the standard Server-Sent Events
//! wire convention.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ProgressEvent {
    #[serde(rename = "stage_start")]
    StageStart {
        #[serde(rename = "stageId")]
        stage_id: String,
        t: DateTime<Utc>,
    },
    #[serde(rename = "stage_complete")]
    StageComplete {
        #[serde(rename = "stageId")]
        stage_id: String,
        data: Value,
        metadata: Option<Value>,
        t: DateTime<Utc>,
    },
    #[serde(rename = "stage_error")]
    StageError {
        #[serde(rename = "stageId")]
        stage_id: String,
        error: String,
        t: DateTime<Utc>,
    },
    #[serde(rename = "workflow_complete")]
    WorkflowComplete { summary: Value, t: DateTime<Utc> },
}

impl ProgressEvent {
    fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::WorkflowComplete { .. })
    }

    pub fn to_sse_frame(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("data: {json}\n\n")
    }
}

/// Receives ordered progress events as a workflow executes. Implementations
/// must not block the executor for long; `SseSink` only ever does a
/// non-blocking channel send (except for the terminal event, which it
/// guarantees delivery of even under backpressure).
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Discards every event. Used by non-streaming callers and in tests.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Streams events to an Axum SSE body over an mpsc channel.
pub struct SseSink {
    tx: mpsc::Sender<String>,
}

impl SseSink {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for SseSink {
    fn emit(&self, event: ProgressEvent) {
        let frame = event.to_sse_frame();
        if event.is_terminal() {
            // The terminal event must reach the client even if the channel
            // is momentarily full; a dropped `workflow_complete` would leave
            // a stream open with no way for the client to know it finished.
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(frame).await;
            });
        } else {
            let _ = self.tx.try_send(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stage_start_encodes_as_single_sse_frame() {
        let event = ProgressEvent::StageStart {
            stage_id: "parallel-query".to_string(),
            t: Utc::now(),
        };
        let frame = event.to_sse_frame();
        assert!(frame.starts_with("data: "));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("\"type\":\"stage_start\""));
        assert!(frame.contains("\"stageId\":\"parallel-query\""));
    }

    #[test]
    fn workflow_complete_is_terminal() {
        let event = ProgressEvent::WorkflowComplete {
            summary: json!({"stagesCompleted": 3}),
            t: Utc::now(),
        };
        assert!(event.is_terminal());
        let stage_event = ProgressEvent::StageStart {
            stage_id: "s".to_string(),
            t: Utc::now(),
        };
        assert!(!stage_event.is_terminal());
    }

    #[tokio::test]
    async fn sse_sink_forwards_frames_through_channel() {
        let (tx, mut rx) = mpsc::channel(8);
        let sink = SseSink::new(tx);
        sink.emit(ProgressEvent::StageStart {
            stage_id: "s1".to_string(),
            t: Utc::now(),
        });
        let frame = rx.recv().await.unwrap();
        assert!(frame.contains("stage_start"));
    }

    #[test]
    fn null_sink_discards_everything() {
        let sink = NullSink;
        sink.emit(ProgressEvent::StageError {
            stage_id: "s1".to_string(),
            error: "boom".to_string(),
            t: Utc::now(),
        });
    }
}
