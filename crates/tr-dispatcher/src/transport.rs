//! Wire messages exchanged with the remote worker over its websocket, and
//! the execution descriptor the Dispatch Loop assembles for `EXECUTE_RUNS`.
//!
//! The socket framing and JSON (de)serialization of the envelope itself are
//! out of scope here; this module only models the payload shapes the core
//! logic reads and writes.

use crate::model::{AttemptStatus, BackgroundWorkerTask, EnvironmentType, TaskRun, TaskRunAttempt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Messages the worker sends to this dispatcher.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    #[serde(rename = "READY_FOR_TASKS")]
    ReadyForTasks { background_worker_id: String },
    #[serde(rename = "BACKGROUND_WORKER_MESSAGE")]
    BackgroundWorkerMessage {
        background_worker_id: String,
        data: WorkerMessage,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    #[serde(rename = "TASK_RUN_COMPLETED")]
    TaskRunCompleted {
        completion: Completion,
        execution: serde_json::Value,
    },
    #[serde(rename = "TASK_HEARTBEAT")]
    TaskHeartbeat { id: String },
}

/// `{ok:true, output, outputType}` or `{ok:false, error, retry?}`. Not
/// structurally tagged on the wire, so this deserializes the flat shape and
/// leaves the two cases to be distinguished by `ok`.
#[derive(Debug, Clone, Deserialize)]
pub struct Completion {
    pub ok: bool,
    pub output: Option<serde_json::Value>,
    #[serde(rename = "outputType")]
    pub output_type: Option<String>,
    pub error: Option<String>,
    pub retry: Option<RetryRequest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryRequest {
    pub timestamp: DateTime<Utc>,
}

/// Messages this dispatcher sends to the worker.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "BACKGROUND_WORKER_MESSAGE")]
    BackgroundWorkerMessage {
        #[serde(rename = "backgroundWorkerId")]
        background_worker_id: String,
        data: ExecuteRunsData,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename = "EXECUTE_RUNS")]
pub struct ExecuteRunsData {
    pub payloads: Vec<ExecuteRunPayload>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteRunPayload {
    pub execution: ExecutionDescriptor,
    #[serde(rename = "traceContext")]
    pub trace_context: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionDescriptor {
    pub task: TaskDescriptor,
    pub attempt: AttemptDescriptor,
    pub run: RunDescriptor,
    pub queue: QueueDescriptor,
    pub environment: EnvironmentDescriptor,
    pub organization: OrganizationDescriptor,
    pub project: ProjectDescriptor,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskDescriptor {
    pub id: String,
    #[serde(rename = "filePath")]
    pub file_path: String,
    #[serde(rename = "exportName")]
    pub export_name: String,
}

impl From<&BackgroundWorkerTask> for TaskDescriptor {
    fn from(task: &BackgroundWorkerTask) -> Self {
        Self {
            id: task.task_id.to_string(),
            file_path: task.file_path.clone(),
            export_name: task.export_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptDescriptor {
    pub id: String,
    pub number: u32,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "backgroundWorkerId")]
    pub background_worker_id: String,
    #[serde(rename = "backgroundWorkerTaskId")]
    pub background_worker_task_id: String,
    pub status: AttemptStatus,
}

impl AttemptDescriptor {
    pub fn from_attempt(attempt: &TaskRunAttempt, friendly_worker_id: &str) -> Self {
        Self {
            id: attempt.friendly_attempt_id.clone(),
            number: attempt.number,
            started_at: attempt.started_at,
            background_worker_id: friendly_worker_id.to_string(),
            background_worker_task_id: attempt.background_worker_task_id.to_string(),
            status: attempt.status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunDescriptor {
    pub id: String,
    pub payload: serde_json::Value,
    #[serde(rename = "payloadType")]
    pub payload_type: String,
    pub context: serde_json::Value,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub tags: Vec<String>,
}

impl RunDescriptor {
    pub fn from_run(run: &TaskRun, tags: Vec<String>) -> Self {
        Self {
            id: run.friendly_run_id.clone(),
            payload: run.payload.clone(),
            payload_type: run.payload_type.clone(),
            context: run.context.clone(),
            created_at: run.created_at,
            tags,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueDescriptor {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentDescriptor {
    pub id: String,
    pub slug: String,
    #[serde(rename = "type")]
    pub environment_type: EnvironmentType,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrganizationDescriptor {
    pub id: String,
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectDescriptor {
    pub id: String,
    #[serde(rename = "ref")]
    pub project_ref: String,
    pub slug: String,
    pub name: String,
}

/// The outbound side of a send: implemented by whatever owns the websocket
/// connection. Kept as a trait so the Dispatch Loop can be driven against a
/// fake in tests without a real socket.
#[async_trait::async_trait]
pub trait WorkerTransport: Send + Sync {
    async fn send_execute_runs(
        &self,
        friendly_worker_id: &str,
        payload: ExecuteRunPayload,
    ) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_completed_success() {
        let raw = serde_json::json!({
            "type": "TASK_RUN_COMPLETED",
            "completion": {"ok": true, "output": {"sent": true}, "outputType": "json"},
            "execution": {}
        });
        let parsed: WorkerMessage = serde_json::from_value(raw).unwrap();
        match parsed {
            WorkerMessage::TaskRunCompleted { completion, .. } => {
                assert!(completion.ok);
                assert!(completion.retry.is_none());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parses_completed_retry() {
        let raw = serde_json::json!({
            "type": "TASK_RUN_COMPLETED",
            "completion": {"ok": false, "error": "boom", "retry": {"timestamp": "2026-01-01T00:00:00Z"}},
            "execution": {}
        });
        let parsed: WorkerMessage = serde_json::from_value(raw).unwrap();
        match parsed {
            WorkerMessage::TaskRunCompleted { completion, .. } => {
                assert!(!completion.ok);
                assert!(completion.retry.is_some());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parses_heartbeat() {
        let raw = serde_json::json!({"type": "TASK_HEARTBEAT", "id": "attempt_123"});
        let parsed: WorkerMessage = serde_json::from_value(raw).unwrap();
        matches!(parsed, WorkerMessage::TaskHeartbeat { .. });
    }
}
