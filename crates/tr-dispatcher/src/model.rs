//! Data model shared by every component: tenant context, the worker-version
//! bundle registered by a connection, and the persistent run/attempt/queue
//! rows the dispatcher reads and writes through the `Store` contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tenant context for one connection. Immutable for the connection's lifetime
/// and identifies the logical queue the dispatcher pulls from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedEnvironment {
    pub environment_id: Uuid,
    pub environment_slug: String,
    pub environment_type: EnvironmentType,
    pub organization_id: Uuid,
    pub organization_slug: String,
    pub organization_name: String,
    pub project_id: Uuid,
    pub project_ref: String,
    pub project_slug: String,
    pub project_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentType {
    Production,
    Staging,
    Development,
}

/// A versioned task bundle a remote worker has loaded, registered by message
/// and held in memory only for the connection that registered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundWorkerVersion {
    pub worker_id: Uuid,
    pub friendly_worker_id: String,
    /// `YYYYMMDD.N`. Comparable via [`compare_versions`], not raw string order.
    pub version: String,
    pub tasks: Vec<BackgroundWorkerTask>,
}

impl BackgroundWorkerVersion {
    /// Find a registered task by slug.
    pub fn find_task(&self, slug: &str) -> Option<&BackgroundWorkerTask> {
        self.tasks.iter().find(|t| t.slug == slug)
    }

    pub fn find_task_by_id(&self, task_id: Uuid) -> Option<&BackgroundWorkerTask> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundWorkerTask {
    pub task_id: Uuid,
    /// Unique within the owning worker version.
    pub slug: String,
    pub file_path: String,
    pub export_name: String,
    pub retry_config: Option<RetryConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub factor: f64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub randomize: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            factor: 2.0,
            min_timeout_ms: 1_000,
            max_timeout_ms: 30_000,
            randomize: true,
        }
    }
}

/// Persistent task-run row. `run_id` doubles as the queue message id.
///
/// Invariant: `locked_at.is_some() == locked_by_task_id.is_some()`.
/// Invariant: once set, `locked_to_version_id` never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub run_id: Uuid,
    pub friendly_run_id: String,
    pub task_identifier: String,
    pub queue_name: String,
    pub payload: serde_json::Value,
    pub payload_type: String,
    pub context: serde_json::Value,
    pub trace_context: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub tags: Vec<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by_task_id: Option<Uuid>,
    /// A pin to a specific worker version; immutable once set.
    pub locked_to_version_id: Option<Uuid>,
}

impl TaskRun {
    pub fn is_locked(&self) -> bool {
        debug_assert_eq!(self.locked_at.is_some(), self.locked_by_task_id.is_some());
        self.locked_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Executing,
    Completed,
    Failed,
}

/// Persistent execution attempt. Invariant: at most one attempt per run has
/// status `Executing`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunAttempt {
    pub attempt_id: Uuid,
    pub friendly_attempt_id: String,
    pub run_id: Uuid,
    /// 1-based, strictly increasing per run.
    pub number: u32,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    pub output_type: Option<String>,
    pub error: Option<String>,
    pub queue_id: Uuid,
    pub background_worker_id: Uuid,
    pub background_worker_task_id: Uuid,
}

/// Persistent queue row, unique by `(environment_id, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskQueue {
    pub queue_id: Uuid,
    pub friendly_queue_id: String,
    pub name: String,
    pub environment_id: Uuid,
}

/// Transient queue message. `message_id` equals the run's `run_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub message_id: Uuid,
    pub data: serde_json::Value,
}

/// Parses `message.data` into the tagged-variant schema. Unknown
/// discriminators are poison messages, handled by acking without dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum QueuePayload {
    #[serde(rename = "EXECUTE")]
    Execute {
        #[serde(rename = "taskIdentifier")]
        task_identifier: String,
    },
}

/// Parse a raw queue payload, returning `None` for any unrecognized shape
/// (missing `type`, or a `type` this dispatcher doesn't understand) rather
/// than failing — both cases are poison messages to the caller.
pub fn parse_queue_payload(data: &serde_json::Value) -> Option<QueuePayload> {
    serde_json::from_value(data.clone()).ok()
}

/// Compares `YYYYMMDD.N` version strings by their two dotted segments as
/// integers, not lexicographically. A plain string compare would rank
/// `20240101.10` before `20240101.2`; this fixes that.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    fn parts(v: &str) -> (u64, u64) {
        let mut split = v.splitn(2, '.');
        let major = split.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let minor = split.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        (major, minor)
    }
    parts(a).cmp(&parts(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn version_compare_treats_segments_numerically() {
        assert_eq!(
            compare_versions("20240101.10", "20240101.2"),
            Ordering::Greater
        );
        assert_eq!(
            compare_versions("20240101.2", "20240101.10"),
            Ordering::Less
        );
        assert_eq!(
            compare_versions("20240101.1", "20240101.1"),
            Ordering::Equal
        );
        assert_eq!(
            compare_versions("20240102.1", "20240101.9"),
            Ordering::Greater
        );
    }

    #[test]
    fn parse_known_payload() {
        let data = serde_json::json!({"type": "EXECUTE", "taskIdentifier": "send-email"});
        assert_eq!(
            parse_queue_payload(&data),
            Some(QueuePayload::Execute {
                task_identifier: "send-email".to_string()
            })
        );
    }

    #[test]
    fn parse_unknown_payload_is_poison() {
        let data = serde_json::json!({"type": "UNKNOWN"});
        assert_eq!(parse_queue_payload(&data), None);
    }
}
