//! External collaborators the dispatch loop and completion handler depend
//! on, expressed as async traits so the core logic is testable against
//! in-memory fakes (see [`crate::memory`]) without a real broker or database.

use crate::model::{
    AuthenticatedEnvironment, BackgroundWorkerVersion, QueueMessage, TaskQueue, TaskRun,
    TaskRunAttempt,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tr_common::error::Result;
use uuid::Uuid;

/// Dequeue/ack/nack/heartbeat on a per-environment logical queue.
///
/// Implementations must not make two messages for the same `run_id`
/// simultaneously visible, so attempt numbering stays strictly increasing
/// per run.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Return the next visible message for this environment's queue, if any.
    async fn dequeue(&self, environment: &AuthenticatedEnvironment) -> Result<Option<QueueMessage>>;

    /// Remove a message permanently.
    async fn ack(&self, message_id: Uuid) -> Result<()>;

    /// Return a message to visibility. `visible_at` of `None` means
    /// "redeliver as soon as possible"; `Some(t)` hides it until `t`.
    async fn nack(&self, message_id: Uuid, visible_at: Option<DateTime<Utc>>) -> Result<()>;

    /// Extend the in-flight visibility timeout of a dequeued message.
    async fn heartbeat(&self, message_id: Uuid, extend_by: Duration) -> Result<()>;
}

/// Outcome of locking a run for dispatch: the run's last attempt (if any)
/// and its tags, fetched in the same read as the lock update.
pub struct LockedRun {
    pub last_attempt: Option<TaskRunAttempt>,
    pub tags: Vec<String>,
}

/// The relational CRUD surface over runs, attempts, workers, and queues.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_task_run(&self, run_id: Uuid) -> Result<Option<TaskRun>>;

    /// Atomically set `locked_at`/`locked_by_task_id` and return the run's
    /// last attempt (by descending `number`) plus its tags, in one
    /// critical section. Returns `Ok(None)` if the run no longer exists.
    async fn lock_task_run(&self, run_id: Uuid, locked_by_task_id: Uuid) -> Result<Option<LockedRun>>;

    /// Undo a lock taken by `lock_task_run`, used for transport-failure
    /// rollback. No-op if the run is already unlocked.
    async fn unlock_task_run(&self, run_id: Uuid) -> Result<()>;

    async fn get_task_queue(&self, environment_id: Uuid, name: &str) -> Result<Option<TaskQueue>>;

    async fn create_attempt(&self, attempt: TaskRunAttempt) -> Result<()>;

    /// Roll back attempt creation, used alongside `unlock_task_run`.
    async fn delete_attempt(&self, attempt_id: Uuid) -> Result<()>;

    async fn update_attempt_completed(
        &self,
        attempt_id: Uuid,
        output: serde_json::Value,
        output_type: String,
    ) -> Result<()>;

    async fn update_attempt_failed(&self, attempt_id: Uuid, error: String) -> Result<()>;

    async fn get_attempt_by_friendly_id(&self, friendly_attempt_id: &str) -> Result<Option<TaskRunAttempt>>;

    async fn get_worker_by_friendly_id(
        &self,
        environment_id: Uuid,
        friendly_worker_id: &str,
    ) -> Result<Option<BackgroundWorkerVersion>>;
}
