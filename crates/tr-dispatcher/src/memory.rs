//! In-memory `QueueClient`, `Store`, `TraceRecorder`, and `WorkerTransport`
//! implementations used by the demo binary and the scenario tests. None of
//! this is meant to be production-grade; it exists to exercise the core
//! logic without a real broker, database, or socket.

use crate::contracts::{LockedRun, QueueClient, Store};
use crate::model::{AuthenticatedEnvironment, BackgroundWorkerVersion, QueueMessage, TaskQueue, TaskRun, TaskRunAttempt};
use crate::trace_recorder::{TraceRecorder, WindowSpan};
use crate::transport::{ExecuteRunPayload, WorkerTransport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tr_common::error::{DispatchError, Result};
use uuid::Uuid;

#[derive(Clone)]
struct Envelope {
    message: QueueMessage,
    visible_at: Option<DateTime<Utc>>,
}

/// A queue backed by a plain deque plus an in-flight table. `dequeue` moves
/// a message out of the deque into the in-flight table so it's not handed
/// to a second caller; `ack` drops it from there, `nack` reinserts it into
/// the deque (optionally hidden until `visible_at`), and `heartbeat` is a
/// no-op since nothing here ever times out a message on its own.
pub struct InMemoryQueue {
    messages: Mutex<VecDeque<Envelope>>,
    in_flight: Mutex<HashMap<Uuid, QueueMessage>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn enqueue(&self, message: QueueMessage) {
        self.messages.lock().push_back(Envelope {
            message,
            visible_at: None,
        });
    }

    /// Messages currently visible or in flight.
    pub fn len(&self) -> usize {
        self.messages.lock().len() + self.in_flight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn dequeue(&self, _environment: &AuthenticatedEnvironment) -> Result<Option<QueueMessage>> {
        let now = Utc::now();
        let message = {
            let mut messages = self.messages.lock();
            let position = messages
                .iter()
                .position(|envelope| envelope.visible_at.map(|t| t <= now).unwrap_or(true));
            position.map(|index| messages.remove(index).unwrap().message)
        };
        if let Some(message) = &message {
            self.in_flight.lock().insert(message.message_id, message.clone());
        }
        Ok(message)
    }

    async fn ack(&self, message_id: Uuid) -> Result<()> {
        self.in_flight.lock().remove(&message_id);
        self.messages
            .lock()
            .retain(|envelope| envelope.message.message_id != message_id);
        Ok(())
    }

    async fn nack(&self, message_id: Uuid, visible_at: Option<DateTime<Utc>>) -> Result<()> {
        let message = self.in_flight.lock().remove(&message_id);
        let message = match message {
            Some(message) => message,
            None => {
                let mut messages = self.messages.lock();
                match messages
                    .iter()
                    .position(|envelope| envelope.message.message_id == message_id)
                {
                    Some(index) => messages.remove(index).unwrap().message,
                    None => return Err(DispatchError::Queue(format!("no such message {message_id}"))),
                }
            }
        };
        self.messages.lock().push_back(Envelope { message, visible_at });
        Ok(())
    }

    async fn heartbeat(&self, _message_id: Uuid, _extend_by: Duration) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct StoreState {
    runs: std::collections::HashMap<Uuid, TaskRun>,
    attempts: std::collections::HashMap<Uuid, TaskRunAttempt>,
    queues: std::collections::HashMap<(Uuid, String), TaskQueue>,
    workers: std::collections::HashMap<(Uuid, String), BackgroundWorkerVersion>,
}

/// Single-environment in-memory relational store.
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn insert_run(&self, run: TaskRun) {
        self.state.lock().runs.insert(run.run_id, run);
    }

    pub fn insert_queue(&self, queue: TaskQueue) {
        self.state
            .lock()
            .queues
            .insert((queue.environment_id, queue.name.clone()), queue);
    }

    pub fn insert_worker(&self, environment_id: Uuid, version: BackgroundWorkerVersion) {
        self.state
            .lock()
            .workers
            .insert((environment_id, version.friendly_worker_id.clone()), version);
    }

    pub fn attempt_count(&self, run_id: Uuid) -> usize {
        self.state
            .lock()
            .attempts
            .values()
            .filter(|a| a.run_id == run_id)
            .count()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_task_run(&self, run_id: Uuid) -> Result<Option<TaskRun>> {
        Ok(self.state.lock().runs.get(&run_id).cloned())
    }

    async fn lock_task_run(&self, run_id: Uuid, locked_by_task_id: Uuid) -> Result<Option<LockedRun>> {
        let mut state = self.state.lock();
        let tags = match state.runs.get(&run_id) {
            Some(run) => run.tags.clone(),
            None => return Ok(None),
        };
        let last_attempt = state
            .attempts
            .values()
            .filter(|a| a.run_id == run_id)
            .max_by_key(|a| a.number)
            .cloned();
        if let Some(run) = state.runs.get_mut(&run_id) {
            run.locked_at = Some(Utc::now());
            run.locked_by_task_id = Some(locked_by_task_id);
        }
        Ok(Some(LockedRun { last_attempt, tags }))
    }

    async fn unlock_task_run(&self, run_id: Uuid) -> Result<()> {
        if let Some(run) = self.state.lock().runs.get_mut(&run_id) {
            run.locked_at = None;
            run.locked_by_task_id = None;
        }
        Ok(())
    }

    async fn get_task_queue(&self, environment_id: Uuid, name: &str) -> Result<Option<TaskQueue>> {
        Ok(self
            .state
            .lock()
            .queues
            .get(&(environment_id, name.to_string()))
            .cloned())
    }

    async fn create_attempt(&self, attempt: TaskRunAttempt) -> Result<()> {
        self.state.lock().attempts.insert(attempt.attempt_id, attempt);
        Ok(())
    }

    async fn delete_attempt(&self, attempt_id: Uuid) -> Result<()> {
        self.state.lock().attempts.remove(&attempt_id);
        Ok(())
    }

    async fn update_attempt_completed(
        &self,
        attempt_id: Uuid,
        output: serde_json::Value,
        output_type: String,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(attempt) = state.attempts.get_mut(&attempt_id) {
            attempt.status = crate::model::AttemptStatus::Completed;
            attempt.output = Some(output);
            attempt.output_type = Some(output_type);
            attempt.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn update_attempt_failed(&self, attempt_id: Uuid, error: String) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(attempt) = state.attempts.get_mut(&attempt_id) {
            attempt.status = crate::model::AttemptStatus::Failed;
            attempt.error = Some(error);
            attempt.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn get_attempt_by_friendly_id(&self, friendly_attempt_id: &str) -> Result<Option<TaskRunAttempt>> {
        Ok(self
            .state
            .lock()
            .attempts
            .values()
            .find(|a| a.friendly_attempt_id == friendly_attempt_id)
            .cloned())
    }

    async fn get_worker_by_friendly_id(
        &self,
        environment_id: Uuid,
        friendly_worker_id: &str,
    ) -> Result<Option<BackgroundWorkerVersion>> {
        Ok(self
            .state
            .lock()
            .workers
            .get(&(environment_id, friendly_worker_id.to_string()))
            .cloned())
    }
}

/// Collects every window span opened/closed and retry event recorded, for
/// assertions in tests.
#[derive(Default)]
pub struct CollectingTraceRecorder {
    pub closed_windows: std::sync::Arc<Mutex<Vec<(u64, u64)>>>,
    pub exceptions: std::sync::Arc<Mutex<Vec<String>>>,
    pub retry_events: Mutex<Vec<String>>,
}

struct CollectingSpan {
    exceptions: std::sync::Arc<Mutex<Vec<String>>>,
    closed_windows: std::sync::Arc<Mutex<Vec<(u64, u64)>>>,
}

impl WindowSpan for CollectingSpan {
    fn record_exception(&mut self, message: &str) {
        self.exceptions.lock().push(message.to_string());
    }

    fn end(self: Box<Self>, successes: u64, failures: u64) {
        self.closed_windows.lock().push((successes, failures));
    }
}

impl TraceRecorder for CollectingTraceRecorder {
    fn start_window_span(&self, _environment: &AuthenticatedEnvironment) -> Box<dyn WindowSpan> {
        Box::new(CollectingSpan {
            exceptions: self.exceptions.clone(),
            closed_windows: self.closed_windows.clone(),
        })
    }

    fn record_retry_event(
        &self,
        _run_trace_context: &serde_json::Value,
        message: String,
        _end_time: DateTime<Utc>,
        _span_id_seed: &str,
    ) {
        self.retry_events.lock().push(message);
    }
}

/// A worker transport whose `send` can be told to fail once, for exercising
/// the transactional rollback path.
#[derive(Default)]
pub struct FaultableTransport {
    pub sent: Mutex<Vec<ExecuteRunPayload>>,
    pub fail_next: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl WorkerTransport for FaultableTransport {
    async fn send_execute_runs(
        &self,
        _friendly_worker_id: &str,
        payload: ExecuteRunPayload,
    ) -> anyhow::Result<()> {
        if self
            .fail_next
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            anyhow::bail!("simulated transport failure");
        }
        self.sent.lock().push(payload);
        Ok(())
    }
}
