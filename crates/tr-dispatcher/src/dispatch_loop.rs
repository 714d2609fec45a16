//! Per-connection single-threaded pull-dispatch cycle: dequeue, resolve,
//! lock, create an attempt, and hand an execution descriptor to the worker.

use crate::contracts::{QueueClient, Store};
use crate::model::{
    parse_queue_payload, AttemptStatus, AuthenticatedEnvironment, QueuePayload, TaskRunAttempt,
};
use crate::registry::WorkerRegistry;
use crate::trace_window::TraceWindow;
use crate::transport::{
    AttemptDescriptor, EnvironmentDescriptor, ExecuteRunPayload, ExecutionDescriptor,
    OrganizationDescriptor, ProjectDescriptor, QueueDescriptor, RunDescriptor, TaskDescriptor,
    WorkerTransport,
};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tr_common::config::DispatcherConfig;
use tr_common::error::Result;
use uuid::Uuid;

fn friendly_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

/// Owns one environment connection's worker registry, trace window, and
/// pull-dispatch loop. Disabled until the first successful [`Self::register`].
pub struct DispatchLoop {
    environment: AuthenticatedEnvironment,
    queue: Arc<dyn QueueClient>,
    store: Arc<dyn Store>,
    registry: Arc<WorkerRegistry>,
    transport: Arc<dyn WorkerTransport>,
    config: DispatcherConfig,
    window: Arc<Mutex<TraceWindow>>,
    enabled: AtomicBool,
    enabled_notify: Notify,
    cancellation: CancellationToken,
}

impl DispatchLoop {
    pub fn new(
        environment: AuthenticatedEnvironment,
        queue: Arc<dyn QueueClient>,
        store: Arc<dyn Store>,
        registry: Arc<WorkerRegistry>,
        transport: Arc<dyn WorkerTransport>,
        recorder: Arc<dyn crate::trace_recorder::TraceRecorder>,
        config: DispatcherConfig,
    ) -> Self {
        let window_config = crate::trace_window::TraceWindowConfig {
            max_items: config.max_items_per_trace,
            window_timeout: config.trace_timeout,
        };
        Self {
            environment,
            queue,
            store,
            registry,
            transport,
            config,
            window: Arc::new(Mutex::new(TraceWindow::new(recorder, window_config))),
            enabled: AtomicBool::new(false),
            enabled_notify: Notify::new(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Shared with the [`crate::completion::CompletionHandler`] so success
    /// and failure counters land in the same window the loop is dispatching
    /// under.
    pub fn window(&self) -> Arc<Mutex<TraceWindow>> {
        self.window.clone()
    }

    /// Fetch the worker and its tasks, scoped to this connection's
    /// environment; no-op if not found. Enables the loop on success.
    pub async fn register(&self, friendly_worker_id: &str) -> Result<()> {
        let version = self
            .store
            .get_worker_by_friendly_id(self.environment.environment_id, friendly_worker_id)
            .await?;
        if let Some(version) = version {
            self.registry.register(version);
            self.enable();
        }
        Ok(())
    }

    fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        self.enabled_notify.notify_waiters();
    }

    pub fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.cancellation.cancel();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Drive the loop until `stop()` is called. Exactly one iteration is
    /// ever outstanding; the next is scheduled only after this one
    /// completes and its resume delay elapses.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.cancellation.is_cancelled() {
                return;
            }
            if !self.enabled.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = self.enabled_notify.notified() => continue,
                    _ = self.cancellation.cancelled() => return,
                }
            }

            let delay = self.run_iteration().await;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancellation.cancelled() => return,
            }
        }
    }

    /// One pass through the pipeline. Returns the delay to wait before the
    /// next iteration. Never panics or propagates an error: every exit path
    /// resolves the message one way or another.
    async fn run_iteration(&self) -> Duration {
        {
            let mut window = self.window.lock().await;
            window.ensure_open(&self.environment);
        }

        let message = match self.queue.dequeue(&self.environment).await {
            Ok(Some(message)) => message,
            Ok(None) => return self.config.empty_dequeue_delay,
            Err(err) => {
                tracing::error!(error = %err, "dequeue failed");
                return self.config.empty_dequeue_delay;
            }
        };

        let QueuePayload::Execute { task_identifier } = match parse_queue_payload(&message.data) {
            Some(payload) => payload,
            None => {
                tracing::warn!(message_id = %message.message_id, "poison message, acking");
                self.ack_and_ignore(message.message_id).await;
                return self.config.short_resume_delay;
            }
        };

        let run = match self.store.get_task_run(message.message_id).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                tracing::warn!(message_id = %message.message_id, "run missing, acking");
                self.ack_and_ignore(message.message_id).await;
                return self.config.short_resume_delay;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to load run");
                self.ack_and_ignore(message.message_id).await;
                return self.config.short_resume_delay;
            }
        };

        let worker_version = match run.locked_to_version_id {
            Some(version_id) => self.registry.lookup_by_id(version_id),
            None => self.registry.latest(),
        };
        let worker_version = match worker_version {
            Some(version) => version,
            None => {
                tracing::warn!(run_id = %run.run_id, "no worker version available, acking");
                self.ack_and_ignore(message.message_id).await;
                return self.config.short_resume_delay;
            }
        };

        let task = match worker_version.find_task(&task_identifier) {
            Some(task) => task.clone(),
            None => {
                tracing::warn!(task_identifier = %task_identifier, "no matching task, acking");
                self.ack_and_ignore(message.message_id).await;
                return self.config.short_resume_delay;
            }
        };

        let locked = match self
            .store
            .lock_task_run(run.run_id, task.task_id)
            .await
        {
            Ok(Some(locked)) => locked,
            Ok(None) => {
                tracing::warn!(run_id = %run.run_id, "lock update failed, acking");
                self.ack_and_ignore(message.message_id).await;
                return self.config.short_resume_delay;
            }
            Err(err) => {
                tracing::error!(error = %err, "lock update errored, acking");
                self.ack_and_ignore(message.message_id).await;
                return self.config.short_resume_delay;
            }
        };

        let queue_row = match self
            .store
            .get_task_queue(self.environment.environment_id, &run.queue_name)
            .await
        {
            Ok(Some(queue_row)) => queue_row,
            _ => {
                tracing::warn!(queue_name = %run.queue_name, "queue row missing, nacking");
                let _ = self.queue.nack(message.message_id, None).await;
                return self.config.empty_dequeue_delay;
            }
        };

        if !self.enabled.load(Ordering::SeqCst) {
            let _ = self.queue.nack(message.message_id, None).await;
            return self.config.short_resume_delay;
        }

        let attempt_number = locked.last_attempt.map(|a| a.number).unwrap_or(0) + 1;
        let attempt = TaskRunAttempt {
            attempt_id: Uuid::new_v4(),
            friendly_attempt_id: friendly_id("attempt"),
            run_id: run.run_id,
            number: attempt_number,
            status: AttemptStatus::Executing,
            started_at: Utc::now(),
            completed_at: None,
            output: None,
            output_type: None,
            error: None,
            queue_id: queue_row.queue_id,
            background_worker_id: worker_version.worker_id,
            background_worker_task_id: task.task_id,
        };
        if let Err(err) = self.store.create_attempt(attempt.clone()).await {
            tracing::error!(error = %err, "failed to create attempt");
            self.ack_and_ignore(message.message_id).await;
            return self.config.short_resume_delay;
        }

        let descriptor = ExecutionDescriptor {
            task: TaskDescriptor::from(&task),
            attempt: AttemptDescriptor::from_attempt(&attempt, &worker_version.friendly_worker_id),
            run: RunDescriptor::from_run(&run, locked.tags),
            queue: QueueDescriptor {
                id: queue_row.friendly_queue_id,
                name: queue_row.name,
            },
            environment: EnvironmentDescriptor {
                id: self.environment.environment_id.to_string(),
                slug: self.environment.environment_slug.clone(),
                environment_type: self.environment.environment_type,
            },
            organization: OrganizationDescriptor {
                id: self.environment.organization_id.to_string(),
                slug: self.environment.organization_slug.clone(),
                name: self.environment.organization_name.clone(),
            },
            project: ProjectDescriptor {
                id: self.environment.project_id.to_string(),
                project_ref: self.environment.project_ref.clone(),
                slug: self.environment.project_slug.clone(),
                name: self.environment.project_name.clone(),
            },
        };
        let payload = ExecuteRunPayload {
            execution: descriptor,
            trace_context: run.trace_context.clone(),
        };

        match self
            .transport
            .send_execute_runs(&worker_version.friendly_worker_id, payload)
            .await
        {
            Ok(()) => {
                let mut window = self.window.lock().await;
                window.record_dispatch();
                self.config.short_resume_delay
            }
            Err(err) => {
                tracing::error!(error = %err, run_id = %run.run_id, "transport send failed, rolling back");
                {
                    let mut window = self.window.lock().await;
                    window.record_exception(&err.to_string());
                }
                let _ = self.store.unlock_task_run(run.run_id).await;
                let _ = self.store.delete_attempt(attempt.attempt_id).await;
                let _ = self.queue.nack(message.message_id, None).await;
                self.config.short_resume_delay
            }
        }
    }

    async fn ack_and_ignore(&self, message_id: Uuid) {
        if let Err(err) = self.queue.ack(message_id).await {
            tracing::error!(error = %err, "ack failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{CollectingTraceRecorder, FaultableTransport, InMemoryQueue, InMemoryStore};
    use crate::model::{
        AttemptStatus, BackgroundWorkerTask, BackgroundWorkerVersion, EnvironmentType, QueueMessage,
        RetryConfig, TaskQueue, TaskRun,
    };

    fn environment() -> AuthenticatedEnvironment {
        AuthenticatedEnvironment {
            environment_id: Uuid::new_v4(),
            environment_slug: "env".into(),
            environment_type: EnvironmentType::Production,
            organization_id: Uuid::new_v4(),
            organization_slug: "org".into(),
            organization_name: "Org".into(),
            project_id: Uuid::new_v4(),
            project_ref: "proj_ref".into(),
            project_slug: "proj".into(),
            project_name: "Proj".into(),
        }
    }

    struct Harness {
        dispatcher: Arc<DispatchLoop>,
        queue: Arc<InMemoryQueue>,
        store: Arc<InMemoryStore>,
        transport: Arc<FaultableTransport>,
        recorder: Arc<CollectingTraceRecorder>,
        environment: AuthenticatedEnvironment,
    }

    fn build_harness() -> Harness {
        let environment = environment();
        let queue = Arc::new(InMemoryQueue::new());
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(WorkerRegistry::new());
        let transport = Arc::new(FaultableTransport::default());
        let recorder = Arc::new(CollectingTraceRecorder::default());
        let recorder_dyn: Arc<dyn crate::trace_recorder::TraceRecorder> = recorder.clone();

        let dispatcher = Arc::new(DispatchLoop::new(
            environment.clone(),
            queue.clone() as Arc<dyn QueueClient>,
            store.clone() as Arc<dyn Store>,
            registry,
            transport.clone() as Arc<dyn WorkerTransport>,
            recorder_dyn,
            DispatcherConfig::default(),
        ));

        Harness {
            dispatcher,
            queue,
            store,
            transport,
            recorder,
            environment,
        }
    }

    fn register_worker(
        harness: &Harness,
        friendly_worker_id: &str,
        version: &str,
        slug: &str,
    ) -> (Uuid, Uuid) {
        let worker_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();
        harness.store.insert_worker(
            harness.environment.environment_id,
            BackgroundWorkerVersion {
                worker_id,
                friendly_worker_id: friendly_worker_id.to_string(),
                version: version.to_string(),
                tasks: vec![BackgroundWorkerTask {
                    task_id,
                    slug: slug.to_string(),
                    file_path: "tasks/x.ts".into(),
                    export_name: "default".into(),
                    retry_config: Some(RetryConfig {
                        max_attempts: 3,
                        ..RetryConfig::default()
                    }),
                }],
            },
        );
        (worker_id, task_id)
    }

    fn seed_run(harness: &Harness, run_id: Uuid, locked_to_version_id: Option<Uuid>) {
        harness.store.insert_queue(TaskQueue {
            queue_id: Uuid::new_v4(),
            friendly_queue_id: "queue_1".into(),
            name: "default".into(),
            environment_id: harness.environment.environment_id,
        });
        harness.store.insert_run(TaskRun {
            run_id,
            friendly_run_id: format!("run_{}", run_id.simple()),
            task_identifier: "send-email".into(),
            queue_name: "default".into(),
            payload: serde_json::json!({}),
            payload_type: "json".into(),
            context: serde_json::json!({}),
            trace_context: serde_json::json!({"traceId": "abc123"}),
            created_at: Utc::now(),
            tags: vec![],
            locked_at: None,
            locked_by_task_id: None,
            locked_to_version_id,
        });
        harness.queue.enqueue(QueueMessage {
            message_id: run_id,
            data: serde_json::json!({"type": "EXECUTE", "taskIdentifier": "send-email"}),
        });
    }

    #[tokio::test]
    async fn s1_happy_path_dispatches_executing_attempt() {
        let harness = build_harness();
        register_worker(&harness, "w1", "20240101.1", "send-email");
        let run_id = Uuid::new_v4();
        seed_run(&harness, run_id, None);

        harness.dispatcher.register("w1").await.unwrap();
        let delay = harness.dispatcher.run_iteration().await;

        assert_eq!(delay, harness.dispatcher.config.short_resume_delay);
        assert_eq!(harness.transport.sent.lock().len(), 1);
        let sent = &harness.transport.sent.lock()[0];
        assert_eq!(sent.execution.attempt.number, 1);
        assert!(matches!(sent.execution.attempt.status, AttemptStatus::Executing));
        assert_eq!(harness.store.attempt_count(run_id), 1);
    }

    #[tokio::test]
    async fn s3_pinned_run_dispatches_against_pinned_version() {
        let harness = build_harness();
        let (old_id, _) = register_worker(&harness, "w1_old", "20240101.1", "send-email");
        register_worker(&harness, "w1_new", "20240101.2", "send-email");
        let run_id = Uuid::new_v4();
        seed_run(&harness, run_id, Some(old_id));

        harness.dispatcher.register("w1_old").await.unwrap();
        harness.dispatcher.register("w1_new").await.unwrap();
        harness.dispatcher.run_iteration().await;

        let sent = &harness.transport.sent.lock()[0];
        assert_eq!(sent.execution.attempt.background_worker_id, "w1_old");
    }

    #[tokio::test]
    async fn s4_unpinned_run_dispatches_against_latest_version() {
        let harness = build_harness();
        register_worker(&harness, "w1_old", "20240101.1", "send-email");
        register_worker(&harness, "w1_new", "20240101.2", "send-email");
        let run_id = Uuid::new_v4();
        seed_run(&harness, run_id, None);

        harness.dispatcher.register("w1_old").await.unwrap();
        harness.dispatcher.register("w1_new").await.unwrap();
        harness.dispatcher.run_iteration().await;

        let sent = &harness.transport.sent.lock()[0];
        assert_eq!(sent.execution.attempt.background_worker_id, "w1_new");
    }

    #[tokio::test]
    async fn s5_poison_message_is_acked_without_dispatch() {
        let harness = build_harness();
        register_worker(&harness, "w1", "20240101.1", "send-email");
        harness.dispatcher.register("w1").await.unwrap();

        let message_id = Uuid::new_v4();
        harness.queue.enqueue(QueueMessage {
            message_id,
            data: serde_json::json!({"type": "UNKNOWN"}),
        });

        harness.dispatcher.run_iteration().await;

        assert!(harness.transport.sent.lock().is_empty());
        assert!(harness.queue.is_empty());
    }

    #[tokio::test]
    async fn s6_transport_failure_rolls_back_lock_and_attempt() {
        let harness = build_harness();
        register_worker(&harness, "w1", "20240101.1", "send-email");
        let run_id = Uuid::new_v4();
        seed_run(&harness, run_id, None);
        harness
            .transport
            .fail_next
            .store(true, std::sync::atomic::Ordering::SeqCst);

        harness.dispatcher.register("w1").await.unwrap();
        harness.dispatcher.run_iteration().await;

        assert_eq!(harness.store.attempt_count(run_id), 0);
        let run = harness.store.get_task_run(run_id).await.unwrap().unwrap();
        assert!(!run.is_locked());
        assert_eq!(harness.queue.len(), 1);
        assert_eq!(harness.recorder.exceptions.lock().len(), 1);
    }

    // Properties below exercise invariants that hold across any sequence of
    // iterations, not just the single-shot scenarios above.

    #[tokio::test]
    async fn invariant_locked_run_is_not_redispatched() {
        let harness = build_harness();
        register_worker(&harness, "w1", "20240101.1", "send-email");
        let run_id = Uuid::new_v4();
        seed_run(&harness, run_id, None);
        harness.dispatcher.register("w1").await.unwrap();

        harness.dispatcher.run_iteration().await;
        assert_eq!(harness.store.attempt_count(run_id), 1);

        // The message is in flight and the run is locked; a second iteration
        // must find nothing to dequeue rather than starting a concurrent
        // attempt for the same run.
        let delay = harness.dispatcher.run_iteration().await;
        assert_eq!(delay, harness.dispatcher.config.empty_dequeue_delay);
        assert_eq!(harness.store.attempt_count(run_id), 1);
        let run = harness.store.get_task_run(run_id).await.unwrap().unwrap();
        assert!(run.is_locked());
    }

    #[tokio::test]
    async fn invariant_attempt_numbers_increase_without_gaps_across_retries() {
        let harness = build_harness();
        register_worker(&harness, "w1", "20240101.1", "send-email");
        let run_id = Uuid::new_v4();
        seed_run(&harness, run_id, None);
        harness.dispatcher.register("w1").await.unwrap();

        harness.dispatcher.run_iteration().await;
        let (first_number, attempt_id) = {
            let sent = harness.transport.sent.lock();
            (sent[0].execution.attempt.number, sent[0].execution.attempt.id.clone())
        };
        assert_eq!(first_number, 1);

        let registry = harness.dispatcher.registry().clone();
        let handler = crate::completion::CompletionHandler::new(
            harness.store.clone() as Arc<dyn Store>,
            harness.queue.clone() as Arc<dyn QueueClient>,
            harness.recorder.clone() as Arc<dyn crate::trace_recorder::TraceRecorder>,
            registry,
            harness.dispatcher.window(),
            Duration::from_secs(60),
        );
        handler
            .on_completed(
                &attempt_id,
                crate::transport::Completion {
                    ok: false,
                    output: None,
                    output_type: None,
                    error: Some("boom".into()),
                    retry: Some(crate::transport::RetryRequest {
                        timestamp: Utc::now(),
                    }),
                },
            )
            .await
            .unwrap();

        // nack put the message back with no visibility delay, so it's
        // immediately redeliverable.
        harness.dispatcher.run_iteration().await;
        assert_eq!(harness.transport.sent.lock().len(), 2);
        let second = &harness.transport.sent.lock()[1];
        assert_eq!(second.execution.attempt.number, 2);
        assert_eq!(harness.store.attempt_count(run_id), 2);
    }

    #[tokio::test]
    async fn invariant_window_rolls_over_before_max_items_plus_one_dispatches() {
        let harness = build_harness();
        register_worker(&harness, "w1", "20240101.1", "send-email");
        // Rebuild with a tight item bound so rollover is observable within a
        // handful of dispatches.
        let environment = harness.environment.clone();
        let config = DispatcherConfig {
            max_items_per_trace: 2,
            ..DispatcherConfig::default()
        };
        let recorder = Arc::new(CollectingTraceRecorder::default());
        let dispatcher = Arc::new(DispatchLoop::new(
            environment,
            harness.queue.clone() as Arc<dyn QueueClient>,
            harness.store.clone() as Arc<dyn Store>,
            harness.dispatcher.registry().clone(),
            harness.transport.clone() as Arc<dyn WorkerTransport>,
            recorder.clone() as Arc<dyn crate::trace_recorder::TraceRecorder>,
            config,
        ));
        dispatcher.register("w1").await.unwrap();

        for _ in 0..3 {
            let run_id = Uuid::new_v4();
            seed_run(&harness, run_id, None);
            dispatcher.run_iteration().await;
        }

        // Two dispatches filled the first window; the third forced a
        // rollover before being counted, so exactly one window has closed.
        assert_eq!(recorder.closed_windows.lock().len(), 1);
    }
}
