//! Reacts to run-completed and heartbeat messages pushed by the worker.
//! Runs on the transport's own cooperative task, concurrently with the
//! Dispatch Loop but against disjoint attempts: the loop creates, this
//! finalizes.

use crate::contracts::{QueueClient, Store};
use crate::registry::WorkerRegistry;
use crate::trace_recorder::TraceRecorder;
use crate::trace_window::TraceWindow;
use crate::transport::Completion;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub struct CompletionHandler {
    store: Arc<dyn Store>,
    queue: Arc<dyn QueueClient>,
    recorder: Arc<dyn TraceRecorder>,
    registry: Arc<WorkerRegistry>,
    window: Arc<Mutex<TraceWindow>>,
    heartbeat_extend: Duration,
}

impl CompletionHandler {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn QueueClient>,
        recorder: Arc<dyn TraceRecorder>,
        registry: Arc<WorkerRegistry>,
        window: Arc<Mutex<TraceWindow>>,
        heartbeat_extend: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            recorder,
            registry,
            window,
            heartbeat_extend,
        }
    }

    pub async fn on_completed(&self, friendly_attempt_id: &str, completion: Completion) -> anyhow::Result<()> {
        let attempt = self
            .store
            .get_attempt_by_friendly_id(friendly_attempt_id)
            .await?;
        let Some(attempt) = attempt else {
            tracing::warn!(friendly_attempt_id, "completion for unknown attempt");
            return Ok(());
        };

        if completion.ok {
            self.store
                .update_attempt_completed(
                    attempt.attempt_id,
                    completion.output.unwrap_or(serde_json::Value::Null),
                    completion.output_type.unwrap_or_else(|| "json".to_string()),
                )
                .await?;
            self.window.lock().await.record_success();
        } else {
            self.store
                .update_attempt_failed(
                    attempt.attempt_id,
                    completion.error.clone().unwrap_or_default(),
                )
                .await?;
            self.window.lock().await.record_failure();
        }

        match completion.retry {
            Some(retry) if !completion.ok => {
                let next_number = attempt.number + 1;
                let retry_config = self
                    .registry
                    .lookup_by_id(attempt.background_worker_id)
                    .and_then(|version| {
                        version
                            .find_task_by_id(attempt.background_worker_task_id)
                            .and_then(|task| task.retry_config)
                    });
                let message = match retry_config {
                    Some(config) => format!(
                        "Retry {}/{} delay",
                        attempt.number,
                        config.max_attempts.saturating_sub(1)
                    ),
                    None => format!("Retry #{} delay", attempt.number),
                };

                let run = self.store.get_task_run(attempt.run_id).await?;
                if let Some(run) = &run {
                    self.recorder.record_retry_event(
                        &run.trace_context,
                        message,
                        retry.timestamp,
                        &format!("retry-{next_number}"),
                    );
                }
                self.queue
                    .nack(attempt.run_id, Some(retry.timestamp))
                    .await?;
            }
            _ => {
                self.queue.ack(attempt.run_id).await?;
            }
        }

        Ok(())
    }

    pub async fn on_heartbeat(&self, friendly_attempt_id: &str) -> anyhow::Result<()> {
        let attempt = self
            .store
            .get_attempt_by_friendly_id(friendly_attempt_id)
            .await?;
        if let Some(attempt) = attempt {
            self.queue
                .heartbeat(attempt.run_id, self.heartbeat_extend)
                .await?;
        }
        Ok(())
    }
}
