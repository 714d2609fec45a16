// Entry point for the task-run dispatcher process.
//
// Wires one dispatcher instance against an in-memory queue, store, and
// transport, registers a demo worker, enqueues a run, and drives the
// dispatch loop until the run completes. A real deployment plugs a durable
// queue client and store implementation in through the same
// `QueueClient`/`Store` traits.

use std::sync::Arc;
use std::time::Duration;

use tr_dispatcher::completion::CompletionHandler;
use tr_dispatcher::contracts::Store;
use tr_dispatcher::dispatch_loop::DispatchLoop;
use tr_dispatcher::memory::{CollectingTraceRecorder, FaultableTransport, InMemoryQueue, InMemoryStore};
use tr_dispatcher::model::{
    AuthenticatedEnvironment, BackgroundWorkerTask, BackgroundWorkerVersion, EnvironmentType,
    QueueMessage, TaskQueue, TaskRun,
};
use tr_dispatcher::registry::WorkerRegistry;
use tr_dispatcher::trace_recorder::TraceRecorder;
use uuid::Uuid;

fn main() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    let exit_code = runtime.block_on(async move { run().await });
    std::process::exit(exit_code);
}

async fn run() -> i32 {
    tr_common::logging::init();

    tracing::info!(
        version = tr_sdk::build_constants::DispatcherPackage::VERSION,
        commit = tr_sdk::build_constants::Source::COMMIT_HASH,
        "task-run dispatcher starting"
    );

    let environment = AuthenticatedEnvironment {
        environment_id: Uuid::new_v4(),
        environment_slug: "prod".into(),
        environment_type: EnvironmentType::Production,
        organization_id: Uuid::new_v4(),
        organization_slug: "acme".into(),
        organization_name: "Acme Inc".into(),
        project_id: Uuid::new_v4(),
        project_ref: "proj_demo".into(),
        project_slug: "demo".into(),
        project_name: "Demo Project".into(),
    };

    let queue = Arc::new(InMemoryQueue::new());
    let store = Arc::new(InMemoryStore::new());
    let registry = Arc::new(WorkerRegistry::new());
    let transport = Arc::new(FaultableTransport::default());
    let recorder: Arc<dyn TraceRecorder> = Arc::new(CollectingTraceRecorder::default());
    let config = tr_common::config::DispatcherConfig::from_env();

    let task_id = Uuid::new_v4();
    let worker_id = Uuid::new_v4();
    store.insert_worker(
        environment.environment_id,
        BackgroundWorkerVersion {
            worker_id,
            friendly_worker_id: "worker_demo".into(),
            version: "20260101.1".into(),
            tasks: vec![BackgroundWorkerTask {
                task_id,
                slug: "send-email".into(),
                file_path: "tasks/send-email.ts".into(),
                export_name: "default".into(),
                retry_config: None,
            }],
        },
    );
    store.insert_queue(TaskQueue {
        queue_id: Uuid::new_v4(),
        friendly_queue_id: "queue_demo".into(),
        name: "default".into(),
        environment_id: environment.environment_id,
    });

    let run_id = Uuid::new_v4();
    store.insert_run(TaskRun {
        run_id,
        friendly_run_id: "run_demo".into(),
        task_identifier: "send-email".into(),
        queue_name: "default".into(),
        payload: serde_json::json!({"to": "user@example.com"}),
        payload_type: "json".into(),
        context: serde_json::json!({}),
        trace_context: serde_json::json!({"traceId": "demo-trace"}),
        created_at: chrono::Utc::now(),
        tags: vec!["demo".into()],
        locked_at: None,
        locked_by_task_id: None,
        locked_to_version_id: None,
    });
    queue.enqueue(QueueMessage {
        message_id: run_id,
        data: serde_json::json!({"type": "EXECUTE", "taskIdentifier": "send-email"}),
    });

    let dispatcher = Arc::new(DispatchLoop::new(
        environment,
        queue.clone(),
        store.clone() as Arc<dyn Store>,
        registry.clone(),
        transport.clone(),
        recorder.clone(),
        config.clone(),
    ));

    let _completion = CompletionHandler::new(
        store.clone() as Arc<dyn Store>,
        queue.clone(),
        recorder,
        registry.clone(),
        dispatcher.window(),
        config.heartbeat_extend,
    );

    if let Err(err) = dispatcher.register("worker_demo").await {
        tracing::error!(error = %err, "worker registration failed");
        return 1;
    }

    let loop_handle = tokio::spawn(dispatcher.clone().run());
    tokio::time::sleep(Duration::from_millis(250)).await;
    dispatcher.stop();
    let _ = loop_handle.await;

    tracing::info!(
        attempts = store.attempt_count(run_id),
        remaining = queue.len(),
        "dispatcher demo run finished"
    );

    0
}
