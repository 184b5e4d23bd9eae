//! Controller surface tests: start/suspend/resume/terminate, lifecycle
//! notifications, and the synchronous runner.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use braid::controller::{SyncWorkflowRunner, WorkflowController};
use braid::error::Error;
use braid::event::LifecycleEventKind;
use braid::executor::WorkflowExecutor;
use braid::model::{
    DataMapping, ExecutionResult, StepOutcome, WorkflowDefinition, WorkflowStatus, WorkflowStep,
};
use braid::providers::memory::{
    MemoryPersistenceProvider, SingleNodeEventHub, SingleNodeLockProvider, SingleNodeQueueProvider,
};
use braid::providers::{
    DistributedLockProvider, LifecycleEventHub, PersistenceProvider, QueueProvider, QueueType,
};
use braid::registry::WorkflowRegistry;
use braid::steps::{inline, Delay};

struct Harness {
    registry: Arc<WorkflowRegistry>,
    persistence: Arc<MemoryPersistenceProvider>,
    locks: Arc<SingleNodeLockProvider>,
    queue: Arc<SingleNodeQueueProvider>,
    hub: Arc<SingleNodeEventHub>,
    executor: Arc<WorkflowExecutor>,
    controller: WorkflowController,
}

fn harness() -> Harness {
    let registry = Arc::new(WorkflowRegistry::new());
    let persistence = Arc::new(MemoryPersistenceProvider::new());
    let locks = Arc::new(SingleNodeLockProvider::new());
    let queue = Arc::new(SingleNodeQueueProvider::new());
    let hub = Arc::new(SingleNodeEventHub::new());

    let executor = Arc::new(
        WorkflowExecutor::builder(Arc::clone(&registry))
            .hub(Arc::clone(&hub) as Arc<dyn LifecycleEventHub>)
            .build(),
    );
    let controller = WorkflowController::new(
        Arc::clone(&persistence) as Arc<dyn PersistenceProvider>,
        Arc::clone(&locks) as Arc<dyn DistributedLockProvider>,
        Arc::clone(&queue) as Arc<dyn QueueProvider>,
        Arc::clone(&registry),
        Arc::clone(&hub) as Arc<dyn LifecycleEventHub>,
        executor.middleware_runner(),
    );

    Harness {
        registry,
        persistence,
        locks,
        queue,
        hub,
        executor,
        controller,
    }
}

fn two_step_definition() -> WorkflowDefinition {
    WorkflowDefinition::new("order", 1)
        .with_step(
            WorkflowStep::new(
                0,
                inline(|ctx| {
                    ctx.outputs["checked"] = json!(true);
                    Ok(ExecutionResult::next())
                }),
            )
            .with_output(DataMapping::field("checked", "checked"))
            .with_outcome(StepOutcome::next(1)),
        )
        .with_step(WorkflowStep::new(1, inline(|_| Ok(ExecutionResult::next()))))
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_workflow_persists_queues_and_notifies() {
    let harness = harness();
    harness.registry.register(two_step_definition()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        harness.hub.subscribe(Box::new(move |event| {
            seen.lock().unwrap().push(format!("{:?}", event.kind));
        }));
    }

    let id = harness
        .controller
        .start_workflow("order", None, Some(json!({"customer": "kelly"})), Some("ref-7".to_string()))
        .await
        .unwrap();

    let stored = harness.persistence.get_workflow(&id).await.unwrap();
    assert_eq!(stored.status, WorkflowStatus::Runnable);
    assert_eq!(stored.next_execution, Some(0));
    assert_eq!(stored.reference.as_deref(), Some("ref-7"));
    assert_eq!(stored.execution_pointers.len(), 1);
    assert_eq!(stored.execution_pointers[0].step_id, 0);

    assert_eq!(
        harness.queue.dequeue_work(QueueType::Workflow).await.unwrap(),
        Some(id)
    );

    let seen = seen.lock().unwrap();
    assert!(seen.iter().any(|k| k.contains("WorkflowStarted")));
}

#[tokio::test]
async fn start_unregistered_workflow_errors() {
    let harness = harness();
    let err = harness
        .controller
        .start_workflow("ghost", None, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotRegistered { .. }));
}

#[tokio::test]
async fn start_uses_default_data_when_none_given() {
    let harness = harness();
    harness
        .registry
        .register(two_step_definition().with_default_data(json!({"checked": false})))
        .unwrap();

    let id = harness
        .controller
        .start_workflow("order", None, None, None)
        .await
        .unwrap();
    let stored = harness.persistence.get_workflow(&id).await.unwrap();
    assert_eq!(stored.data, json!({"checked": false}));
}

// ---------------------------------------------------------------------------
// Suspend / resume / terminate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn suspend_resume_terminate_lifecycle() {
    let harness = harness();
    harness.registry.register(two_step_definition()).unwrap();
    let id = harness
        .controller
        .start_workflow("order", None, None, None)
        .await
        .unwrap();
    harness.queue.dequeue_work(QueueType::Workflow).await.unwrap();

    assert!(harness.controller.suspend_workflow(&id).await.unwrap());
    assert_eq!(
        harness.persistence.get_workflow(&id).await.unwrap().status,
        WorkflowStatus::Suspended
    );
    // Already suspended: no-op.
    assert!(!harness.controller.suspend_workflow(&id).await.unwrap());

    assert!(harness.controller.resume_workflow(&id).await.unwrap());
    assert_eq!(
        harness.persistence.get_workflow(&id).await.unwrap().status,
        WorkflowStatus::Runnable
    );
    // Resume requeues the instance.
    assert_eq!(
        harness.queue.dequeue_work(QueueType::Workflow).await.unwrap(),
        Some(id.clone())
    );

    assert!(harness.controller.terminate_workflow(&id).await.unwrap());
    let terminated = harness.persistence.get_workflow(&id).await.unwrap();
    assert_eq!(terminated.status, WorkflowStatus::Terminated);
    assert!(terminated.complete_time.is_some());
}

#[tokio::test]
async fn held_lock_blocks_suspension() {
    let harness = harness();
    harness.registry.register(two_step_definition()).unwrap();
    let id = harness
        .controller
        .start_workflow("order", None, None, None)
        .await
        .unwrap();

    // Another worker owns the instance.
    assert!(harness.locks.acquire_lock(&id).await.unwrap());
    assert!(!harness.controller.suspend_workflow(&id).await.unwrap());

    harness.locks.release_lock(&id).await.unwrap();
    assert!(harness.controller.suspend_workflow(&id).await.unwrap());
}

// ---------------------------------------------------------------------------
// Sync runner
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sync_runner_runs_to_completion_and_persists() {
    let harness = harness();
    harness.registry.register(two_step_definition()).unwrap();

    let runner = SyncWorkflowRunner::new(
        Arc::clone(&harness.executor),
        Arc::clone(&harness.locks) as Arc<dyn DistributedLockProvider>,
        Arc::clone(&harness.registry),
        Arc::clone(&harness.persistence) as Arc<dyn PersistenceProvider>,
    );

    let wf = runner
        .run_workflow_sync(
            "order",
            None,
            Some(json!({})),
            None,
            Duration::from_secs(5),
            true,
        )
        .await
        .unwrap();

    assert_eq!(wf.status, WorkflowStatus::Complete);
    assert_eq!(wf.data["checked"], json!(true));

    let stored = harness.persistence.get_workflow(&wf.id).await.unwrap();
    assert_eq!(stored.status, WorkflowStatus::Complete);
}

#[tokio::test]
async fn sync_runner_waits_out_delays() {
    let harness = harness();
    harness
        .registry
        .register(
            WorkflowDefinition::new("delayed", 1).with_step(WorkflowStep::new(
                0,
                braid::model::BodySource::factory(|| {
                    Box::new(Delay::new(chrono::Duration::milliseconds(50)))
                }),
            )),
        )
        .unwrap();

    let runner = SyncWorkflowRunner::new(
        Arc::clone(&harness.executor),
        Arc::clone(&harness.locks) as Arc<dyn DistributedLockProvider>,
        Arc::clone(&harness.registry),
        Arc::clone(&harness.persistence) as Arc<dyn PersistenceProvider>,
    );

    let started = std::time::Instant::now();
    let wf = runner
        .run_workflow_sync("delayed", None, None, None, Duration::from_secs(5), false)
        .await
        .unwrap();

    assert_eq!(wf.status, WorkflowStatus::Complete);
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[tokio::test]
async fn sync_runner_times_out_on_stuck_workflows() {
    let harness = harness();
    harness
        .registry
        .register(
            WorkflowDefinition::new("stuck", 1).with_step(WorkflowStep::new(
                0,
                inline(|ctx| match &ctx.persistence_data {
                    None => Ok(ExecutionResult::persist(json!(1))),
                    Some(data) => Ok(ExecutionResult::persist(data.clone())),
                }),
            )),
        )
        .unwrap();

    let runner = SyncWorkflowRunner::new(
        Arc::clone(&harness.executor),
        Arc::clone(&harness.locks) as Arc<dyn DistributedLockProvider>,
        Arc::clone(&harness.registry),
        Arc::clone(&harness.persistence) as Arc<dyn PersistenceProvider>,
    );

    let wf = runner
        .run_workflow_sync("stuck", None, None, None, Duration::from_millis(150), false)
        .await
        .unwrap();

    // Timed out mid-flight; the instance is returned as-is.
    assert_eq!(wf.status, WorkflowStatus::Runnable);
    // The lock was released despite the timeout.
    assert!(harness.locks.acquire_lock(&wf.id).await.unwrap());
}

// ---------------------------------------------------------------------------
// Lifecycle notifications from execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn execution_publishes_step_and_completion_events() {
    let harness = harness();
    harness.registry.register(two_step_definition()).unwrap();

    let seen: Arc<Mutex<Vec<LifecycleEventKind>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        harness.hub.subscribe(Box::new(move |event| {
            seen.lock().unwrap().push(event.kind.clone());
        }));
    }

    let id = harness
        .controller
        .start_workflow("order", None, Some(json!({})), None)
        .await
        .unwrap();
    let mut wf = harness.persistence.get_workflow(&id).await.unwrap();
    while wf.status == WorkflowStatus::Runnable {
        harness.executor.execute(&mut wf).await;
    }

    // Drain the buffered publisher before asserting.
    harness.executor.publisher().stop().await;

    let seen = seen.lock().unwrap();
    let started = seen
        .iter()
        .filter(|k| matches!(k, LifecycleEventKind::StepStarted { .. }))
        .count();
    let completed = seen
        .iter()
        .filter(|k| matches!(k, LifecycleEventKind::StepCompleted { .. }))
        .count();
    assert_eq!(started, 2);
    assert_eq!(completed, 2);
    assert!(seen
        .iter()
        .any(|k| matches!(k, LifecycleEventKind::WorkflowCompleted)));
}
