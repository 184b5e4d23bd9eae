//! Event-driven suspension and resumption: wait-for steps,
//! subscriptions, and the publish/process event pipeline.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use braid::controller::WorkflowController;
use braid::executor::{ExecutionPointerFactory, WorkflowExecutor};
use braid::model::{
    BodySource, DataMapping, PointerStatus, WorkflowDefinition, WorkflowInstance, WorkflowStatus,
    WorkflowStep,
};
use braid::providers::memory::{
    MemoryPersistenceProvider, SingleNodeEventHub, SingleNodeLockProvider, SingleNodeQueueProvider,
};
use braid::providers::{
    DistributedLockProvider, LifecycleEventHub, PersistenceProvider, QueueProvider, QueueType,
};
use braid::registry::WorkflowRegistry;
use braid::steps::WaitFor;

fn approval_definition() -> WorkflowDefinition {
    WorkflowDefinition::new("approval", 1).with_step(
        WorkflowStep::new(0, BodySource::factory(|| Box::new(WaitFor)))
            .with_input(DataMapping::compute(|_| json!("approve"), "event_name"))
            .with_input(DataMapping::compute(|_| json!("doc42"), "event_key"))
            .with_output(DataMapping::field("event_data", "approval")),
    )
}

fn instance(registry: &WorkflowRegistry, definition_id: &str) -> WorkflowInstance {
    let def = registry
        .get(definition_id, None)
        .expect("definition registered");
    let genesis = ExecutionPointerFactory::new().build_genesis_pointer(&def);
    WorkflowInstance {
        id: "wf-test".to_string(),
        workflow_definition_id: definition_id.to_string(),
        version: def.version,
        description: None,
        reference: None,
        execution_pointers: vec![genesis],
        next_execution: Some(0),
        status: WorkflowStatus::Runnable,
        data: json!({}),
        create_time: Utc::now(),
        complete_time: None,
    }
}

// ---------------------------------------------------------------------------
// Executor-level subscription behavior
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wait_for_step_subscribes_and_parks_the_pointer() {
    let registry = Arc::new(WorkflowRegistry::new());
    registry.register(approval_definition()).unwrap();

    let executor = WorkflowExecutor::builder(Arc::clone(&registry)).build();
    let mut wf = instance(&registry, "approval");

    let result = executor.execute(&mut wf).await;

    assert_eq!(result.subscriptions.len(), 1);
    let sub = &result.subscriptions[0];
    assert_eq!(sub.event_name, "approve");
    assert_eq!(sub.event_key, "doc42");
    assert_eq!(sub.execution_pointer_id, wf.execution_pointers[0].id);

    let pointer = &wf.execution_pointers[0];
    assert_eq!(pointer.status, PointerStatus::WaitingForEvent);
    assert!(!pointer.active);
    assert_eq!(pointer.event_name.as_deref(), Some("approve"));
    assert_eq!(wf.status, WorkflowStatus::Runnable);
    assert_eq!(wf.next_execution, None);
}

#[tokio::test]
async fn seeded_event_resumes_the_waiting_pointer() {
    let registry = Arc::new(WorkflowRegistry::new());
    registry.register(approval_definition()).unwrap();

    let executor = WorkflowExecutor::builder(Arc::clone(&registry)).build();
    let mut wf = instance(&registry, "approval");
    executor.execute(&mut wf).await;

    // What the host's event pipeline does on a matching event.
    {
        let pointer_id = wf.execution_pointers[0].id.clone();
        let pointer = wf.find_pointer_mut(&pointer_id).unwrap();
        pointer.event_published = true;
        pointer.event_data = Some(json!({"approved": true, "by": "kelly"}));
        pointer.active = true;
    }

    executor.execute(&mut wf).await;

    assert_eq!(wf.status, WorkflowStatus::Complete);
    assert_eq!(wf.data["approval"], json!({"approved": true, "by": "kelly"}));
    assert_eq!(wf.execution_pointers[0].status, PointerStatus::Complete);
}

// ---------------------------------------------------------------------------
// Publish / process pipeline
// ---------------------------------------------------------------------------

struct Host {
    registry: Arc<WorkflowRegistry>,
    persistence: Arc<MemoryPersistenceProvider>,
    locks: Arc<SingleNodeLockProvider>,
    queue: Arc<SingleNodeQueueProvider>,
    executor: WorkflowExecutor,
    controller: Arc<WorkflowController>,
}

fn host() -> Host {
    let registry = Arc::new(WorkflowRegistry::new());
    let persistence = Arc::new(MemoryPersistenceProvider::new());
    let locks = Arc::new(SingleNodeLockProvider::new());
    let queue = Arc::new(SingleNodeQueueProvider::new());
    let hub: Arc<dyn LifecycleEventHub> = Arc::new(SingleNodeEventHub::new());

    let executor = WorkflowExecutor::builder(Arc::clone(&registry))
        .hub(Arc::clone(&hub))
        .build();
    let controller = Arc::new(WorkflowController::new(
        Arc::clone(&persistence) as Arc<dyn PersistenceProvider>,
        Arc::clone(&locks) as Arc<dyn DistributedLockProvider>,
        Arc::clone(&queue) as Arc<dyn QueueProvider>,
        Arc::clone(&registry),
        hub,
        executor.middleware_runner(),
    ));

    Host {
        registry,
        persistence,
        locks,
        queue,
        executor,
        controller,
    }
}

impl Host {
    /// One worker-loop pass: dequeue, lock, execute, persist.
    async fn workflow_iteration(&self) -> String {
        let id = self
            .queue
            .dequeue_work(QueueType::Workflow)
            .await
            .unwrap()
            .expect("workflow queued");
        assert!(self.locks.acquire_lock(&id).await.unwrap());

        let mut wf = self.persistence.get_workflow(&id).await.unwrap();
        let result = self.executor.execute(&mut wf).await;
        self.persistence.persist_workflow(&wf).await.unwrap();
        for subscription in result.subscriptions {
            self.persistence
                .create_subscription(subscription)
                .await
                .unwrap();
        }
        self.persistence.persist_errors(&result.errors).await.unwrap();

        self.locks.release_lock(&id).await.unwrap();
        id
    }
}

#[tokio::test]
async fn published_event_wakes_matching_subscription() {
    let host = host();
    host.registry.register(approval_definition()).unwrap();

    let wf_id = host
        .controller
        .start_workflow("approval", None, Some(json!({})), None)
        .await
        .unwrap();

    // First pass parks the workflow on its subscription.
    assert_eq!(host.workflow_iteration().await, wf_id);
    assert_eq!(host.persistence.subscription_count(), 1);

    // Publish the matching event and deliver it.
    let event_id = host
        .controller
        .publish_event("approve", "doc42", Some(json!({"approved": true})), None)
        .await
        .unwrap();
    assert_eq!(
        host.queue.dequeue_work(QueueType::Event).await.unwrap(),
        Some(event_id.clone())
    );
    host.controller.process_event(&event_id).await.unwrap();

    // Delivery terminated the subscription, woke the pointer, and
    // requeued the workflow.
    assert_eq!(host.persistence.subscription_count(), 0);
    let seeded = host.persistence.get_workflow(&wf_id).await.unwrap();
    assert_eq!(seeded.next_execution, Some(0));
    assert!(seeded.execution_pointers[0].event_published);

    assert_eq!(host.workflow_iteration().await, wf_id);
    let finished = host.persistence.get_workflow(&wf_id).await.unwrap();
    assert_eq!(finished.status, WorkflowStatus::Complete);
    assert_eq!(finished.data["approval"], json!({"approved": true}));

    let event = host.persistence.get_event(&event_id).await.unwrap();
    assert!(event.is_processed);
}

#[tokio::test]
async fn non_matching_event_leaves_subscription_open() {
    let host = host();
    host.registry.register(approval_definition()).unwrap();

    let wf_id = host
        .controller
        .start_workflow("approval", None, Some(json!({})), None)
        .await
        .unwrap();
    host.workflow_iteration().await;

    let event_id = host
        .controller
        .publish_event("approve", "other-doc", None, None)
        .await
        .unwrap();
    host.controller.process_event(&event_id).await.unwrap();

    assert_eq!(host.persistence.subscription_count(), 1);
    let wf = host.persistence.get_workflow(&wf_id).await.unwrap();
    assert!(!wf.execution_pointers[0].event_published);
}
