//! Public control surface: start, suspend, resume, and terminate
//! workflows; publish and deliver external events.
//!
//! Controllers bracket instance mutations with the distributed lock —
//! the executor itself never locks.

pub mod activity;
pub mod sync;

pub use activity::ActivityController;
pub use sync::SyncWorkflowRunner;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::{LifecycleEvent, LifecycleEventKind};
use crate::executor::{ExecutionPointerFactory, WorkflowMiddlewareRunner};
use crate::model::{Event, WorkflowInstance, WorkflowStatus};
use crate::providers::{
    DistributedLockProvider, LifecycleEventHub, PersistenceProvider, QueueProvider, QueueType,
};
use crate::registry::WorkflowRegistry;

pub struct WorkflowController {
    persistence: Arc<dyn PersistenceProvider>,
    locks: Arc<dyn DistributedLockProvider>,
    queue: Arc<dyn QueueProvider>,
    registry: Arc<WorkflowRegistry>,
    hub: Arc<dyn LifecycleEventHub>,
    middleware_runner: Arc<WorkflowMiddlewareRunner>,
    pointer_factory: ExecutionPointerFactory,
}

impl WorkflowController {
    pub fn new(
        persistence: Arc<dyn PersistenceProvider>,
        locks: Arc<dyn DistributedLockProvider>,
        queue: Arc<dyn QueueProvider>,
        registry: Arc<WorkflowRegistry>,
        hub: Arc<dyn LifecycleEventHub>,
        middleware_runner: Arc<WorkflowMiddlewareRunner>,
    ) -> Self {
        Self {
            persistence,
            locks,
            queue,
            registry,
            hub,
            middleware_runner,
            pointer_factory: ExecutionPointerFactory::new(),
        }
    }

    /// Create and queue a new instance. Returns its id.
    pub async fn start_workflow(
        &self,
        workflow_id: &str,
        version: Option<i32>,
        data: Option<Value>,
        reference: Option<String>,
    ) -> Result<String> {
        let def = self
            .registry
            .get(workflow_id, version)
            .ok_or_else(|| Error::NotRegistered {
                id: workflow_id.to_string(),
                version,
            })?;

        let mut workflow = WorkflowInstance {
            id: String::new(),
            workflow_definition_id: workflow_id.to_string(),
            version: def.version,
            description: def.description.clone(),
            reference,
            execution_pointers: Vec::new(),
            next_execution: Some(0),
            status: WorkflowStatus::Runnable,
            data: data
                .or_else(|| def.default_data.clone())
                .unwrap_or(Value::Null),
            create_time: Utc::now(),
            complete_time: None,
        };
        workflow
            .execution_pointers
            .push(self.pointer_factory.build_genesis_pointer(&def));

        // Pre middleware may veto creation by erroring.
        self.middleware_runner
            .run_pre_middleware(&mut workflow, &def)
            .await?;

        let id = self.persistence.create_workflow(workflow.clone()).await?;
        workflow.id = id.clone();

        self.queue.queue_work(&id, QueueType::Workflow).await?;
        self.hub
            .publish(LifecycleEvent::for_workflow(
                &workflow,
                LifecycleEventKind::WorkflowStarted,
            ))
            .await?;

        info!(workflow_id = %id, definition = %workflow.workflow_definition_id, "workflow started");
        Ok(id)
    }

    /// Record an external event and queue it for delivery. Returns the
    /// event id.
    pub async fn publish_event(
        &self,
        event_name: &str,
        event_key: &str,
        event_data: Option<Value>,
        effective_date: Option<DateTime<Utc>>,
    ) -> Result<String> {
        debug!(event_name, event_key, "creating event");

        let event = Event {
            id: String::new(),
            event_name: event_name.to_string(),
            event_key: event_key.to_string(),
            event_data,
            event_time: effective_date.unwrap_or_else(Utc::now),
            is_processed: false,
        };

        let event_id = self.persistence.create_event(event).await?;
        self.queue.queue_work(&event_id, QueueType::Event).await?;
        Ok(event_id)
    }

    /// Deliver a published event to every matching subscription: seed the
    /// waiting pointers, terminate the subscriptions, and requeue the
    /// affected workflows. The event is marked processed only when every
    /// subscription was seeded (a lock miss leaves it for a retry).
    pub async fn process_event(&self, event_id: &str) -> Result<()> {
        let event = self.persistence.get_event(event_id).await?;

        let subscriptions = self
            .persistence
            .get_subscriptions(&event.event_name, &event.event_key, event.event_time)
            .await?;

        let mut all_seeded = true;
        for subscription in subscriptions {
            all_seeded &= self.seed_subscription(&event, &subscription).await?;
        }

        if all_seeded {
            self.persistence.mark_event_processed(event_id).await?;
        } else {
            warn!(event_id, "event partially delivered; leaving unprocessed");
        }
        Ok(())
    }

    async fn seed_subscription(
        &self,
        event: &Event,
        subscription: &crate::model::EventSubscription,
    ) -> Result<bool> {
        if !self.locks.acquire_lock(&subscription.workflow_id).await? {
            return Ok(false);
        }

        let seeded = async {
            let mut workflow = self.persistence.get_workflow(&subscription.workflow_id).await?;

            if let Some(pointer) =
                workflow.find_pointer_mut(&subscription.execution_pointer_id)
            {
                pointer.event_published = true;
                pointer.event_data = event.event_data.clone();
                pointer.active = true;
            }
            workflow.next_execution = Some(0);

            self.persistence.persist_workflow(&workflow).await?;
            self.persistence
                .terminate_subscription(&subscription.id)
                .await?;
            self.queue
                .queue_work(&workflow.id, QueueType::Workflow)
                .await?;
            Ok::<_, Error>(true)
        }
        .await;

        self.locks.release_lock(&subscription.workflow_id).await?;
        seeded
    }

    /// Suspend a runnable instance. False when it was not runnable or the
    /// lock is held elsewhere.
    pub async fn suspend_workflow(&self, workflow_id: &str) -> Result<bool> {
        if !self.locks.acquire_lock(workflow_id).await? {
            return Ok(false);
        }

        let outcome = async {
            let mut workflow = self.persistence.get_workflow(workflow_id).await?;
            if workflow.status != WorkflowStatus::Runnable {
                return Ok(false);
            }

            workflow.status = WorkflowStatus::Suspended;
            self.persistence.persist_workflow(&workflow).await?;
            self.hub
                .publish(LifecycleEvent::for_workflow(
                    &workflow,
                    LifecycleEventKind::WorkflowSuspended,
                ))
                .await?;
            Ok(true)
        }
        .await;

        self.locks.release_lock(workflow_id).await?;
        outcome
    }

    /// Resume a suspended instance and requeue it.
    pub async fn resume_workflow(&self, workflow_id: &str) -> Result<bool> {
        if !self.locks.acquire_lock(workflow_id).await? {
            return Ok(false);
        }

        let outcome = async {
            let mut workflow = self.persistence.get_workflow(workflow_id).await?;
            if workflow.status != WorkflowStatus::Suspended {
                return Ok(false);
            }

            workflow.status = WorkflowStatus::Runnable;
            self.persistence.persist_workflow(&workflow).await?;
            self.hub
                .publish(LifecycleEvent::for_workflow(
                    &workflow,
                    LifecycleEventKind::WorkflowResumed,
                ))
                .await?;
            Ok(true)
        }
        .await;

        self.locks.release_lock(workflow_id).await?;

        if matches!(outcome, Ok(true)) {
            self.queue
                .queue_work(workflow_id, QueueType::Workflow)
                .await?;
        }
        outcome
    }

    /// Terminate an instance regardless of its current status.
    pub async fn terminate_workflow(&self, workflow_id: &str) -> Result<bool> {
        if !self.locks.acquire_lock(workflow_id).await? {
            return Ok(false);
        }

        let outcome = async {
            let mut workflow = self.persistence.get_workflow(workflow_id).await?;
            workflow.status = WorkflowStatus::Terminated;
            workflow.complete_time = Some(Utc::now());

            self.persistence.persist_workflow(&workflow).await?;
            self.hub
                .publish(LifecycleEvent::for_workflow(
                    &workflow,
                    LifecycleEventKind::WorkflowTerminated,
                ))
                .await?;
            Ok(true)
        }
        .await;

        self.locks.release_lock(workflow_id).await?;
        outcome
    }
}

/// New unique workflow instance id for unpersisted runs.
pub(crate) fn new_instance_id() -> String {
    Uuid::new_v4().to_string()
}
