//! Collaborator contracts: persistence, queueing, distributed locking,
//! and the lifecycle event hub.
//!
//! The core only talks to these traits. The in-memory implementations in
//! [`memory`] are single-process reference providers; a distributed
//! backend is a drop-in replacement.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::event::LifecycleEvent;
use crate::model::{
    Event, EventSubscription, ExecutionError, WorkflowInstance, WorkflowStep,
};

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

/// Named queues carrying opaque string ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    /// Workflow instance ids ready for an execution iteration.
    Workflow,
    /// Published event ids awaiting subscription matching.
    Event,
    /// Instance ids queued for external indexing.
    Index,
}

#[async_trait]
pub trait QueueProvider: Send + Sync {
    async fn queue_work(&self, id: &str, queue: QueueType) -> Result<()>;

    /// Dequeue one id, waiting briefly on an empty queue. `None` on empty.
    async fn dequeue_work(&self, queue: QueueType) -> Result<Option<String>>;

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Distributed lock
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DistributedLockProvider: Send + Sync {
    /// Single non-blocking attempt; false means another worker owns the key.
    async fn acquire_lock(&self, id: &str) -> Result<bool>;

    async fn release_lock(&self, id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PersistenceProvider: Send + Sync {
    /// Store a new instance, assigning and returning its id.
    async fn create_workflow(&self, workflow: WorkflowInstance) -> Result<String>;

    async fn persist_workflow(&self, workflow: &WorkflowInstance) -> Result<()>;

    async fn get_workflow(&self, id: &str) -> Result<WorkflowInstance>;

    /// Ids of instances whose next execution is due at or before `as_at`.
    async fn get_runnable_instances(&self, as_at: DateTime<Utc>) -> Result<Vec<String>>;

    async fn create_subscription(&self, subscription: EventSubscription) -> Result<String>;

    async fn get_subscription(&self, id: &str) -> Result<EventSubscription>;

    /// Subscriptions matching (name, key) whose as-of instant is at or
    /// before `as_of`.
    async fn get_subscriptions(
        &self,
        event_name: &str,
        event_key: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<EventSubscription>>;

    /// The oldest matching subscription with no external claim token.
    async fn get_first_open_subscription(
        &self,
        event_name: &str,
        event_key: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Option<EventSubscription>>;

    /// Atomically stamp an external claim token; false if already claimed.
    async fn set_subscription_token(
        &self,
        subscription_id: &str,
        token: &str,
        worker_id: &str,
        expiry: DateTime<Utc>,
    ) -> Result<bool>;

    /// Clear a claim token; errors unless `token` matches the stored one.
    async fn clear_subscription_token(&self, subscription_id: &str, token: &str) -> Result<()>;

    async fn terminate_subscription(&self, subscription_id: &str) -> Result<()>;

    async fn create_event(&self, event: Event) -> Result<String>;

    async fn get_event(&self, id: &str) -> Result<Event>;

    /// Unprocessed event ids effective at or before `as_at`.
    async fn get_runnable_events(&self, as_at: DateTime<Utc>) -> Result<Vec<String>>;

    /// Ids of events matching (name, key) effective at or after `as_of`.
    async fn get_events(
        &self,
        event_name: &str,
        event_key: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    async fn mark_event_processed(&self, id: &str) -> Result<()>;

    async fn mark_event_unprocessed(&self, id: &str) -> Result<()>;

    async fn persist_errors(&self, errors: &[ExecutionError]) -> Result<()>;

    fn supports_scheduled_commands(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Lifecycle event hub
// ---------------------------------------------------------------------------

pub type LifecycleCallback = Box<dyn Fn(&LifecycleEvent) + Send + Sync>;

#[async_trait]
pub trait LifecycleEventHub: Send + Sync {
    async fn publish(&self, event: LifecycleEvent) -> Result<()>;

    fn subscribe(&self, callback: LifecycleCallback);

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Step error reporting
// ---------------------------------------------------------------------------

/// Host-side sink for step errors, reported after the error policy chain
/// has run. Hosts use this for alerting or host-level bookkeeping.
pub trait StepErrorSink: Send + Sync {
    fn report_step_error(&self, workflow: &WorkflowInstance, step: &WorkflowStep, error: &Error);
}
