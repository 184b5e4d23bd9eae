//! Single-process reference providers.
//!
//! Mutex-guarded collections and Tokio channels stand in for real
//! persistence, queue, and lock backends. Good for tests, sync runs, and
//! single-node deployments; not a distributed store.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::LifecycleEvent;
use crate::model::{Event, EventSubscription, ExecutionError, WorkflowInstance};
use crate::providers::{
    DistributedLockProvider, LifecycleCallback, LifecycleEventHub, PersistenceProvider,
    QueueProvider, QueueType,
};

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryStore {
    instances: HashMap<String, WorkflowInstance>,
    subscriptions: Vec<EventSubscription>,
    events: Vec<Event>,
    errors: Vec<ExecutionError>,
}

/// In-memory persistence. State lives for the process lifetime only.
#[derive(Default)]
pub struct MemoryPersistenceProvider {
    store: Mutex<MemoryStore>,
}

impl MemoryPersistenceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of stored subscriptions; test observability.
    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// Stored execution errors; test observability.
    pub fn stored_errors(&self) -> Vec<ExecutionError> {
        self.lock().errors.clone()
    }
}

#[async_trait]
impl PersistenceProvider for MemoryPersistenceProvider {
    async fn create_workflow(&self, mut workflow: WorkflowInstance) -> Result<String> {
        let mut store = self.lock();
        if workflow.id.is_empty() {
            workflow.id = Uuid::new_v4().to_string();
        }
        let id = workflow.id.clone();
        store.instances.insert(id.clone(), workflow);
        Ok(id)
    }

    async fn persist_workflow(&self, workflow: &WorkflowInstance) -> Result<()> {
        let mut store = self.lock();
        store
            .instances
            .insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<WorkflowInstance> {
        let store = self.lock();
        store
            .instances
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("workflow instance {id}")))
    }

    async fn get_runnable_instances(&self, as_at: DateTime<Utc>) -> Result<Vec<String>> {
        let store = self.lock();
        let cutoff = as_at.timestamp_millis();
        Ok(store
            .instances
            .values()
            .filter(|wf| wf.next_execution.is_some_and(|next| next <= cutoff))
            .map(|wf| wf.id.clone())
            .collect())
    }

    async fn create_subscription(&self, mut subscription: EventSubscription) -> Result<String> {
        let mut store = self.lock();
        if subscription.id.is_empty() {
            subscription.id = Uuid::new_v4().to_string();
        }
        let id = subscription.id.clone();
        store.subscriptions.push(subscription);
        Ok(id)
    }

    async fn get_subscription(&self, id: &str) -> Result<EventSubscription> {
        let store = self.lock();
        store
            .subscriptions
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("subscription {id}")))
    }

    async fn get_subscriptions(
        &self,
        event_name: &str,
        event_key: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<EventSubscription>> {
        let store = self.lock();
        Ok(store
            .subscriptions
            .iter()
            .filter(|s| {
                s.event_name == event_name && s.event_key == event_key && s.subscribe_as_of <= as_of
            })
            .cloned()
            .collect())
    }

    async fn get_first_open_subscription(
        &self,
        event_name: &str,
        event_key: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Option<EventSubscription>> {
        let store = self.lock();
        Ok(store
            .subscriptions
            .iter()
            .find(|s| {
                s.external_token.is_none()
                    && s.event_name == event_name
                    && s.event_key == event_key
                    && s.subscribe_as_of <= as_of
            })
            .cloned())
    }

    async fn set_subscription_token(
        &self,
        subscription_id: &str,
        token: &str,
        worker_id: &str,
        expiry: DateTime<Utc>,
    ) -> Result<bool> {
        let mut store = self.lock();
        let sub = store
            .subscriptions
            .iter_mut()
            .find(|s| s.id == subscription_id)
            .ok_or_else(|| Error::NotFound(format!("subscription {subscription_id}")))?;

        if sub.external_token.is_some() {
            return Ok(false);
        }
        sub.external_token = Some(token.to_string());
        sub.external_worker_id = Some(worker_id.to_string());
        sub.external_token_expiry = Some(expiry);
        Ok(true)
    }

    async fn clear_subscription_token(&self, subscription_id: &str, token: &str) -> Result<()> {
        let mut store = self.lock();
        let sub = store
            .subscriptions
            .iter_mut()
            .find(|s| s.id == subscription_id)
            .ok_or_else(|| Error::NotFound(format!("subscription {subscription_id}")))?;

        if sub.external_token.as_deref() != Some(token) {
            return Err(Error::TokenMismatch);
        }
        sub.external_token = None;
        sub.external_worker_id = None;
        sub.external_token_expiry = None;
        Ok(())
    }

    async fn terminate_subscription(&self, subscription_id: &str) -> Result<()> {
        let mut store = self.lock();
        store.subscriptions.retain(|s| s.id != subscription_id);
        Ok(())
    }

    async fn create_event(&self, mut event: Event) -> Result<String> {
        let mut store = self.lock();
        if event.id.is_empty() {
            event.id = Uuid::new_v4().to_string();
        }
        let id = event.id.clone();
        store.events.push(event);
        Ok(id)
    }

    async fn get_event(&self, id: &str) -> Result<Event> {
        let store = self.lock();
        store
            .events
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("event {id}")))
    }

    async fn get_runnable_events(&self, as_at: DateTime<Utc>) -> Result<Vec<String>> {
        let store = self.lock();
        Ok(store
            .events
            .iter()
            .filter(|e| !e.is_processed && e.event_time <= as_at)
            .map(|e| e.id.clone())
            .collect())
    }

    async fn get_events(
        &self,
        event_name: &str,
        event_key: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let store = self.lock();
        Ok(store
            .events
            .iter()
            .filter(|e| {
                e.event_name == event_name && e.event_key == event_key && e.event_time >= as_of
            })
            .map(|e| e.id.clone())
            .collect())
    }

    async fn mark_event_processed(&self, id: &str) -> Result<()> {
        let mut store = self.lock();
        if let Some(event) = store.events.iter_mut().find(|e| e.id == id) {
            event.is_processed = true;
        }
        Ok(())
    }

    async fn mark_event_unprocessed(&self, id: &str) -> Result<()> {
        let mut store = self.lock();
        if let Some(event) = store.events.iter_mut().find(|e| e.id == id) {
            event.is_processed = false;
        }
        Ok(())
    }

    async fn persist_errors(&self, errors: &[ExecutionError]) -> Result<()> {
        let mut store = self.lock();
        store.errors.extend_from_slice(errors);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct QueueState {
    items: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl QueueState {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn pop(&self) -> Option<String> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }
}

/// In-process queues backed by `VecDeque`s and a `Notify` per queue.
pub struct SingleNodeQueueProvider {
    queues: HashMap<QueueType, QueueState>,
    dequeue_timeout: Duration,
}

impl SingleNodeQueueProvider {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_millis(100))
    }

    pub fn with_timeout(dequeue_timeout: Duration) -> Self {
        let mut queues = HashMap::new();
        for queue in [QueueType::Workflow, QueueType::Event, QueueType::Index] {
            queues.insert(queue, QueueState::new());
        }
        Self {
            queues,
            dequeue_timeout,
        }
    }

    fn state(&self, queue: QueueType) -> &QueueState {
        // All variants are populated in the constructor.
        &self.queues[&queue]
    }
}

impl Default for SingleNodeQueueProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueProvider for SingleNodeQueueProvider {
    async fn queue_work(&self, id: &str, queue: QueueType) -> Result<()> {
        let state = self.state(queue);
        state
            .items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(id.to_string());
        state.notify.notify_one();
        Ok(())
    }

    async fn dequeue_work(&self, queue: QueueType) -> Result<Option<String>> {
        let state = self.state(queue);
        if let Some(id) = state.pop() {
            return Ok(Some(id));
        }

        // Wait for a producer or give up after the dequeue timeout.
        let _ = tokio::time::timeout(self.dequeue_timeout, state.notify.notified()).await;
        Ok(state.pop())
    }
}

// ---------------------------------------------------------------------------
// Distributed lock
// ---------------------------------------------------------------------------

/// Process-local lock set. Enforces exclusivity within one host only.
#[derive(Default)]
pub struct SingleNodeLockProvider {
    locks: Mutex<HashSet<String>>,
}

impl SingleNodeLockProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLockProvider for SingleNodeLockProvider {
    async fn acquire_lock(&self, id: &str) -> Result<bool> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(locks.insert(id.to_string()))
    }

    async fn release_lock(&self, id: &str) -> Result<()> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Lifecycle event hub
// ---------------------------------------------------------------------------

/// Synchronous fan-out hub for a single process. The buffered publisher
/// in front of it keeps dispatch off the execution path.
#[derive(Default)]
pub struct SingleNodeEventHub {
    subscribers: Mutex<Vec<LifecycleCallback>>,
}

impl SingleNodeEventHub {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LifecycleEventHub for SingleNodeEventHub {
    async fn publish(&self, event: LifecycleEvent) -> Result<()> {
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        for subscriber in subscribers.iter() {
            subscriber(&event);
        }
        Ok(())
    }

    fn subscribe(&self, callback: LifecycleCallback) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    async fn stop(&self) -> Result<()> {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }
}
