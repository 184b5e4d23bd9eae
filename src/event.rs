//! Lifecycle notifications emitted by the engine, and the buffered
//! publisher that dispatches them.
//!
//! Notifications are the engine's voice: controllers and executors emit
//! one on every significant transition. Publishing never blocks the
//! execution path — events are buffered and drained by a background task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

use crate::model::{PointerId, StepId, WorkflowInstance};
use crate::providers::LifecycleEventHub;

// ---------------------------------------------------------------------------
// Notification types
// ---------------------------------------------------------------------------

/// A lifecycle notification with its workflow envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub timestamp: DateTime<Utc>,
    pub workflow_id: String,
    pub definition_id: String,
    pub version: i32,
    pub reference: Option<String>,
    pub kind: LifecycleEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEventKind {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowSuspended,
    WorkflowResumed,
    WorkflowTerminated,
    StepStarted {
        pointer_id: PointerId,
        step_id: StepId,
    },
    StepCompleted {
        pointer_id: PointerId,
        step_id: StepId,
    },
    WorkflowError {
        pointer_id: PointerId,
        step_id: StepId,
        message: String,
    },
}

impl LifecycleEvent {
    /// Build a notification enveloped with `workflow`'s identity.
    pub fn for_workflow(workflow: &WorkflowInstance, kind: LifecycleEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            workflow_id: workflow.id.clone(),
            definition_id: workflow.workflow_definition_id.clone(),
            version: workflow.version,
            reference: workflow.reference.clone(),
            kind,
        }
    }
}

// ---------------------------------------------------------------------------
// Buffered publisher
// ---------------------------------------------------------------------------

/// Fan-out publisher in front of the lifecycle event hub.
///
/// `publish` is synchronous and never blocks: events land on an unbounded
/// channel and a background task drains them to the hub. A slow or failing
/// hub subscriber cannot stall a workflow iteration.
pub struct LifecycleEventPublisher {
    tx: Mutex<Option<mpsc::UnboundedSender<LifecycleEvent>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    enabled: bool,
}

impl LifecycleEventPublisher {
    /// Start the dispatch task. Requires a Tokio runtime.
    pub fn start(hub: Arc<dyn LifecycleEventHub>, enabled: bool) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LifecycleEvent>();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = hub.publish(event).await {
                    error!("lifecycle event publish failed: {e}");
                }
            }
        });

        Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            enabled,
        }
    }

    /// Queue a notification for dispatch. A no-op when disabled or stopped.
    pub fn publish(&self, event: LifecycleEvent) {
        if !self.enabled {
            return;
        }
        if let Ok(guard) = self.tx.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(event);
            }
        }
    }

    /// Close the outbox and wait for the dispatch task to drain it.
    pub async fn stop(&self) {
        let tx = self.tx.lock().ok().and_then(|mut g| g.take());
        drop(tx);
        let handle = self.handle.lock().ok().and_then(|mut g| g.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
