//! Step execution results and the step body contract.
//!
//! A body reports what happened as data — proceed, sleep, branch, or wait
//! for an event — and the result processor applies it to the pointer tree.
//! Bodies reserve `Err` for genuine failures that should enter the error
//! handling policy chain.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::model::definition::StepId;
use crate::model::instance::PointerId;
use crate::model::subscription::{EventSubscription, ExecutionError};

// ---------------------------------------------------------------------------
// Execution result
// ---------------------------------------------------------------------------

/// The outcome of running a step body once.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    /// True: the step is done and successors may be scheduled.
    /// False: the step is branching into child pointers.
    pub proceed: bool,
    /// Value consulted by outcome matchers.
    pub outcome_value: Option<Value>,
    /// Continuation state stored on the pointer for re-entry.
    pub persistence_data: Option<Value>,
    /// Park the pointer for this long before re-execution.
    pub sleep_for: Option<chrono::Duration>,
    /// Branch values; crossed with the step's children to spawn pointers.
    pub branch_values: Vec<Value>,
    /// Non-empty: park the pointer until this event arrives.
    pub event_name: Option<String>,
    pub event_key: Option<String>,
    /// Only events effective at or after this instant match.
    pub event_as_of: Option<DateTime<Utc>>,
    /// Payload stored on the subscription (activity parameters).
    pub subscription_data: Option<Value>,
}

impl ExecutionResult {
    /// Step is done; advance to matching outcomes.
    pub fn next() -> Self {
        Self {
            proceed: true,
            ..Default::default()
        }
    }

    /// Step is done with an outcome value for the matchers.
    pub fn outcome(value: Value) -> Self {
        Self {
            proceed: true,
            outcome_value: Some(value),
            ..Default::default()
        }
    }

    /// Step is not done; store continuation state and run again next
    /// iteration.
    pub fn persist(data: Value) -> Self {
        Self {
            proceed: false,
            persistence_data: Some(data),
            ..Default::default()
        }
    }

    /// Step is not done; park for `duration`, keeping continuation state.
    pub fn sleep(duration: chrono::Duration, data: Value) -> Self {
        Self {
            proceed: false,
            persistence_data: Some(data),
            sleep_for: Some(duration),
            ..Default::default()
        }
    }

    /// Fan out into child pointers, one per branch value per child step.
    pub fn branch(branch_values: Vec<Value>, data: Value) -> Self {
        Self {
            proceed: false,
            persistence_data: Some(data),
            branch_values,
            ..Default::default()
        }
    }

    /// Park the pointer until a matching event is published.
    pub fn wait_for_event(
        name: impl Into<String>,
        key: impl Into<String>,
        as_of: DateTime<Utc>,
    ) -> Self {
        Self {
            proceed: false,
            event_name: Some(name.into()),
            event_key: Some(key.into()),
            event_as_of: Some(as_of),
            ..Default::default()
        }
    }

    /// Park the pointer until an activity worker submits a result.
    pub fn wait_for_activity(
        activity_name: impl Into<String>,
        parameters: Option<Value>,
        as_of: DateTime<Utc>,
    ) -> Self {
        Self {
            proceed: false,
            event_name: Some(crate::model::subscription::ACTIVITY_EVENT.to_string()),
            event_key: Some(activity_name.into()),
            event_as_of: Some(as_of),
            subscription_data: parameters,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Step context
// ---------------------------------------------------------------------------

/// Everything a step body sees while running.
///
/// The context is a per-execution snapshot: `data` is the workflow data at
/// iteration time, `inputs` the object assembled from the step's input
/// bindings, and `outputs` the object the body fills for the step's output
/// bindings to copy back.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workflow_id: String,
    pub step_id: StepId,
    pub pointer_id: PointerId,
    /// The branch value this pointer runs under, if any.
    pub item: Option<Value>,
    /// Continuation state from the previous execution of this pointer.
    pub persistence_data: Option<Value>,
    /// Set once a matching external event has been delivered.
    pub event_published: bool,
    pub event_data: Option<Value>,
    /// Outcome value of the predecessor pointer, if any.
    pub predecessor_outcome: Option<Value>,
    /// True when every pointer scoped under this one has ended.
    pub branch_complete: bool,
    /// Snapshot of the workflow data.
    pub data: Value,
    /// Object assembled from the step's input bindings.
    pub inputs: Value,
    /// Object the body fills; output bindings copy it into workflow data.
    pub outputs: Value,
}

// ---------------------------------------------------------------------------
// Step body
// ---------------------------------------------------------------------------

/// A unit of work. Container steps implement control flow here; plain
/// steps do domain work.
#[async_trait::async_trait]
pub trait StepBody: Send + Sync {
    async fn run(&self, context: &mut StepContext) -> Result<ExecutionResult>;
}

// ---------------------------------------------------------------------------
// Iteration result
// ---------------------------------------------------------------------------

/// What one executor iteration produced for the host to persist.
#[derive(Debug, Default)]
pub struct WorkflowExecutorResult {
    pub subscriptions: Vec<EventSubscription>,
    pub errors: Vec<ExecutionError>,
}
