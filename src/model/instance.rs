//! Runtime state: workflow instances and their execution pointers.
//!
//! An instance owns a flat, ordered collection of pointers. Tree structure
//! is expressed through `scope`, `children`, and `predecessor_id` rather
//! than nesting, so lookup by id stays cheap and scans stay linear.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::model::definition::StepId;

// ---------------------------------------------------------------------------
// Pointer identity
// ---------------------------------------------------------------------------

/// Newtype for execution pointer ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PointerId(pub Uuid);

impl PointerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PointerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PointerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of one execution pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerStatus {
    /// Persisted before status tracking existed; treated as pending.
    Legacy,
    /// Ready to run on the next iteration.
    Pending,
    /// Currently executing (or mid-retry).
    Running,
    /// Parked until `sleep_until`.
    Sleeping,
    /// Finished successfully. Terminal.
    Complete,
    /// Last execution failed; error policy decides what happens next.
    Failed,
    /// Undone by a compensation step. Terminal.
    Compensated,
    /// Parked until a matching external event arrives.
    WaitingForEvent,
    /// Created ahead of a join; activates when its predecessors finish.
    PendingPredecessor,
    /// Cancelled by a cancel condition. Terminal unless resumed.
    Cancelled,
}

impl fmt::Display for PointerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PointerStatus::Legacy => "legacy",
            PointerStatus::Pending => "pending",
            PointerStatus::Running => "running",
            PointerStatus::Sleeping => "sleeping",
            PointerStatus::Complete => "complete",
            PointerStatus::Failed => "failed",
            PointerStatus::Compensated => "compensated",
            PointerStatus::WaitingForEvent => "waiting_for_event",
            PointerStatus::PendingPredecessor => "pending_predecessor",
            PointerStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle state of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Runnable,
    Suspended,
    Complete,
    Terminated,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::Runnable => "runnable",
            WorkflowStatus::Suspended => "suspended",
            WorkflowStatus::Complete => "complete",
            WorkflowStatus::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Execution pointer
// ---------------------------------------------------------------------------

/// A position within a workflow's step tree, tracking one branch's progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPointer {
    pub id: PointerId,
    /// Back-reference into the owning definition.
    pub step_id: StepId,
    pub active: bool,
    pub status: PointerStatus,
    /// Opaque step-specific continuation state.
    pub persistence_data: Option<Value>,
    /// The pointer whose completion created this one. Not ownership.
    pub predecessor_id: Option<PointerId>,
    /// Pointers spawned from this one (parallel branches). A pointer with
    /// children is branching and only runs again once its branch completes.
    pub children: Vec<PointerId>,
    /// Ancestor pointer ids, innermost first — the compensation and
    /// cancellation lexical scope.
    pub scope: Vec<PointerId>,
    /// The branch value passed down by a container step.
    pub context_item: Option<Value>,
    /// Value produced on completion, consulted by outcome matchers.
    pub outcome: Option<Value>,
    pub sleep_until: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub event_name: Option<String>,
    pub event_key: Option<String>,
    pub event_published: bool,
    pub event_data: Option<Value>,
    pub retry_count: u32,
    pub step_name: Option<String>,
}

impl ExecutionPointer {
    /// A fresh pending pointer for `step_id`. Callers fill in lineage.
    pub fn pending(step_id: StepId) -> Self {
        Self {
            id: PointerId::new(),
            step_id,
            active: true,
            status: PointerStatus::Pending,
            persistence_data: None,
            predecessor_id: None,
            children: Vec::new(),
            scope: Vec::new(),
            context_item: None,
            outcome: None,
            sleep_until: None,
            start_time: None,
            end_time: None,
            event_name: None,
            event_key: None,
            event_published: false,
            event_data: None,
            retry_count: 0,
            step_name: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow instance
// ---------------------------------------------------------------------------

/// One running (or finished) workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: String,
    pub workflow_definition_id: String,
    pub version: i32,
    pub description: Option<String>,
    /// Caller-supplied correlation reference.
    pub reference: Option<String>,
    /// The full execution tree as a flat list.
    pub execution_pointers: Vec<ExecutionPointer>,
    /// Next wake time in milliseconds since the epoch; 0 means run
    /// immediately, `None` means nothing is schedulable.
    pub next_execution: Option<i64>,
    pub status: WorkflowStatus,
    /// Workflow-scoped payload. Opaque to the engine; bindings and
    /// predicates interpret it.
    pub data: Value,
    pub create_time: DateTime<Utc>,
    pub complete_time: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn find_pointer(&self, id: &PointerId) -> Option<&ExecutionPointer> {
        self.execution_pointers.iter().find(|p| &p.id == id)
    }

    pub fn find_pointer_mut(&mut self, id: &PointerId) -> Option<&mut ExecutionPointer> {
        self.execution_pointers.iter_mut().find(|p| &p.id == id)
    }

    /// Pointers whose scope chain contains `ancestor` — the descendants of
    /// a branching pointer.
    pub fn pointers_in_scope<'a>(
        &'a self,
        ancestor: &'a PointerId,
    ) -> impl Iterator<Item = &'a ExecutionPointer> {
        self.execution_pointers
            .iter()
            .filter(move |p| p.scope.contains(ancestor))
    }

    /// True when every pointer scoped under `parent` has ended.
    pub fn is_branch_complete(&self, parent: &PointerId) -> bool {
        self.pointers_in_scope(parent).all(|p| p.end_time.is_some())
    }
}
