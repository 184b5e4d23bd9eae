//! Built-in step bodies: control-flow containers, event subscription
//! steps, and closure-backed inline bodies.

pub mod containers;
pub mod events;

pub use containers::{Delay, Foreach, If, OutcomeSwitch, Recur, Sequence, While};
pub use events::{Activity, WaitFor};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Result;
use crate::model::{BodySource, ExecutionResult, StepBody, StepContext};

// ---------------------------------------------------------------------------
// Container continuation state
// ---------------------------------------------------------------------------

/// Continuation state shared by the container bodies: set once children
/// have been spawned, so a re-entry waits for the branch instead of
/// fanning out again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPersistenceData {
    pub children_active: bool,
}

pub(crate) fn control_data() -> Value {
    json!({ "children_active": true })
}

pub(crate) fn children_active(data: &Value) -> bool {
    serde_json::from_value::<ControlPersistenceData>(data.clone())
        .map(|c| c.children_active)
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Inline bodies
// ---------------------------------------------------------------------------

/// A step body backed by a closure. The workhorse for tests and hosts
/// that define small steps in code.
pub struct InlineStepBody<F>(Arc<F>)
where
    F: Fn(&mut StepContext) -> Result<ExecutionResult> + Send + Sync;

#[async_trait::async_trait]
impl<F> StepBody for InlineStepBody<F>
where
    F: Fn(&mut StepContext) -> Result<ExecutionResult> + Send + Sync,
{
    async fn run(&self, context: &mut StepContext) -> Result<ExecutionResult> {
        self.0.as_ref()(context)
    }
}

/// A `BodySource` constructing an inline body from `f`.
pub fn inline<F>(f: F) -> BodySource
where
    F: Fn(&mut StepContext) -> Result<ExecutionResult> + Send + Sync + 'static,
{
    let shared = Arc::new(f);
    BodySource::factory(move || Box::new(InlineStepBody(Arc::clone(&shared))))
}
