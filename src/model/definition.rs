//! Workflow definitions: steps, outcomes, bindings, and error policy.
//!
//! A definition is immutable once registered. Steps reference each other
//! by integer id; the step tree is expressed through `children`, successor
//! edges through `outcomes`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::instance::ExecutionPointer;
use crate::model::result::{ExecutionResult, StepBody, StepContext};

/// Step id, unique within one definition.
pub type StepId = i32;

// ---------------------------------------------------------------------------
// Error policy
// ---------------------------------------------------------------------------

/// What to do when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorBehavior {
    /// Reschedule the same pointer after a backoff interval.
    Retry,
    /// Suspend the whole workflow instance.
    Suspend,
    /// Terminate the whole workflow instance.
    Terminate,
    /// Schedule the compensation step for the failed scope.
    Compensate,
}

impl fmt::Display for ErrorBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorBehavior::Retry => "retry",
            ErrorBehavior::Suspend => "suspend",
            ErrorBehavior::Terminate => "terminate",
            ErrorBehavior::Compensate => "compensate",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Predicate deciding whether an outcome applies to a completed step.
#[derive(Clone)]
pub enum OutcomeMatcher {
    /// Unconditional transition.
    Always,
    /// Matches when the step's outcome value equals this value.
    Value(Value),
    /// Arbitrary predicate over the execution result and workflow data.
    Expr(Arc<dyn Fn(&ExecutionResult, &Value) -> bool + Send + Sync>),
}

/// A conditioned transition from a completed step to a successor step.
///
/// Outcomes are evaluated in declared order; every matching outcome
/// produces a successor pointer, so multiple matches fan out.
#[derive(Clone)]
pub struct StepOutcome {
    pub next_step: StepId,
    pub label: Option<String>,
    pub matcher: OutcomeMatcher,
}

impl StepOutcome {
    /// Unconditional outcome to `next_step`.
    pub fn next(next_step: StepId) -> Self {
        Self {
            next_step,
            label: None,
            matcher: OutcomeMatcher::Always,
        }
    }

    /// Outcome taken when the step's outcome value equals `value`.
    pub fn when_value(next_step: StepId, value: Value) -> Self {
        Self {
            next_step,
            label: None,
            matcher: OutcomeMatcher::Value(value),
        }
    }

    /// Outcome taken when `predicate(result, workflow_data)` holds.
    pub fn when<F>(next_step: StepId, predicate: F) -> Self
    where
        F: Fn(&ExecutionResult, &Value) -> bool + Send + Sync + 'static,
    {
        Self {
            next_step,
            label: None,
            matcher: OutcomeMatcher::Expr(Arc::new(predicate)),
        }
    }

    /// Does this outcome apply to the given result and workflow data?
    pub fn matches(&self, result: &ExecutionResult, data: &Value) -> bool {
        match &self.matcher {
            OutcomeMatcher::Always => true,
            OutcomeMatcher::Value(v) => result.outcome_value.as_ref() == Some(v),
            OutcomeMatcher::Expr(f) => f.as_ref()(result, data),
        }
    }

    /// Match against workflow data alone, with no step result available.
    /// Used when resuming a compensated scope.
    pub fn matches_data(&self, data: &Value) -> bool {
        self.matches(&ExecutionResult::next(), data)
    }
}

// ---------------------------------------------------------------------------
// Parameter bindings
// ---------------------------------------------------------------------------

/// Where a bound value comes from.
#[derive(Clone)]
pub enum DataSource {
    /// A named top-level field of the source object.
    Field(String),
    /// A pure function computed over the whole source object.
    Compute(Arc<dyn Fn(&Value) -> Value + Send + Sync>),
}

/// Copies one value between workflow data and a step io object.
///
/// For inputs the source object is the workflow data and the destination
/// is the step's input object; for outputs the source is the step's
/// output object and the destination is the workflow data. Bindings are
/// resolved when the definition is built, not per execution.
#[derive(Clone)]
pub struct DataMapping {
    pub source: DataSource,
    pub target: String,
}

impl DataMapping {
    pub fn field(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            source: DataSource::Field(from.into()),
            target: to.into(),
        }
    }

    pub fn compute<F>(f: F, to: impl Into<String>) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self {
            source: DataSource::Compute(Arc::new(f)),
            target: to.into(),
        }
    }

    /// Resolve the source against `from` and assign it to `target` on `to`.
    /// A non-object destination is replaced with a fresh object first.
    pub fn apply(&self, from: &Value, to: &mut Value) {
        let value = match &self.source {
            DataSource::Field(name) => from.get(name).cloned().unwrap_or(Value::Null),
            DataSource::Compute(f) => f.as_ref()(from),
        };

        if !to.is_object() {
            *to = Value::Object(serde_json::Map::new());
        }
        if let Some(map) = to.as_object_mut() {
            map.insert(self.target.clone(), value);
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle hooks
// ---------------------------------------------------------------------------

/// What a lifecycle hook tells the executor to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineDirective {
    /// Carry on with the execution pipeline.
    Next,
    /// Skip this pointer for the current iteration.
    Defer,
    /// Mark the whole workflow complete.
    EndWorkflow,
}

/// Lifecycle hooks a step may override. All default to no-ops that proceed.
pub trait StepHooks: Send + Sync {
    fn init_for_execution(&self, pointer: &mut ExecutionPointer) -> PipelineDirective {
        let _ = pointer;
        PipelineDirective::Next
    }

    fn before_execute(
        &self,
        context: &StepContext,
        pointer: &mut ExecutionPointer,
    ) -> PipelineDirective {
        let _ = (context, pointer);
        PipelineDirective::Next
    }

    fn after_execute(&self, result: &ExecutionResult, pointer: &mut ExecutionPointer) {
        let _ = (result, pointer);
    }

    /// Reset pointer state before a retry attempt.
    fn prime_for_retry(&self, pointer: &mut ExecutionPointer) {
        let _ = pointer;
    }

    fn after_workflow_iteration(&self, pointer: &mut ExecutionPointer) {
        let _ = pointer;
    }
}

/// The default hook set: every hook is a no-op.
pub struct NoopHooks;

impl StepHooks for NoopHooks {}

/// Hooks for saga containers: a retry restarts the whole scope, so the
/// container's continuation state is discarded.
pub struct SagaHooks;

impl StepHooks for SagaHooks {
    fn prime_for_retry(&self, pointer: &mut ExecutionPointer) {
        pointer.persistence_data = None;
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// How the executor obtains a step body instance.
#[derive(Clone)]
pub enum BodySource {
    /// Resolve from the service registry by name; unresolvable names are a
    /// construction error handled with the error retry interval.
    Service(String),
    /// Construct directly from a factory.
    Factory(Arc<dyn Fn() -> Box<dyn StepBody> + Send + Sync>),
}

impl BodySource {
    pub fn factory<F>(f: F) -> Self
    where
        F: Fn() -> Box<dyn StepBody> + Send + Sync + 'static,
    {
        BodySource::Factory(Arc::new(f))
    }
}

/// Predicate over workflow data that cancels a step's pointers when true.
pub type CancelPredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// One node of a workflow definition.
#[derive(Clone)]
pub struct WorkflowStep {
    pub id: StepId,
    pub name: Option<String>,
    pub body: BodySource,
    /// Child step ids — the roots of branches this step fans out into.
    pub children: Vec<StepId>,
    /// Successor transitions, evaluated in order on completion.
    pub outcomes: Vec<StepOutcome>,
    /// Bindings copied from workflow data into the step's inputs.
    pub inputs: Vec<DataMapping>,
    /// Bindings copied from the step's outputs back into workflow data.
    pub outputs: Vec<DataMapping>,
    pub error_behavior: Option<ErrorBehavior>,
    pub retry_interval: Option<chrono::Duration>,
    pub compensation_step_id: Option<StepId>,
    pub resume_children_after_compensation: bool,
    pub revert_children_after_compensation: bool,
    pub cancel_condition: Option<CancelPredicate>,
    /// When cancelled, complete the step as if it proceeded instead of
    /// hard-stopping the branch.
    pub proceed_on_cancel: bool,
    pub hooks: Arc<dyn StepHooks>,
}

impl WorkflowStep {
    pub fn new(id: StepId, body: BodySource) -> Self {
        Self {
            id,
            name: None,
            body,
            children: Vec::new(),
            outcomes: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            error_behavior: None,
            retry_interval: None,
            compensation_step_id: None,
            resume_children_after_compensation: true,
            revert_children_after_compensation: false,
            cancel_condition: None,
            proceed_on_cancel: false,
            hooks: Arc::new(NoopHooks),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_outcome(mut self, outcome: StepOutcome) -> Self {
        self.outcomes.push(outcome);
        self
    }

    pub fn with_children(mut self, children: Vec<StepId>) -> Self {
        self.children = children;
        self
    }

    pub fn with_input(mut self, mapping: DataMapping) -> Self {
        self.inputs.push(mapping);
        self
    }

    pub fn with_output(mut self, mapping: DataMapping) -> Self {
        self.outputs.push(mapping);
        self
    }

    pub fn with_error_behavior(mut self, behavior: ErrorBehavior) -> Self {
        self.error_behavior = Some(behavior);
        self
    }

    pub fn with_retry_interval(mut self, interval: chrono::Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    pub fn with_compensation(mut self, step_id: StepId) -> Self {
        self.compensation_step_id = Some(step_id);
        self
    }

    pub fn with_cancel_condition<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.cancel_condition = Some(Arc::new(predicate));
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn StepHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Saga container preset: children revert on compensation and a retry
    /// restarts the scope from scratch.
    pub fn as_saga(mut self) -> Self {
        self.resume_children_after_compensation = false;
        self.revert_children_after_compensation = true;
        self.hooks = Arc::new(SagaHooks);
        self
    }

    /// Display name for logs and notifications.
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| format!("step-{}", self.id))
    }
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// Handler invoked when workflow middleware fails after the workflow has
/// already progressed (post/execute phases).
#[async_trait::async_trait]
pub trait MiddlewareErrorHandler: Send + Sync {
    async fn handle(&self, workflow_id: &str, error: &crate::error::Error);
}

/// A registered workflow shape. `(id, version)` is the composite key.
#[derive(Clone)]
pub struct WorkflowDefinition {
    pub id: String,
    pub version: i32,
    pub description: Option<String>,
    /// Steps in declaration order. The first step is the genesis step.
    pub steps: Vec<WorkflowStep>,
    /// Template cloned into instances started without explicit data.
    pub default_data: Option<Value>,
    pub default_error_behavior: ErrorBehavior,
    pub default_error_retry_interval: Option<chrono::Duration>,
    pub on_post_middleware_error: Option<Arc<dyn MiddlewareErrorHandler>>,
    pub on_execute_middleware_error: Option<Arc<dyn MiddlewareErrorHandler>>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, version: i32) -> Self {
        Self {
            id: id.into(),
            version,
            description: None,
            steps: Vec::new(),
            default_data: None,
            default_error_behavior: ErrorBehavior::Retry,
            default_error_retry_interval: None,
            on_post_middleware_error: None,
            on_execute_middleware_error: None,
        }
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_default_data(mut self, data: Value) -> Self {
        self.default_data = Some(data);
        self
    }

    pub fn with_default_error_behavior(mut self, behavior: ErrorBehavior) -> Self {
        self.default_error_behavior = behavior;
        self
    }

    pub fn find_step(&self, id: StepId) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// The designated start step: the first step in declaration order.
    pub fn initial_step(&self) -> Option<&WorkflowStep> {
        self.steps.first()
    }
}
