//! Error handling policies applied to failed pointers.
//!
//! Exactly one handler is registered per `ErrorBehavior` value. Handlers
//! may mutate the workflow, reschedule pointers, spawn compensation
//! pointers, or enqueue further pointers onto the bubble-up queue.

use std::collections::VecDeque;

use chrono::Utc;

use crate::config::EngineOptions;
use crate::error::Error;
use crate::executor::pointer_factory::ExecutionPointerFactory;
use crate::model::{
    ErrorBehavior, ExecutionPointer, PointerId, PointerStatus, WorkflowDefinition,
    WorkflowInstance, WorkflowStatus, WorkflowStep,
};

/// One error handling policy.
pub trait WorkflowErrorHandler: Send + Sync {
    fn error_type(&self) -> ErrorBehavior;

    fn handle(
        &self,
        workflow: &mut WorkflowInstance,
        def: &WorkflowDefinition,
        pointer_id: &PointerId,
        step: &WorkflowStep,
        error: &Error,
        bubble_up: &mut VecDeque<PointerId>,
    );
}

/// The default handler set, in a fixed order.
pub fn default_error_handlers(
    options: &EngineOptions,
) -> Vec<std::sync::Arc<dyn WorkflowErrorHandler>> {
    vec![
        std::sync::Arc::new(RetryHandler::new(options.clone())),
        std::sync::Arc::new(SuspendHandler),
        std::sync::Arc::new(TerminateHandler),
        std::sync::Arc::new(CompensateHandler::new()),
    ]
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Reschedules the failed pointer after a backoff interval. The interval
/// resolves step → definition → engine default.
pub struct RetryHandler {
    options: EngineOptions,
}

impl RetryHandler {
    pub fn new(options: EngineOptions) -> Self {
        Self { options }
    }
}

impl WorkflowErrorHandler for RetryHandler {
    fn error_type(&self) -> ErrorBehavior {
        ErrorBehavior::Retry
    }

    fn handle(
        &self,
        workflow: &mut WorkflowInstance,
        def: &WorkflowDefinition,
        pointer_id: &PointerId,
        step: &WorkflowStep,
        _error: &Error,
        _bubble_up: &mut VecDeque<PointerId>,
    ) {
        let interval = step
            .retry_interval
            .or(def.default_error_retry_interval)
            .unwrap_or(self.options.error_retry_interval);

        if let Some(pointer) = workflow.find_pointer_mut(pointer_id) {
            pointer.retry_count += 1;
            pointer.sleep_until = Some(Utc::now() + interval);
            step.hooks.prime_for_retry(pointer);
        }
    }
}

// ---------------------------------------------------------------------------
// Suspend / Terminate
// ---------------------------------------------------------------------------

/// Suspends the whole instance; a host resumes it explicitly.
pub struct SuspendHandler;

impl WorkflowErrorHandler for SuspendHandler {
    fn error_type(&self) -> ErrorBehavior {
        ErrorBehavior::Suspend
    }

    fn handle(
        &self,
        workflow: &mut WorkflowInstance,
        _def: &WorkflowDefinition,
        _pointer_id: &PointerId,
        _step: &WorkflowStep,
        _error: &Error,
        _bubble_up: &mut VecDeque<PointerId>,
    ) {
        workflow.status = WorkflowStatus::Suspended;
    }
}

/// Terminates the whole instance.
pub struct TerminateHandler;

impl WorkflowErrorHandler for TerminateHandler {
    fn error_type(&self) -> ErrorBehavior {
        ErrorBehavior::Terminate
    }

    fn handle(
        &self,
        workflow: &mut WorkflowInstance,
        _def: &WorkflowDefinition,
        _pointer_id: &PointerId,
        _step: &WorkflowStep,
        _error: &Error,
        _bubble_up: &mut VecDeque<PointerId>,
    ) {
        workflow.status = WorkflowStatus::Terminated;
    }
}

// ---------------------------------------------------------------------------
// Compensate
// ---------------------------------------------------------------------------

/// Saga semantics: walks the failed pointer's scope chain innermost to
/// outermost, scheduling compensation steps, and either resumes the
/// enclosing flow or reverts completed siblings depending on the scope's
/// policy. Scope steps with a non-compensate policy of their own are
/// bubbled up for their handler to deal with.
pub struct CompensateHandler {
    pointer_factory: ExecutionPointerFactory,
}

impl CompensateHandler {
    pub fn new() -> Self {
        Self {
            pointer_factory: ExecutionPointerFactory::new(),
        }
    }
}

impl Default for CompensateHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowErrorHandler for CompensateHandler {
    fn error_type(&self) -> ErrorBehavior {
        ErrorBehavior::Compensate
    }

    fn handle(
        &self,
        workflow: &mut WorkflowInstance,
        def: &WorkflowDefinition,
        pointer_id: &PointerId,
        _step: &WorkflowStep,
        _error: &Error,
        bubble_up: &mut VecDeque<PointerId>,
    ) {
        let Some(exception_pointer) = workflow.find_pointer(pointer_id).cloned() else {
            return;
        };

        // The failed pointer itself, then its ancestors innermost first.
        let mut chain: Vec<PointerId> = vec![exception_pointer.id.clone()];
        chain.extend(exception_pointer.scope.iter().cloned());

        for i in 0..chain.len() {
            let scope_id = chain[i].clone();
            let Some(scope_pointer) = workflow.find_pointer(&scope_id).cloned() else {
                continue;
            };
            let Some(scope_step) = def.find_step(scope_pointer.step_id) else {
                continue;
            };

            let (resume, revert) = resolve_compensation_policy(workflow, def, &chain[i + 1..]);

            if scope_step.error_behavior.unwrap_or(ErrorBehavior::Compensate)
                != ErrorBehavior::Compensate
            {
                bubble_up.push_back(scope_id);
                continue;
            }

            let now = Utc::now();
            if let Some(pointer) = workflow.find_pointer_mut(&scope_id) {
                pointer.active = false;
                pointer.end_time = Some(now);
                pointer.status = PointerStatus::Failed;
            }

            if let Some(compensation_step_id) = scope_step.compensation_step_id {
                if let Some(pointer) = workflow.find_pointer_mut(&scope_id) {
                    pointer.status = PointerStatus::Compensated;
                }

                let compensation = self.pointer_factory.build_compensation_pointer(
                    def,
                    &scope_pointer,
                    &exception_pointer,
                    compensation_step_id,
                );
                workflow.execution_pointers.push(compensation);

                if resume {
                    let outcomes: Vec<_> = scope_step
                        .outcomes
                        .iter()
                        .filter(|o| o.matches_data(&workflow.data))
                        .cloned()
                        .collect();
                    for outcome in outcomes {
                        let next = self.pointer_factory.build_next_pointer(
                            def,
                            workflow,
                            &scope_pointer,
                            &outcome,
                        );
                        workflow.execution_pointers.push(next);
                    }
                }
            }

            if revert {
                revert_completed_siblings(
                    workflow,
                    def,
                    &self.pointer_factory,
                    &scope_pointer,
                    &exception_pointer,
                );
            }
        }
    }
}

/// Resume/revert policy of the nearest enclosing ancestor that overrides
/// the defaults (resume = true, revert = false).
fn resolve_compensation_policy(
    workflow: &WorkflowInstance,
    def: &WorkflowDefinition,
    ancestors: &[PointerId],
) -> (bool, bool) {
    for ancestor_id in ancestors {
        let Some(step) = workflow
            .find_pointer(ancestor_id)
            .and_then(|p| def.find_step(p.step_id))
        else {
            continue;
        };
        if !step.resume_children_after_compensation || step.revert_children_after_compensation {
            return (
                step.resume_children_after_compensation,
                step.revert_children_after_compensation,
            );
        }
    }
    (true, false)
}

/// Compensate previously completed siblings of `scope_pointer`, most
/// recently finished first.
fn revert_completed_siblings(
    workflow: &mut WorkflowInstance,
    def: &WorkflowDefinition,
    factory: &ExecutionPointerFactory,
    scope_pointer: &ExecutionPointer,
    exception_pointer: &ExecutionPointer,
) {
    let mut siblings: Vec<ExecutionPointer> = workflow
        .execution_pointers
        .iter()
        .filter(|p| {
            p.scope == scope_pointer.scope
                && p.id != scope_pointer.id
                && p.status == PointerStatus::Complete
        })
        .cloned()
        .collect();
    siblings.sort_by(|a, b| b.end_time.cmp(&a.end_time));

    for sibling in siblings {
        let Some(compensation_step_id) = def
            .find_step(sibling.step_id)
            .and_then(|s| s.compensation_step_id)
        else {
            continue;
        };
        let compensation = factory.build_compensation_pointer(
            def,
            &sibling,
            exception_pointer,
            compensation_step_id,
        );
        workflow.execution_pointers.push(compensation);
        if let Some(pointer) = workflow.find_pointer_mut(&sibling.id) {
            pointer.status = PointerStatus::Compensated;
        }
    }
}
