//! Applies a step's execution result to the pointer tree.
//!
//! Completion advances outcomes and releases joins; a non-proceeding
//! result fans out child pointers; failures enter the error policy chain.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tracing::error;

use crate::error::Error;
use crate::event::{LifecycleEvent, LifecycleEventKind, LifecycleEventPublisher};
use crate::executor::error_handlers::WorkflowErrorHandler;
use crate::executor::pointer_factory::{has_unfinished_predecessors, ExecutionPointerFactory};
use crate::model::{
    ErrorBehavior, EventSubscription, ExecutionResult, PointerId, PointerStatus, StepOutcome,
    WorkflowDefinition, WorkflowExecutorResult, WorkflowInstance, WorkflowStep,
};

pub struct ExecutionResultProcessor {
    pointer_factory: ExecutionPointerFactory,
    publisher: Arc<LifecycleEventPublisher>,
    error_handlers: Vec<Arc<dyn WorkflowErrorHandler>>,
}

impl ExecutionResultProcessor {
    pub fn new(
        publisher: Arc<LifecycleEventPublisher>,
        error_handlers: Vec<Arc<dyn WorkflowErrorHandler>>,
    ) -> Self {
        Self {
            pointer_factory: ExecutionPointerFactory::new(),
            publisher,
            error_handlers,
        }
    }

    /// Apply `result` to the pointer it came from.
    pub fn process_execution_result(
        &self,
        workflow: &mut WorkflowInstance,
        def: &WorkflowDefinition,
        pointer_id: &PointerId,
        step: &WorkflowStep,
        result: &ExecutionResult,
        executor_result: &mut WorkflowExecutorResult,
    ) {
        let now = Utc::now();

        {
            let Some(pointer) = workflow.find_pointer_mut(pointer_id) else {
                return;
            };
            pointer.persistence_data = result.persistence_data.clone();
            pointer.outcome = result.outcome_value.clone();

            if let Some(sleep_for) = result.sleep_for {
                pointer.sleep_until = Some(now + sleep_for);
                pointer.status = PointerStatus::Sleeping;
            }

            if let Some(event_name) = &result.event_name {
                pointer.event_name = Some(event_name.clone());
                pointer.event_key = result.event_key.clone();
                pointer.active = false;
                pointer.status = PointerStatus::WaitingForEvent;
            }
        }

        if let Some(event_name) = &result.event_name {
            executor_result.subscriptions.push(EventSubscription {
                id: String::new(),
                workflow_id: workflow.id.clone(),
                step_id: step.id,
                execution_pointer_id: pointer_id.clone(),
                event_name: event_name.clone(),
                event_key: result.event_key.clone().unwrap_or_default(),
                subscribe_as_of: result.event_as_of.unwrap_or(now),
                subscription_data: result.subscription_data.clone(),
                external_token: None,
                external_worker_id: None,
                external_token_expiry: None,
            });
        }

        if result.proceed {
            self.complete_pointer(workflow, def, pointer_id, step, result, now);
        } else {
            self.branch_pointer(workflow, def, pointer_id, step, result);
        }
    }

    fn complete_pointer(
        &self,
        workflow: &mut WorkflowInstance,
        def: &WorkflowDefinition,
        pointer_id: &PointerId,
        step: &WorkflowStep,
        result: &ExecutionResult,
        now: chrono::DateTime<Utc>,
    ) {
        let completed = {
            let Some(pointer) = workflow.find_pointer_mut(pointer_id) else {
                return;
            };
            pointer.active = false;
            pointer.end_time = Some(now);
            pointer.status = PointerStatus::Complete;
            pointer.clone()
        };

        let matched: Vec<StepOutcome> = step
            .outcomes
            .iter()
            .filter(|o| o.matches(result, &workflow.data))
            .cloned()
            .collect();

        for outcome in matched {
            // A deferred pointer for this target already waiting in the
            // same scope is the join; release it rather than duplicating.
            let deferred = workflow
                .execution_pointers
                .iter()
                .find(|p| {
                    p.status == PointerStatus::PendingPredecessor
                        && p.step_id == outcome.next_step
                        && p.scope == completed.scope
                })
                .map(|p| p.id.clone());

            if let Some(deferred_id) = deferred {
                self.try_release_join(workflow, def, &deferred_id, &completed.id);
                continue;
            }

            let next = self
                .pointer_factory
                .build_next_pointer(def, workflow, &completed, &outcome);
            workflow.execution_pointers.push(next);
        }

        // Join release for successors this pointer created earlier.
        let waiting: Vec<PointerId> = workflow
            .execution_pointers
            .iter()
            .filter(|p| {
                p.status == PointerStatus::PendingPredecessor
                    && p.predecessor_id.as_ref() == Some(pointer_id)
            })
            .map(|p| p.id.clone())
            .collect();
        for id in waiting {
            self.try_release_join(workflow, def, &id, pointer_id);
        }

        self.publisher.publish(LifecycleEvent::for_workflow(
            workflow,
            LifecycleEventKind::StepCompleted {
                pointer_id: pointer_id.clone(),
                step_id: step.id,
            },
        ));
    }

    /// Activate a deferred join pointer once no predecessor remains
    /// unfinished.
    fn try_release_join(
        &self,
        workflow: &mut WorkflowInstance,
        def: &WorkflowDefinition,
        deferred_id: &PointerId,
        completed_id: &PointerId,
    ) {
        let Some((scope, step_id)) = workflow
            .find_pointer(deferred_id)
            .map(|p| (p.scope.clone(), p.step_id))
        else {
            return;
        };
        if has_unfinished_predecessors(workflow, def, &scope, step_id, completed_id) {
            return;
        }
        if let Some(pointer) = workflow.find_pointer_mut(deferred_id) {
            pointer.status = PointerStatus::Pending;
            pointer.active = true;
        }
    }

    fn branch_pointer(
        &self,
        workflow: &mut WorkflowInstance,
        def: &WorkflowDefinition,
        pointer_id: &PointerId,
        step: &WorkflowStep,
        result: &ExecutionResult,
    ) {
        let Some(parent) = workflow.find_pointer(pointer_id).cloned() else {
            return;
        };

        let mut children = Vec::new();
        for branch in &result.branch_values {
            for child_step in &step.children {
                children.push(self.pointer_factory.build_child_pointer(
                    def,
                    &parent,
                    *child_step,
                    branch.clone(),
                ));
            }
        }

        for child in children {
            if let Some(pointer) = workflow.find_pointer_mut(pointer_id) {
                pointer.children.push(child.id.clone());
            }
            workflow.execution_pointers.push(child);
        }
    }

    /// Route a failed pointer through the error policy chain.
    ///
    /// A breadth-first bubble-up queue starts at the failed pointer. For
    /// each pointer the effective policy is the step's own behavior, or
    /// Compensate when anything in scope declares compensation, or the
    /// definition default. Handlers may enqueue further pointers.
    pub fn handle_step_exception(
        &self,
        workflow: &mut WorkflowInstance,
        def: &WorkflowDefinition,
        pointer_id: &PointerId,
        step: &WorkflowStep,
        error: &Error,
    ) {
        self.publisher.publish(LifecycleEvent::for_workflow(
            workflow,
            LifecycleEventKind::WorkflowError {
                pointer_id: pointer_id.clone(),
                step_id: step.id,
                message: error.to_string(),
            },
        ));

        if let Some(pointer) = workflow.find_pointer_mut(pointer_id) {
            pointer.status = PointerStatus::Failed;
        }

        let mut queue = VecDeque::new();
        queue.push_back(pointer_id.clone());

        while let Some(current_id) = queue.pop_front() {
            let Some(current_step) = workflow
                .find_pointer(&current_id)
                .and_then(|p| def.find_step(p.step_id))
            else {
                continue;
            };

            let should_compensate = scope_requires_compensation(workflow, def, &current_id);
            let policy = current_step.error_behavior.unwrap_or(if should_compensate {
                ErrorBehavior::Compensate
            } else {
                def.default_error_behavior
            });

            let handlers: Vec<Arc<dyn WorkflowErrorHandler>> = self
                .error_handlers
                .iter()
                .filter(|h| h.error_type() == policy)
                .cloned()
                .collect();
            if handlers.is_empty() {
                error!(%policy, pointer = %current_id, "no error handler registered; pointer remains failed");
                continue;
            }
            let current_step = current_step.clone();
            for handler in handlers {
                handler.handle(workflow, def, &current_id, &current_step, error, &mut queue);
            }
        }
    }
}

/// True when the pointer itself or any ancestor in its scope declares a
/// compensation step or reverts children after compensation.
fn scope_requires_compensation(
    workflow: &WorkflowInstance,
    def: &WorkflowDefinition,
    pointer_id: &PointerId,
) -> bool {
    let Some(pointer) = workflow.find_pointer(pointer_id) else {
        return false;
    };
    std::iter::once(&pointer.id)
        .chain(pointer.scope.iter())
        .any(|id| {
            workflow
                .find_pointer(id)
                .and_then(|p| def.find_step(p.step_id))
                .is_some_and(|s| {
                    s.compensation_step_id.is_some() || s.revert_children_after_compensation
                })
        })
}
