//! Evaluates cancel conditions and cascades cancellation through scopes.
//!
//! Runs before and after each pointer's execution within an iteration, so
//! cancellation both pre-empts scheduled work and reacts to data changes
//! made by the step that just ran.

use std::sync::Arc;

use chrono::Utc;

use crate::executor::result_processor::ExecutionResultProcessor;
use crate::model::{
    ExecutionResult, PointerId, PointerStatus, WorkflowDefinition, WorkflowExecutorResult,
    WorkflowInstance,
};

pub struct CancellationProcessor {
    result_processor: Arc<ExecutionResultProcessor>,
}

impl CancellationProcessor {
    pub fn new(result_processor: Arc<ExecutionResultProcessor>) -> Self {
        Self { result_processor }
    }

    /// Cancel every pointer whose step's cancel condition holds over the
    /// current workflow data, cascading to scoped descendants. Steps with
    /// `proceed_on_cancel` complete as if they proceeded before the
    /// pointer is marked cancelled.
    pub fn process_cancellations(
        &self,
        workflow: &mut WorkflowInstance,
        def: &WorkflowDefinition,
        executor_result: &mut WorkflowExecutorResult,
    ) {
        for step in def.steps.iter() {
            let Some(condition) = &step.cancel_condition else {
                continue;
            };
            if !condition.as_ref()(&workflow.data) {
                continue;
            }

            let to_cancel: Vec<PointerId> = workflow
                .execution_pointers
                .iter()
                .filter(|p| {
                    p.step_id == step.id
                        && p.status != PointerStatus::Complete
                        && p.status != PointerStatus::Cancelled
                })
                .map(|p| p.id.clone())
                .collect();

            for pointer_id in to_cancel {
                if step.proceed_on_cancel {
                    self.result_processor.process_execution_result(
                        workflow,
                        def,
                        &pointer_id,
                        step,
                        &ExecutionResult::next(),
                        executor_result,
                    );
                }

                let now = Utc::now();
                if let Some(pointer) = workflow.find_pointer_mut(&pointer_id) {
                    pointer.end_time = Some(now);
                    pointer.active = false;
                    pointer.status = PointerStatus::Cancelled;
                }

                // Cascade: unwind every non-terminal descendant in scope.
                let descendants: Vec<PointerId> = workflow
                    .pointers_in_scope(&pointer_id)
                    .filter(|p| {
                        p.status != PointerStatus::Complete && p.status != PointerStatus::Cancelled
                    })
                    .map(|p| p.id.clone())
                    .collect();
                for descendant_id in descendants {
                    if let Some(pointer) = workflow.find_pointer_mut(&descendant_id) {
                        pointer.end_time = Some(now);
                        pointer.active = false;
                        pointer.status = PointerStatus::Cancelled;
                    }
                }
            }
        }
    }
}
