//! Builds execution pointers from definitions and current state.
//!
//! Pure construction: existing pointers are never mutated here. Linking a
//! child into its parent's `children` list is the caller's job.

use crate::model::{
    ExecutionPointer, PointerId, PointerStatus, StepId, StepOutcome, WorkflowDefinition,
    WorkflowInstance, WorkflowStep,
};

/// Factory for genesis, successor, child, and compensation pointers.
#[derive(Default, Clone, Copy)]
pub struct ExecutionPointerFactory;

impl ExecutionPointerFactory {
    pub fn new() -> Self {
        Self
    }

    /// The initial pointer of a fresh instance, referencing the
    /// definition's start step. The registry guarantees definitions have
    /// at least one step.
    pub fn build_genesis_pointer(&self, def: &WorkflowDefinition) -> ExecutionPointer {
        let step = def.initial_step();
        let mut pointer = ExecutionPointer::pending(step.map(|s| s.id).unwrap_or_default());
        pointer.step_name = step.map(WorkflowStep::display_name);
        pointer
    }

    /// A successor pointer for `outcome.next_step`, inheriting the scope
    /// and branch value of `current`.
    ///
    /// When the target step has other unfinished predecessor pointers in
    /// the same scope (a join), the successor is created inactive as
    /// `PendingPredecessor`; the result processor releases it once the
    /// last predecessor completes.
    pub fn build_next_pointer(
        &self,
        def: &WorkflowDefinition,
        workflow: &WorkflowInstance,
        current: &ExecutionPointer,
        outcome: &StepOutcome,
    ) -> ExecutionPointer {
        let mut pointer = ExecutionPointer::pending(outcome.next_step);
        pointer.predecessor_id = Some(current.id.clone());
        pointer.scope = current.scope.clone();
        pointer.context_item = current.context_item.clone();
        pointer.step_name = def
            .find_step(outcome.next_step)
            .map(WorkflowStep::display_name);

        if has_unfinished_predecessors(workflow, def, &current.scope, outcome.next_step, &current.id)
        {
            pointer.status = PointerStatus::PendingPredecessor;
            pointer.active = false;
        }

        pointer
    }

    /// A child pointer for one branch of a container step. The parent's
    /// id is pushed onto the scope and the branch value becomes the
    /// child's context item.
    pub fn build_child_pointer(
        &self,
        def: &WorkflowDefinition,
        parent: &ExecutionPointer,
        child_step_id: StepId,
        branch_value: serde_json::Value,
    ) -> ExecutionPointer {
        let mut pointer = ExecutionPointer::pending(child_step_id);
        pointer.predecessor_id = Some(parent.id.clone());
        pointer.context_item = Some(branch_value);
        pointer.scope = std::iter::once(parent.id.clone())
            .chain(parent.scope.iter().cloned())
            .collect();
        pointer.step_name = def.find_step(child_step_id).map(WorkflowStep::display_name);
        pointer
    }

    /// A pointer running the compensation step for `compensated`. The
    /// failed pointer becomes the predecessor so compensation bodies can
    /// inspect what went wrong.
    pub fn build_compensation_pointer(
        &self,
        def: &WorkflowDefinition,
        compensated: &ExecutionPointer,
        exception_pointer: &ExecutionPointer,
        compensation_step_id: StepId,
    ) -> ExecutionPointer {
        let mut pointer = ExecutionPointer::pending(compensation_step_id);
        pointer.predecessor_id = Some(exception_pointer.id.clone());
        pointer.context_item = compensated.context_item.clone();
        pointer.scope = compensated.scope.clone();
        pointer.step_name = def
            .find_step(compensation_step_id)
            .map(WorkflowStep::display_name);
        pointer
    }
}

/// True when another pointer in `scope` whose step leads into
/// `target_step` has not yet ended — the join is still waiting.
pub(crate) fn has_unfinished_predecessors(
    workflow: &WorkflowInstance,
    def: &WorkflowDefinition,
    scope: &[PointerId],
    target_step: StepId,
    exclude: &PointerId,
) -> bool {
    workflow.execution_pointers.iter().any(|p| {
        &p.id != exclude
            && p.scope == scope
            && p.end_time.is_none()
            && def
                .find_step(p.step_id)
                .is_some_and(|s| s.outcomes.iter().any(|o| o.next_step == target_step))
    })
}
