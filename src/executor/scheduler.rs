//! Computes a workflow's next wake time, or finalizes completion.
//!
//! This is the only place an instance transitions to Complete.

use std::sync::Arc;

use chrono::Utc;

use crate::event::{LifecycleEvent, LifecycleEventKind, LifecycleEventPublisher};
use crate::executor::middleware::WorkflowMiddlewareRunner;
use crate::model::{WorkflowDefinition, WorkflowInstance, WorkflowStatus};

pub struct ExecutionScheduler {
    publisher: Arc<LifecycleEventPublisher>,
    middleware_runner: Arc<WorkflowMiddlewareRunner>,
}

impl ExecutionScheduler {
    pub fn new(
        publisher: Arc<LifecycleEventPublisher>,
        middleware_runner: Arc<WorkflowMiddlewareRunner>,
    ) -> Self {
        Self {
            publisher,
            middleware_runner,
        }
    }

    /// Set `next_execution` to the earliest due time among active
    /// pointers, 0 when anything wants to run immediately, or `None` when
    /// nothing is schedulable. With no next time and no open pointers the
    /// workflow completes: post middleware runs and the completion
    /// notification is published.
    pub async fn determine_next_execution(
        &self,
        workflow: &mut WorkflowInstance,
        def: &WorkflowDefinition,
    ) {
        workflow.next_execution = None;

        if workflow.status == WorkflowStatus::Complete {
            return;
        }

        // Leaf pointers: no children of their own.
        for pointer in workflow
            .execution_pointers
            .iter()
            .filter(|p| p.active && p.children.is_empty())
        {
            match pointer.sleep_until {
                None => {
                    workflow.next_execution = Some(0);
                    return;
                }
                Some(sleep_until) => {
                    let due = sleep_until.timestamp_millis();
                    workflow.next_execution =
                        Some(workflow.next_execution.map_or(due, |cur| cur.min(due)));
                }
            }
        }

        // Branching pointers only count once their whole branch has ended.
        let branching: Vec<_> = workflow
            .execution_pointers
            .iter()
            .filter(|p| p.active && !p.children.is_empty())
            .map(|p| (p.id.clone(), p.sleep_until))
            .collect();
        for (pointer_id, sleep_until) in branching {
            if !workflow.is_branch_complete(&pointer_id) {
                continue;
            }
            match sleep_until {
                None => {
                    workflow.next_execution = Some(0);
                    return;
                }
                Some(sleep_until) => {
                    let due = sleep_until.timestamp_millis();
                    workflow.next_execution =
                        Some(workflow.next_execution.map_or(due, |cur| cur.min(due)));
                }
            }
        }

        if workflow.next_execution.is_some()
            || workflow
                .execution_pointers
                .iter()
                .any(|p| p.end_time.is_none())
        {
            return;
        }

        workflow.status = WorkflowStatus::Complete;
        workflow.complete_time = Some(Utc::now());

        self.middleware_runner
            .run_post_middleware(workflow, def)
            .await;

        self.publisher.publish(LifecycleEvent::for_workflow(
            workflow,
            LifecycleEventKind::WorkflowCompleted,
        ));
    }
}
