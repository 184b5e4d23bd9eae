//! Compensation and error policy tests: sagas, revert ordering, and the
//! suspend/terminate policies.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::json;

use braid::error::Error;
use braid::executor::{ExecutionPointerFactory, WorkflowExecutor};
use braid::model::{
    BodySource, ErrorBehavior, ExecutionResult, PointerStatus, StepOutcome, WorkflowDefinition,
    WorkflowInstance, WorkflowStatus, WorkflowStep,
};
use braid::registry::WorkflowRegistry;
use braid::steps::{inline, Sequence};

fn executor(registry: &Arc<WorkflowRegistry>) -> WorkflowExecutor {
    WorkflowExecutor::builder(Arc::clone(registry)).build()
}

fn instance(registry: &WorkflowRegistry, definition_id: &str) -> WorkflowInstance {
    let def = registry
        .get(definition_id, None)
        .expect("definition registered");
    let genesis = ExecutionPointerFactory::new().build_genesis_pointer(&def);
    WorkflowInstance {
        id: "wf-test".to_string(),
        workflow_definition_id: definition_id.to_string(),
        version: def.version,
        description: None,
        reference: None,
        execution_pointers: vec![genesis],
        next_execution: Some(0),
        status: WorkflowStatus::Runnable,
        data: json!({}),
        create_time: Utc::now(),
        complete_time: None,
    }
}

fn sequence_body() -> BodySource {
    BodySource::factory(|| Box::new(Sequence))
}

fn recording(log: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> BodySource {
    let log = Arc::clone(log);
    inline(move |_| {
        log.lock().unwrap().push(label);
        Ok(ExecutionResult::next())
    })
}

async fn run_until_settled(executor: &WorkflowExecutor, wf: &mut WorkflowInstance) {
    for _ in 0..10 {
        if wf.status != WorkflowStatus::Runnable {
            break;
        }
        executor.execute(wf).await;
    }
}

// ---------------------------------------------------------------------------
// Compensation scheduling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failure_under_compensable_scope_schedules_compensation() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = Arc::new(WorkflowRegistry::new());
    registry
        .register(
            WorkflowDefinition::new("saga", 1)
                .with_step(sequence_step_with_children(0, vec![1]))
                .with_step(
                    WorkflowStep::new(1, inline(|_| Err(Error::StepFailed("boom".to_string()))))
                        .with_compensation(2),
                )
                .with_step(WorkflowStep::new(2, recording(&log, "undo-1"))),
        )
        .unwrap();

    let executor = executor(&registry);
    let mut wf = instance(&registry, "saga");
    run_until_settled(&executor, &mut wf).await;

    // The failed pointer was compensated, not terminated.
    assert_ne!(wf.status, WorkflowStatus::Terminated);
    let failed = wf.execution_pointers.iter().find(|p| p.step_id == 1).unwrap();
    assert_eq!(failed.status, PointerStatus::Compensated);

    let compensation = wf
        .execution_pointers
        .iter()
        .find(|p| p.step_id == 2)
        .expect("compensation pointer scheduled");
    assert_eq!(compensation.status, PointerStatus::Complete);
    assert_eq!(log.lock().unwrap().as_slice(), ["undo-1"]);
}

#[tokio::test]
async fn saga_revert_compensates_completed_siblings_in_reverse_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = Arc::new(WorkflowRegistry::new());
    registry
        .register(
            WorkflowDefinition::new("saga-revert", 1)
                .with_step(sequence_step_with_children(0, vec![1]).as_saga())
                .with_step(
                    WorkflowStep::new(1, recording(&log, "book-hotel"))
                        .with_compensation(4)
                        .with_outcome(StepOutcome::next(2)),
                )
                .with_step(
                    WorkflowStep::new(2, recording(&log, "book-flight"))
                        .with_compensation(5)
                        .with_outcome(StepOutcome::next(3)),
                )
                .with_step(WorkflowStep::new(
                    3,
                    inline(|_| Err(Error::StepFailed("card declined".to_string()))),
                ))
                .with_step(WorkflowStep::new(4, recording(&log, "cancel-hotel")))
                .with_step(WorkflowStep::new(5, recording(&log, "cancel-flight"))),
        )
        .unwrap();

    let executor = executor(&registry);
    let mut wf = instance(&registry, "saga-revert");
    run_until_settled(&executor, &mut wf).await;

    // Most recently completed work is undone first.
    assert_eq!(
        log.lock().unwrap().as_slice(),
        ["book-hotel", "book-flight", "cancel-flight", "cancel-hotel"]
    );

    for step_id in [1, 2] {
        let pointer = wf
            .execution_pointers
            .iter()
            .find(|p| p.step_id == step_id)
            .unwrap();
        assert_eq!(pointer.status, PointerStatus::Compensated);
    }
}

// ---------------------------------------------------------------------------
// Policy resolution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn step_retry_policy_wins_over_scope_compensation() {
    let registry = Arc::new(WorkflowRegistry::new());
    registry
        .register(
            WorkflowDefinition::new("retry-in-saga", 1)
                .with_step(sequence_step_with_children(0, vec![1]))
                .with_step(
                    WorkflowStep::new(1, inline(|_| Err(Error::StepFailed("flaky".to_string()))))
                        .with_compensation(2)
                        .with_error_behavior(ErrorBehavior::Retry)
                        .with_retry_interval(chrono::Duration::minutes(5)),
                )
                .with_step(WorkflowStep::new(2, inline(|_| Ok(ExecutionResult::next())))),
        )
        .unwrap();

    let executor = executor(&registry);
    let mut wf = instance(&registry, "retry-in-saga");
    executor.execute(&mut wf).await; // spawn child
    executor.execute(&mut wf).await; // child fails, retry policy applies

    let failed = wf.execution_pointers.iter().find(|p| p.step_id == 1).unwrap();
    assert_eq!(failed.retry_count, 1);
    assert!(failed.sleep_until.is_some());
    assert!(
        !wf.execution_pointers.iter().any(|p| p.step_id == 2),
        "no compensation pointer for a retrying step"
    );
}

#[tokio::test]
async fn terminate_policy_ends_the_instance() {
    let registry = Arc::new(WorkflowRegistry::new());
    registry
        .register(
            WorkflowDefinition::new("fatal", 1)
                .with_default_error_behavior(ErrorBehavior::Terminate)
                .with_step(WorkflowStep::new(
                    0,
                    inline(|_| Err(Error::StepFailed("unrecoverable".to_string()))),
                )),
        )
        .unwrap();

    let executor = executor(&registry);
    let mut wf = instance(&registry, "fatal");
    let result = executor.execute(&mut wf).await;

    assert_eq!(wf.status, WorkflowStatus::Terminated);
    assert_eq!(result.errors.len(), 1);
}

#[tokio::test]
async fn suspend_policy_parks_the_instance() {
    let registry = Arc::new(WorkflowRegistry::new());
    registry
        .register(
            WorkflowDefinition::new("parked", 1)
                .with_default_error_behavior(ErrorBehavior::Suspend)
                .with_step(WorkflowStep::new(
                    0,
                    inline(|_| Err(Error::StepFailed("needs operator".to_string()))),
                )),
        )
        .unwrap();

    let executor = executor(&registry);
    let mut wf = instance(&registry, "parked");
    executor.execute(&mut wf).await;

    assert_eq!(wf.status, WorkflowStatus::Suspended);
    assert_eq!(wf.execution_pointers[0].status, PointerStatus::Failed);
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn sequence_step_with_children(id: i32, children: Vec<i32>) -> WorkflowStep {
    WorkflowStep::new(id, sequence_body()).with_children(children)
}
