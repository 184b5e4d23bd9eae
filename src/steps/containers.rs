//! Control-flow container bodies.
//!
//! A container's children are the first steps of its branches; spawning a
//! pointer per (branch value × child) is how sequences, parallel blocks,
//! and loops fan out. Containers re-enter every iteration until their
//! branch completes.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{ExecutionResult, StepBody, StepContext};
use crate::steps::{children_active, control_data};

fn corrupt(context: &StepContext) -> Error {
    Error::CorruptPersistenceData(context.pointer_id.to_string())
}

// ---------------------------------------------------------------------------
// Sequence
// ---------------------------------------------------------------------------

/// Spawns one branch per child and completes once the branch ends. Used
/// for sequences, parallel blocks, and saga containers alike — the
/// difference is only how many children the step declares.
pub struct Sequence;

#[async_trait::async_trait]
impl StepBody for Sequence {
    async fn run(&self, context: &mut StepContext) -> Result<ExecutionResult> {
        match &context.persistence_data {
            None => Ok(ExecutionResult::branch(
                vec![context.item.clone().unwrap_or(Value::Null)],
                control_data(),
            )),
            Some(data) if children_active(data) => {
                if context.branch_complete {
                    Ok(ExecutionResult::next())
                } else {
                    Ok(ExecutionResult::persist(data.clone()))
                }
            }
            Some(_) => Err(corrupt(context)),
        }
    }
}

// ---------------------------------------------------------------------------
// Foreach
// ---------------------------------------------------------------------------

/// Spawns one branch per element of the `items` input array; each branch
/// sees its element as the context item.
pub struct Foreach;

#[async_trait::async_trait]
impl StepBody for Foreach {
    async fn run(&self, context: &mut StepContext) -> Result<ExecutionResult> {
        match &context.persistence_data {
            None => {
                let items = context
                    .inputs
                    .get("items")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                Ok(ExecutionResult::branch(items, control_data()))
            }
            Some(data) if children_active(data) => {
                if context.branch_complete {
                    Ok(ExecutionResult::next())
                } else {
                    Ok(ExecutionResult::persist(data.clone()))
                }
            }
            Some(_) => Err(corrupt(context)),
        }
    }
}

// ---------------------------------------------------------------------------
// If
// ---------------------------------------------------------------------------

/// Runs its branch once when the condition holds, otherwise proceeds
/// straight to the step's outcomes.
pub struct If {
    pub condition: Arc<dyn Fn(&Value) -> bool + Send + Sync>,
}

impl If {
    pub fn new<F>(condition: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self {
            condition: Arc::new(condition),
        }
    }
}

#[async_trait::async_trait]
impl StepBody for If {
    async fn run(&self, context: &mut StepContext) -> Result<ExecutionResult> {
        match &context.persistence_data {
            None => {
                if self.condition.as_ref()(&context.data) {
                    Ok(ExecutionResult::branch(
                        vec![context.item.clone().unwrap_or(Value::Null)],
                        control_data(),
                    ))
                } else {
                    Ok(ExecutionResult::next())
                }
            }
            Some(data) if children_active(data) => {
                if context.branch_complete {
                    Ok(ExecutionResult::next())
                } else {
                    Ok(ExecutionResult::persist(data.clone()))
                }
            }
            Some(_) => Err(corrupt(context)),
        }
    }
}

// ---------------------------------------------------------------------------
// While
// ---------------------------------------------------------------------------

/// Re-spawns its branch as long as the condition holds when the previous
/// branch completes.
pub struct While {
    pub condition: Arc<dyn Fn(&Value) -> bool + Send + Sync>,
}

impl While {
    pub fn new<F>(condition: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self {
            condition: Arc::new(condition),
        }
    }
}

#[async_trait::async_trait]
impl StepBody for While {
    async fn run(&self, context: &mut StepContext) -> Result<ExecutionResult> {
        match &context.persistence_data {
            None => {
                if self.condition.as_ref()(&context.data) {
                    Ok(ExecutionResult::branch(
                        vec![context.item.clone().unwrap_or(Value::Null)],
                        control_data(),
                    ))
                } else {
                    Ok(ExecutionResult::next())
                }
            }
            Some(data) if children_active(data) => {
                if !context.branch_complete {
                    return Ok(ExecutionResult::persist(data.clone()));
                }
                if self.condition.as_ref()(&context.data) {
                    Ok(ExecutionResult::branch(
                        vec![context.item.clone().unwrap_or(Value::Null)],
                        control_data(),
                    ))
                } else {
                    Ok(ExecutionResult::next())
                }
            }
            Some(_) => Err(corrupt(context)),
        }
    }
}

// ---------------------------------------------------------------------------
// Recur
// ---------------------------------------------------------------------------

/// Spawns its branch on an interval until the stop condition holds.
pub struct Recur {
    pub interval: chrono::Duration,
    pub stop: Arc<dyn Fn(&Value) -> bool + Send + Sync>,
}

impl Recur {
    pub fn new<F>(interval: chrono::Duration, stop: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self {
            interval,
            stop: Arc::new(stop),
        }
    }
}

#[async_trait::async_trait]
impl StepBody for Recur {
    async fn run(&self, context: &mut StepContext) -> Result<ExecutionResult> {
        if self.stop.as_ref()(&context.data) {
            return Ok(ExecutionResult::next());
        }

        Ok(ExecutionResult {
            proceed: false,
            branch_values: vec![context.item.clone().unwrap_or(Value::Null)],
            sleep_for: Some(self.interval),
            ..Default::default()
        })
    }
}

// ---------------------------------------------------------------------------
// OutcomeSwitch
// ---------------------------------------------------------------------------

/// Runs the case branches selected by its outcome matchers: the
/// predecessor's outcome value becomes this step's own, so case steps
/// hang off value-matched outcomes.
pub struct OutcomeSwitch;

#[async_trait::async_trait]
impl StepBody for OutcomeSwitch {
    async fn run(&self, context: &mut StepContext) -> Result<ExecutionResult> {
        let previous_outcome = context.predecessor_outcome.clone();
        match &context.persistence_data {
            None => {
                let mut result = ExecutionResult::branch(
                    vec![context.item.clone().unwrap_or(Value::Null)],
                    control_data(),
                );
                result.outcome_value = previous_outcome;
                Ok(result)
            }
            Some(data) if children_active(data) => {
                if context.branch_complete {
                    Ok(ExecutionResult::next())
                } else {
                    let mut result = ExecutionResult::persist(data.clone());
                    result.outcome_value = previous_outcome;
                    Ok(result)
                }
            }
            Some(_) => Err(corrupt(context)),
        }
    }
}

// ---------------------------------------------------------------------------
// Delay
// ---------------------------------------------------------------------------

/// Parks the pointer for a fixed period, then proceeds.
pub struct Delay {
    pub period: chrono::Duration,
}

impl Delay {
    pub fn new(period: chrono::Duration) -> Self {
        Self { period }
    }
}

#[async_trait::async_trait]
impl StepBody for Delay {
    async fn run(&self, context: &mut StepContext) -> Result<ExecutionResult> {
        if context.persistence_data.is_some() {
            return Ok(ExecutionResult::next());
        }
        Ok(ExecutionResult::sleep(self.period, Value::Bool(true)))
    }
}
