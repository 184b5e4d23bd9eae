//! Subscription step bodies: waiting on external events and activities.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{ActivityResult, ActivityStatus, ExecutionResult, StepBody, StepContext};

fn effective_date(inputs: &Value) -> DateTime<Utc> {
    inputs
        .get("effective_date")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

// ---------------------------------------------------------------------------
// WaitFor
// ---------------------------------------------------------------------------

/// Parks the pointer until an event matching the `event_name` /
/// `event_key` inputs is published. On resumption the event payload is
/// exposed as the `event_data` output and the step's outcome value.
pub struct WaitFor;

#[async_trait::async_trait]
impl StepBody for WaitFor {
    async fn run(&self, context: &mut StepContext) -> Result<ExecutionResult> {
        if !context.event_published {
            let name = context
                .inputs
                .get("event_name")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Other("wait_for requires an event_name input".to_string()))?
                .to_string();
            let key = context
                .inputs
                .get("event_key")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Ok(ExecutionResult::wait_for_event(
                name,
                key,
                effective_date(&context.inputs),
            ));
        }

        let data = context.event_data.clone().unwrap_or(Value::Null);
        if let Some(outputs) = context.outputs.as_object_mut() {
            outputs.insert("event_data".to_string(), data.clone());
        }
        Ok(ExecutionResult::outcome(data))
    }
}

// ---------------------------------------------------------------------------
// Activity
// ---------------------------------------------------------------------------

/// Parks the pointer as a pullable activity: an external worker claims
/// the subscription, does the work, and submits a result. A failure
/// result enters the step error policy chain.
pub struct Activity;

#[async_trait::async_trait]
impl StepBody for Activity {
    async fn run(&self, context: &mut StepContext) -> Result<ExecutionResult> {
        let name = context
            .inputs
            .get("activity_name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Other("activity requires an activity_name input".to_string()))?
            .to_string();

        if !context.event_published {
            let parameters = context.inputs.get("parameters").cloned();
            return Ok(ExecutionResult::wait_for_activity(
                name,
                parameters,
                effective_date(&context.inputs),
            ));
        }

        let result: ActivityResult =
            serde_json::from_value(context.event_data.clone().unwrap_or(Value::Null))?;

        match result.status {
            ActivityStatus::Fail => Err(Error::ActivityFailed(name)),
            ActivityStatus::Success => {
                let data = result.data.unwrap_or(Value::Null);
                if let Some(outputs) = context.outputs.as_object_mut() {
                    outputs.insert("result".to_string(), data.clone());
                }
                Ok(ExecutionResult::outcome(data))
            }
        }
    }
}
