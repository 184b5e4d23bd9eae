//! Event subscriptions, published events, and execution error records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::definition::StepId;
use crate::model::instance::PointerId;

/// Event name used for activity-style subscriptions; the activity name is
/// carried in the event key.
pub const ACTIVITY_EVENT: &str = "activity";

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Created when a pointer enters `WaitingForEvent`; matched against
/// incoming events by (name, key) and the subscribe-as-of instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSubscription {
    pub id: String,
    pub workflow_id: String,
    pub step_id: StepId,
    pub execution_pointer_id: PointerId,
    pub event_name: String,
    pub event_key: String,
    /// Only events effective at or after this instant match.
    pub subscribe_as_of: DateTime<Utc>,
    /// Payload exposed to activity workers as parameters.
    pub subscription_data: Option<Value>,
    /// Claim token held by an external worker, if pulled as an activity.
    pub external_token: Option<String>,
    pub external_worker_id: Option<String>,
    pub external_token_expiry: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A published external event, persisted until delivered to every
/// matching subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub event_name: String,
    pub event_key: String,
    pub event_data: Option<Value>,
    pub event_time: DateTime<Utc>,
    pub is_processed: bool,
}

// ---------------------------------------------------------------------------
// Execution errors
// ---------------------------------------------------------------------------

/// Append-only record of a failed pointer execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    pub workflow_id: String,
    pub execution_pointer_id: PointerId,
    pub error_time: DateTime<Utc>,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Activities
// ---------------------------------------------------------------------------

/// A claimed activity handed to an external worker: the claim token plus
/// the parameters stored on the subscription.
#[derive(Debug, Clone)]
pub struct PendingActivity {
    pub token: String,
    pub activity_name: String,
    pub parameters: Option<Value>,
    pub token_expiry: DateTime<Utc>,
}

/// Result an activity worker submits; published back as the event payload
/// keyed to the original subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityResult {
    pub subscription_id: String,
    pub status: ActivityStatus,
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Success,
    Fail,
}
