//! Activity controller: external workers pull activity subscriptions,
//! hold a claim token, and submit results.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::controller::WorkflowController;
use crate::error::{Error, Result};
use crate::model::{
    ActivityResult, ActivityStatus, PendingActivity, ACTIVITY_EVENT,
};
use crate::providers::{DistributedLockProvider, PersistenceProvider};

pub struct ActivityController {
    persistence: Arc<dyn PersistenceProvider>,
    locks: Arc<dyn DistributedLockProvider>,
    controller: Arc<WorkflowController>,
    poll_interval: Duration,
}

impl ActivityController {
    pub fn new(
        persistence: Arc<dyn PersistenceProvider>,
        locks: Arc<dyn DistributedLockProvider>,
        controller: Arc<WorkflowController>,
    ) -> Self {
        Self {
            persistence,
            locks,
            controller,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Long-poll for an unclaimed activity subscription. With a zero (or
    /// absent) timeout, a single pass runs and `None` is returned
    /// immediately when nothing is open. A claimed activity carries an
    /// opaque token the worker must present when submitting the result.
    pub async fn get_pending_activity(
        &self,
        activity_name: &str,
        worker_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<PendingActivity>> {
        let deadline = Utc::now()
            + chrono::Duration::from_std(timeout.unwrap_or_default())
                .unwrap_or_else(|_| chrono::Duration::zero());

        let mut first_pass = true;
        let mut claimed = None;
        while claimed.is_none() && (first_pass || Utc::now() < deadline) {
            if !first_pass {
                tokio::time::sleep(self.poll_interval).await;
            }
            first_pass = false;

            let Some(subscription) = self
                .persistence
                .get_first_open_subscription(ACTIVITY_EVENT, activity_name, Utc::now())
                .await?
            else {
                continue;
            };

            // Lock out competing pollers while stamping the token.
            let lock_key = format!("sub:{}", subscription.id);
            if !self.locks.acquire_lock(&lock_key).await? {
                continue;
            }

            let token = ActivityToken::create(&subscription.id, &subscription.event_key).encode()?;
            let expiry = DateTime::<Utc>::MAX_UTC;
            let granted = self
                .persistence
                .set_subscription_token(&subscription.id, &token, worker_id, expiry)
                .await;
            self.locks.release_lock(&lock_key).await?;

            if granted? {
                claimed = Some(PendingActivity {
                    token,
                    activity_name: subscription.event_key.clone(),
                    parameters: subscription.subscription_data.clone(),
                    token_expiry: expiry,
                });
            }
        }

        Ok(claimed)
    }

    /// Give a claimed activity back without a result; another worker may
    /// then pull it.
    pub async fn release_activity_token(&self, token: &str) -> Result<()> {
        let decoded = ActivityToken::decode(token)?;
        self.persistence
            .clear_subscription_token(&decoded.subscription_id, token)
            .await
    }

    pub async fn submit_activity_success(&self, token: &str, data: Option<Value>) -> Result<()> {
        self.submit_activity_result(token, ActivityStatus::Success, data)
            .await
    }

    pub async fn submit_activity_failure(&self, token: &str, data: Option<Value>) -> Result<()> {
        self.submit_activity_result(token, ActivityStatus::Fail, data)
            .await
    }

    async fn submit_activity_result(
        &self,
        token: &str,
        status: ActivityStatus,
        data: Option<Value>,
    ) -> Result<()> {
        let decoded = ActivityToken::decode(token)?;
        let subscription = self
            .persistence
            .get_subscription(&decoded.subscription_id)
            .await?;

        if subscription.external_token.as_deref() != Some(token) {
            return Err(Error::TokenMismatch);
        }

        let payload = serde_json::to_value(ActivityResult {
            subscription_id: subscription.id.clone(),
            status,
            data,
        })?;

        self.controller
            .publish_event(
                &subscription.event_name,
                &subscription.event_key,
                Some(payload),
                None,
            )
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Claim token
// ---------------------------------------------------------------------------

/// Opaque claim token: base64 over JSON of (subscription id, activity
/// name, nonce).
#[derive(Debug, Serialize, Deserialize)]
struct ActivityToken {
    subscription_id: String,
    activity_name: String,
    nonce: String,
}

impl ActivityToken {
    fn create(subscription_id: &str, activity_name: &str) -> Self {
        Self {
            subscription_id: subscription_id.to_string(),
            activity_name: activity_name.to_string(),
            nonce: Uuid::new_v4().to_string(),
        }
    }

    fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }

    fn decode(token: &str) -> Result<Self> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(token)
            .map_err(|e| Error::BadToken(e.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| Error::BadToken(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips() {
        let token = ActivityToken::create("sub-1", "review");
        let encoded = token.encode().unwrap();
        let decoded = ActivityToken::decode(&encoded).unwrap();
        assert_eq!(decoded.subscription_id, "sub-1");
        assert_eq!(decoded.activity_name, "review");
        assert_eq!(decoded.nonce, token.nonce);
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert!(matches!(
            ActivityToken::decode("not base64 at all!!"),
            Err(Error::BadToken(_))
        ));
        // Valid base64, invalid payload.
        let junk = base64::engine::general_purpose::STANDARD.encode(b"{]");
        assert!(matches!(
            ActivityToken::decode(&junk),
            Err(Error::BadToken(_))
        ));
    }
}
