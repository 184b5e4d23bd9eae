//! Runs a workflow to completion in the calling task.
//!
//! Useful for short request-scoped workflows and tests. The instance lock
//! is held for the whole run, so nothing else can execute the instance
//! concurrently.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::warn;

use crate::controller::new_instance_id;
use crate::error::{Error, Result};
use crate::executor::{ExecutionPointerFactory, WorkflowExecutor};
use crate::model::{WorkflowInstance, WorkflowStatus};
use crate::providers::{DistributedLockProvider, PersistenceProvider};
use crate::registry::WorkflowRegistry;

pub struct SyncWorkflowRunner {
    executor: Arc<WorkflowExecutor>,
    locks: Arc<dyn DistributedLockProvider>,
    registry: Arc<WorkflowRegistry>,
    persistence: Arc<dyn PersistenceProvider>,
    pointer_factory: ExecutionPointerFactory,
}

impl SyncWorkflowRunner {
    pub fn new(
        executor: Arc<WorkflowExecutor>,
        locks: Arc<dyn DistributedLockProvider>,
        registry: Arc<WorkflowRegistry>,
        persistence: Arc<dyn PersistenceProvider>,
    ) -> Self {
        Self {
            executor,
            locks,
            registry,
            persistence,
            pointer_factory: ExecutionPointerFactory::new(),
        }
    }

    /// Create an instance and iterate it until it leaves Runnable or the
    /// timeout elapses; the instance is returned in whatever state it
    /// reached. With `persist_state` false nothing touches the store.
    pub async fn run_workflow_sync(
        &self,
        workflow_id: &str,
        version: Option<i32>,
        data: Option<Value>,
        reference: Option<String>,
        timeout: Duration,
        persist_state: bool,
    ) -> Result<WorkflowInstance> {
        let def = self
            .registry
            .get(workflow_id, version)
            .ok_or_else(|| Error::NotRegistered {
                id: workflow_id.to_string(),
                version,
            })?;

        let mut workflow = WorkflowInstance {
            id: String::new(),
            workflow_definition_id: workflow_id.to_string(),
            version: def.version,
            description: def.description.clone(),
            reference,
            execution_pointers: Vec::new(),
            next_execution: Some(0),
            status: WorkflowStatus::Suspended,
            data: data
                .or_else(|| def.default_data.clone())
                .unwrap_or(Value::Null),
            create_time: Utc::now(),
            complete_time: None,
        };
        workflow
            .execution_pointers
            .push(self.pointer_factory.build_genesis_pointer(&def));

        if persist_state {
            workflow.id = self.persistence.create_workflow(workflow.clone()).await?;
        } else {
            workflow.id = new_instance_id();
        }
        workflow.status = WorkflowStatus::Runnable;

        if !self.locks.acquire_lock(&workflow.id).await? {
            return Err(Error::Other(format!(
                "workflow {} is locked by another worker",
                workflow.id
            )));
        }

        let run = tokio::time::timeout(timeout, async {
            while workflow.status == WorkflowStatus::Runnable {
                let iteration = self.executor.execute(&mut workflow).await;

                if persist_state {
                    self.persistence.persist_workflow(&workflow).await?;
                    for subscription in iteration.subscriptions {
                        self.persistence.create_subscription(subscription).await?;
                    }
                    if !iteration.errors.is_empty() {
                        self.persistence.persist_errors(&iteration.errors).await?;
                    }
                }

                // Wait out sleeping pointers instead of spinning hot, and
                // yield even when work is immediately due so the timeout
                // timer gets a chance to fire.
                if workflow.status == WorkflowStatus::Runnable {
                    match workflow.next_execution {
                        Some(due) => {
                            let now = Utc::now().timestamp_millis();
                            if due > now {
                                tokio::time::sleep(Duration::from_millis((due - now) as u64)).await;
                            } else {
                                tokio::task::yield_now().await;
                            }
                        }
                        // Waiting on an external event; nothing to do here
                        // but let the timeout decide.
                        None => tokio::time::sleep(Duration::from_millis(10)).await,
                    }
                }
            }
            Ok::<_, Error>(())
        })
        .await;

        self.locks.release_lock(&workflow.id).await?;

        match run {
            Ok(inner) => inner?,
            Err(_) => {
                warn!(workflow_id = %workflow.id, "sync run timed out before completion");
            }
        }

        Ok(workflow)
    }
}
