//! Workflow-level middleware phases.
//!
//! Pre middleware runs before a new instance is persisted and can block
//! creation by erroring. Post middleware runs once on completion; execute
//! middleware runs after every iteration. Post/execute errors never fail
//! the workflow — they are routed to the definition's configured error
//! handler, falling back to the runner's default.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use crate::error::{Error, Result};
use crate::model::{MiddlewareErrorHandler, WorkflowDefinition, WorkflowInstance};

/// When a piece of workflow middleware runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewarePhase {
    /// Before a new instance is persisted.
    PreWorkflow,
    /// Once, when the instance completes.
    PostWorkflow,
    /// After every execution iteration.
    ExecuteWorkflow,
}

#[async_trait]
pub trait WorkflowMiddleware: Send + Sync {
    fn phase(&self) -> MiddlewarePhase;

    async fn handle(&self, workflow: &mut WorkflowInstance, def: &WorkflowDefinition)
        -> Result<()>;
}

/// Logs middleware errors; the fallback when a definition configures no
/// handler of its own.
pub struct LogMiddlewareErrorHandler;

#[async_trait]
impl MiddlewareErrorHandler for LogMiddlewareErrorHandler {
    async fn handle(&self, workflow_id: &str, error: &Error) {
        error!(workflow_id, "workflow middleware failed: {error}");
    }
}

/// Runs registered workflow middleware for each phase, in registration
/// order, stopping at the first error.
pub struct WorkflowMiddlewareRunner {
    middleware: Vec<Arc<dyn WorkflowMiddleware>>,
    default_error_handler: Arc<dyn MiddlewareErrorHandler>,
}

impl Default for WorkflowMiddlewareRunner {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl WorkflowMiddlewareRunner {
    pub fn new(middleware: Vec<Arc<dyn WorkflowMiddleware>>) -> Self {
        Self {
            middleware,
            default_error_handler: Arc::new(LogMiddlewareErrorHandler),
        }
    }

    pub fn with_default_error_handler(mut self, handler: Arc<dyn MiddlewareErrorHandler>) -> Self {
        self.default_error_handler = handler;
        self
    }

    /// Pre-workflow middleware. Errors propagate and block creation.
    pub async fn run_pre_middleware(
        &self,
        workflow: &mut WorkflowInstance,
        def: &WorkflowDefinition,
    ) -> Result<()> {
        for middleware in self.phase_middleware(MiddlewarePhase::PreWorkflow) {
            middleware.handle(workflow, def).await?;
        }
        Ok(())
    }

    /// Post-completion middleware. Errors go to the definition's handler.
    pub async fn run_post_middleware(
        &self,
        workflow: &mut WorkflowInstance,
        def: &WorkflowDefinition,
    ) {
        let handler = def
            .on_post_middleware_error
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.default_error_handler));
        self.run_phase(MiddlewarePhase::PostWorkflow, workflow, def, handler)
            .await;
    }

    /// Per-iteration middleware. Errors go to the definition's handler.
    pub async fn run_execute_middleware(
        &self,
        workflow: &mut WorkflowInstance,
        def: &WorkflowDefinition,
    ) {
        let handler = def
            .on_execute_middleware_error
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.default_error_handler));
        self.run_phase(MiddlewarePhase::ExecuteWorkflow, workflow, def, handler)
            .await;
    }

    async fn run_phase(
        &self,
        phase: MiddlewarePhase,
        workflow: &mut WorkflowInstance,
        def: &WorkflowDefinition,
        error_handler: Arc<dyn MiddlewareErrorHandler>,
    ) {
        for middleware in self.phase_middleware(phase) {
            if let Err(e) = middleware.handle(workflow, def).await {
                error_handler.handle(&workflow.id, &e).await;
                return;
            }
        }
    }

    fn phase_middleware(
        &self,
        phase: MiddlewarePhase,
    ) -> impl Iterator<Item = &Arc<dyn WorkflowMiddleware>> {
        self.middleware.iter().filter(move |m| m.phase() == phase)
    }
}
