//! Runs a step body through the step middleware chain.
//!
//! Middleware wrap in registration order: the first registered starts
//! first and completes last. Each middleware may short-circuit, wrap
//! errors, or pass through to the `next` continuation.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::Result;
use crate::model::{ExecutionResult, StepBody, StepContext};

/// Middleware around step execution.
#[async_trait]
pub trait StepMiddleware: Send + Sync {
    async fn handle(
        &self,
        context: &mut StepContext,
        body: &dyn StepBody,
        next: Next<'_>,
    ) -> Result<ExecutionResult>;
}

/// Continuation into the rest of the middleware chain (and finally the
/// body itself). Not calling it short-circuits the step.
pub struct Next<'a> {
    executor: &'a StepExecutor,
    index: usize,
}

impl Next<'_> {
    pub async fn run(
        self,
        context: &mut StepContext,
        body: &dyn StepBody,
    ) -> Result<ExecutionResult> {
        self.executor.invoke(self.index, context, body).await
    }
}

/// Executes step bodies, applying registered middleware.
#[derive(Default)]
pub struct StepExecutor {
    middleware: Vec<Arc<dyn StepMiddleware>>,
}

impl StepExecutor {
    pub fn new(middleware: Vec<Arc<dyn StepMiddleware>>) -> Self {
        Self { middleware }
    }

    /// Run `body` in `context` through the middleware chain.
    pub async fn execute_step(
        &self,
        context: &mut StepContext,
        body: &dyn StepBody,
    ) -> Result<ExecutionResult> {
        self.invoke(0, context, body).await
    }

    fn invoke<'a>(
        &'a self,
        index: usize,
        context: &'a mut StepContext,
        body: &'a dyn StepBody,
    ) -> BoxFuture<'a, Result<ExecutionResult>> {
        Box::pin(async move {
            match self.middleware.get(index) {
                Some(middleware) => {
                    let next = Next {
                        executor: self,
                        index: index + 1,
                    };
                    middleware.handle(context, body, next).await
                }
                None => body.run(context).await,
            }
        })
    }
}
