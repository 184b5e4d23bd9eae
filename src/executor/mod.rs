//! The workflow executor: one call runs one iteration over every
//! runnable pointer of an instance.
//!
//! Callers own concurrency control — an instance must be executed under
//! its distributed lock. The executor itself never spawns workers; it
//! iterates the snapshot taken at entry and folds newly created pointers
//! into the next iteration.

pub mod cancellation;
pub mod error_handlers;
pub mod middleware;
pub mod pointer_factory;
pub mod result_processor;
pub mod scheduler;
pub mod step_executor;

pub use cancellation::CancellationProcessor;
pub use error_handlers::{
    default_error_handlers, CompensateHandler, RetryHandler, SuspendHandler, TerminateHandler,
    WorkflowErrorHandler,
};
pub use middleware::{MiddlewarePhase, WorkflowMiddleware, WorkflowMiddlewareRunner};
pub use pointer_factory::ExecutionPointerFactory;
pub use result_processor::ExecutionResultProcessor;
pub use scheduler::ExecutionScheduler;
pub use step_executor::{Next, StepExecutor, StepMiddleware};

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error};

use crate::config::EngineOptions;
use crate::error::{Error, Result};
use crate::event::{LifecycleEvent, LifecycleEventKind, LifecycleEventPublisher};
use crate::model::{
    BodySource, ExecutionError, ExecutionPointer, PipelineDirective, PointerId, PointerStatus,
    StepBody, StepContext, WorkflowDefinition, WorkflowExecutorResult, WorkflowInstance,
    WorkflowStatus, WorkflowStep,
};
use crate::providers::{LifecycleEventHub, StepErrorSink};
use crate::registry::{ServiceRegistry, WorkflowRegistry};

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct WorkflowExecutor {
    registry: Arc<WorkflowRegistry>,
    services: Arc<ServiceRegistry>,
    options: EngineOptions,
    publisher: Arc<LifecycleEventPublisher>,
    step_executor: Arc<StepExecutor>,
    result_processor: Arc<ExecutionResultProcessor>,
    cancellation: Arc<CancellationProcessor>,
    scheduler: Arc<ExecutionScheduler>,
    middleware_runner: Arc<WorkflowMiddlewareRunner>,
    error_sink: Option<Arc<dyn StepErrorSink>>,
}

impl WorkflowExecutor {
    pub fn builder(registry: Arc<WorkflowRegistry>) -> WorkflowExecutorBuilder {
        WorkflowExecutorBuilder::new(registry)
    }

    /// The buffered lifecycle publisher, for hosts that emit their own
    /// notifications.
    pub fn publisher(&self) -> Arc<LifecycleEventPublisher> {
        Arc::clone(&self.publisher)
    }

    /// The shared middleware runner, for controllers running the pre
    /// phase.
    pub fn middleware_runner(&self) -> Arc<WorkflowMiddlewareRunner> {
        Arc::clone(&self.middleware_runner)
    }

    /// Run one execution iteration over `workflow`.
    ///
    /// Per-pointer failures are recorded and routed through the error
    /// policy chain; they never abort the iteration for other pointers.
    pub async fn execute(&self, workflow: &mut WorkflowInstance) -> WorkflowExecutorResult {
        let mut result = WorkflowExecutorResult::default();

        let Some(def) = self
            .registry
            .get(&workflow.workflow_definition_id, Some(workflow.version))
        else {
            error!(
                definition = %workflow.workflow_definition_id,
                version = workflow.version,
                "workflow definition is not registered"
            );
            return result;
        };

        let now = Utc::now();
        let snapshot: Vec<PointerId> = workflow
            .execution_pointers
            .iter()
            .filter(|p| p.active && p.sleep_until.is_none_or(|until| until < now))
            .map(|p| p.id.clone())
            .collect();

        self.cancellation
            .process_cancellations(workflow, &def, &mut result);

        for pointer_id in snapshot {
            let Some(pointer) = workflow.find_pointer(&pointer_id) else {
                continue;
            };
            if !pointer.active {
                continue;
            }
            let step_id = pointer.step_id;

            let Some(step) = def.find_step(step_id) else {
                error!(step_id, "cannot find step in workflow definition");
                let now = Utc::now();
                if let Some(pointer) = workflow.find_pointer_mut(&pointer_id) {
                    pointer.sleep_until = Some(now + self.options.error_retry_interval);
                }
                result.errors.push(ExecutionError {
                    workflow_id: workflow.id.clone(),
                    execution_pointer_id: pointer_id.clone(),
                    error_time: now,
                    message: format!("cannot find step {step_id} in workflow definition"),
                });
                continue;
            };

            if let Err(e) = self
                .run_pointer(workflow, &def, step, &pointer_id, &mut result)
                .await
            {
                error!(workflow_id = %workflow.id, step_id, "step raised an error: {e}");
                result.errors.push(ExecutionError {
                    workflow_id: workflow.id.clone(),
                    execution_pointer_id: pointer_id.clone(),
                    error_time: Utc::now(),
                    message: e.to_string(),
                });
                self.result_processor
                    .handle_step_exception(workflow, &def, &pointer_id, step, &e);
                if let Some(sink) = &self.error_sink {
                    sink.report_step_error(workflow, step, &e);
                }
            }

            self.cancellation
                .process_cancellations(workflow, &def, &mut result);
        }

        self.run_after_iteration_hooks(workflow, &def);

        self.scheduler.determine_next_execution(workflow, &def).await;

        self.middleware_runner
            .run_execute_middleware(workflow, &def)
            .await;

        result
    }

    async fn run_pointer(
        &self,
        workflow: &mut WorkflowInstance,
        def: &WorkflowDefinition,
        step: &WorkflowStep,
        pointer_id: &PointerId,
        executor_result: &mut WorkflowExecutorResult,
    ) -> Result<()> {
        let now = Utc::now();

        let directive = {
            let pointer = self.pointer_mut(workflow, pointer_id)?;
            step.hooks.init_for_execution(pointer)
        };
        match directive {
            PipelineDirective::Defer => return Ok(()),
            PipelineDirective::EndWorkflow => {
                workflow.status = WorkflowStatus::Complete;
                workflow.complete_time = Some(now);
                return Ok(());
            }
            PipelineDirective::Next => {}
        }

        let newly_running = {
            let pointer = self.pointer_mut(workflow, pointer_id)?;
            let newly = pointer.status != PointerStatus::Running;
            pointer.status = PointerStatus::Running;
            if pointer.start_time.is_none() {
                pointer.start_time = Some(now);
            }
            newly
        };
        if newly_running {
            self.publisher.publish(LifecycleEvent::for_workflow(
                workflow,
                LifecycleEventKind::StepStarted {
                    pointer_id: pointer_id.clone(),
                    step_id: step.id,
                },
            ));
        }

        debug!(step = %step.display_name(), workflow_id = %workflow.id, "starting step");

        let body: Box<dyn StepBody> = match &step.body {
            BodySource::Factory(factory) => factory.as_ref()(),
            BodySource::Service(name) => match self.services.resolve(name) {
                Some(body) => body,
                None => {
                    // Not terminal: a redeploy may register the body, so
                    // park the pointer and record the failure.
                    error!(body = %name, "cannot construct step body");
                    if let Some(pointer) = workflow.find_pointer_mut(pointer_id) {
                        pointer.sleep_until = Some(now + self.options.error_retry_interval);
                    }
                    executor_result.errors.push(ExecutionError {
                        workflow_id: workflow.id.clone(),
                        execution_pointer_id: pointer_id.clone(),
                        error_time: now,
                        message: Error::UnresolvableBody(name.clone()).to_string(),
                    });
                    return Ok(());
                }
            },
        };

        let snapshot = workflow
            .find_pointer(pointer_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("pointer {pointer_id}")))?;
        let mut context = build_step_context(workflow, step, &snapshot);

        let directive = {
            let pointer = self.pointer_mut(workflow, pointer_id)?;
            step.hooks.before_execute(&context, pointer)
        };
        match directive {
            PipelineDirective::Defer => return Ok(()),
            PipelineDirective::EndWorkflow => {
                workflow.status = WorkflowStatus::Complete;
                workflow.complete_time = Some(now);
                return Ok(());
            }
            PipelineDirective::Next => {}
        }

        let result = self
            .step_executor
            .execute_step(&mut context, body.as_ref())
            .await?;

        if result.proceed {
            for mapping in &step.outputs {
                mapping.apply(&context.outputs, &mut workflow.data);
            }
        }

        self.result_processor.process_execution_result(
            workflow,
            def,
            pointer_id,
            step,
            &result,
            executor_result,
        );

        {
            let pointer = self.pointer_mut(workflow, pointer_id)?;
            step.hooks.after_execute(&result, pointer);
        }

        Ok(())
    }

    fn run_after_iteration_hooks(
        &self,
        workflow: &mut WorkflowInstance,
        def: &WorkflowDefinition,
    ) {
        let open: Vec<PointerId> = workflow
            .execution_pointers
            .iter()
            .filter(|p| p.end_time.is_none())
            .map(|p| p.id.clone())
            .collect();

        for pointer_id in open {
            let Some(hooks) = workflow
                .find_pointer(&pointer_id)
                .and_then(|p| def.find_step(p.step_id))
                .map(|s| Arc::clone(&s.hooks))
            else {
                continue;
            };
            if let Some(pointer) = workflow.find_pointer_mut(&pointer_id) {
                hooks.after_workflow_iteration(pointer);
            }
        }
    }

    fn pointer_mut<'a>(
        &self,
        workflow: &'a mut WorkflowInstance,
        pointer_id: &PointerId,
    ) -> Result<&'a mut ExecutionPointer> {
        workflow
            .find_pointer_mut(pointer_id)
            .ok_or_else(|| Error::NotFound(format!("pointer {pointer_id}")))
    }
}

/// Per-execution snapshot handed to the step body: inputs assembled from
/// the step's bindings, continuation state, branch context, and event
/// delivery state.
fn build_step_context(
    workflow: &WorkflowInstance,
    step: &WorkflowStep,
    pointer: &ExecutionPointer,
) -> StepContext {
    let mut inputs = Value::Object(serde_json::Map::new());
    for mapping in &step.inputs {
        mapping.apply(&workflow.data, &mut inputs);
    }

    let predecessor_outcome = pointer
        .predecessor_id
        .as_ref()
        .and_then(|id| workflow.find_pointer(id))
        .and_then(|p| p.outcome.clone());

    StepContext {
        workflow_id: workflow.id.clone(),
        step_id: step.id,
        pointer_id: pointer.id.clone(),
        item: pointer.context_item.clone(),
        persistence_data: pointer.persistence_data.clone(),
        event_published: pointer.event_published,
        event_data: pointer.event_data.clone(),
        predecessor_outcome,
        branch_complete: workflow.is_branch_complete(&pointer.id),
        data: workflow.data.clone(),
        inputs,
        outputs: Value::Object(serde_json::Map::new()),
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Wires an executor with default components; everything is overridable.
pub struct WorkflowExecutorBuilder {
    registry: Arc<WorkflowRegistry>,
    services: Arc<ServiceRegistry>,
    hub: Arc<dyn LifecycleEventHub>,
    options: EngineOptions,
    step_middleware: Vec<Arc<dyn StepMiddleware>>,
    workflow_middleware: Vec<Arc<dyn WorkflowMiddleware>>,
    error_handlers: Option<Vec<Arc<dyn WorkflowErrorHandler>>>,
    error_sink: Option<Arc<dyn StepErrorSink>>,
}

impl WorkflowExecutorBuilder {
    pub fn new(registry: Arc<WorkflowRegistry>) -> Self {
        Self {
            registry,
            services: Arc::new(ServiceRegistry::new()),
            hub: Arc::new(crate::providers::memory::SingleNodeEventHub::new()),
            options: EngineOptions::default(),
            step_middleware: Vec::new(),
            workflow_middleware: Vec::new(),
            error_handlers: None,
            error_sink: None,
        }
    }

    pub fn services(mut self, services: Arc<ServiceRegistry>) -> Self {
        self.services = services;
        self
    }

    pub fn hub(mut self, hub: Arc<dyn LifecycleEventHub>) -> Self {
        self.hub = hub;
        self
    }

    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn step_middleware(mut self, middleware: Arc<dyn StepMiddleware>) -> Self {
        self.step_middleware.push(middleware);
        self
    }

    pub fn workflow_middleware(mut self, middleware: Arc<dyn WorkflowMiddleware>) -> Self {
        self.workflow_middleware.push(middleware);
        self
    }

    /// Replace the default error handler set.
    pub fn error_handlers(mut self, handlers: Vec<Arc<dyn WorkflowErrorHandler>>) -> Self {
        self.error_handlers = Some(handlers);
        self
    }

    pub fn error_sink(mut self, sink: Arc<dyn StepErrorSink>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Build the executor. Requires a Tokio runtime (the lifecycle
    /// publisher spawns its dispatch task here).
    pub fn build(self) -> WorkflowExecutor {
        let publisher = Arc::new(LifecycleEventPublisher::start(
            Arc::clone(&self.hub),
            self.options.enable_lifecycle_events,
        ));
        let middleware_runner = Arc::new(WorkflowMiddlewareRunner::new(self.workflow_middleware));
        let handlers = self
            .error_handlers
            .unwrap_or_else(|| default_error_handlers(&self.options));
        let result_processor = Arc::new(ExecutionResultProcessor::new(
            Arc::clone(&publisher),
            handlers,
        ));
        let cancellation = Arc::new(CancellationProcessor::new(Arc::clone(&result_processor)));
        let scheduler = Arc::new(ExecutionScheduler::new(
            Arc::clone(&publisher),
            Arc::clone(&middleware_runner),
        ));

        WorkflowExecutor {
            registry: self.registry,
            services: self.services,
            options: self.options,
            publisher,
            step_executor: Arc::new(StepExecutor::new(self.step_middleware)),
            result_processor,
            cancellation,
            scheduler,
            middleware_runner,
            error_sink: self.error_sink,
        }
    }
}
