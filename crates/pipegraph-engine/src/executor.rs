//! Execution of a compiled graph.
//!
//! A `Plan` is an immutable snapshot taken by `Graph::compile`. Connections
//! are resolved into `(pipeline, stage)` indices so no name lookups happen
//! while executing. Each invocation walks one pipeline front to back; a
//! component's output is forwarded along its connections by spawning a
//! task per route. Every spawned task is tracked, so a caller can await
//! it directly or the graph can wait for it before tearing down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pipegraph_core::error::{FlowError, Result};
use pipegraph_core::event::{ErrorChannel, EventBus, FlowEvent};
use pipegraph_core::types::{ErrorEvent, ExecutionId, ExecutionResult, Value};

use crate::handle::{ComponentHandle, StepOutput};

/// Per-invocation facts shared with components while they run.
pub(crate) struct Scope<'a> {
    execution_id: &'a ExecutionId,
    pipeline: &'a str,
    events: &'a EventBus,
}

impl<'a> Scope<'a> {
    pub(crate) fn pipeline(&self) -> &str {
        self.pipeline
    }

    pub(crate) fn branch_taken(&self, component: &str, label: Option<String>, target: &str) {
        self.events.publish(FlowEvent::BranchTaken {
            execution_id: self.execution_id.clone(),
            component: component.to_string(),
            label,
            target: target.to_string(),
        });
    }

    pub(crate) fn error_event(&self, component: &str, error: &FlowError) -> ErrorEvent {
        ErrorEvent {
            execution_id: self.execution_id.clone(),
            pipeline: self.pipeline.to_string(),
            component: component.to_string(),
            kind: error.root_cause().kind().to_string(),
            message: error.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn notify_error(&self, channel: &ErrorChannel, component: &str, error: &FlowError) {
        channel.notify(&self.error_event(component, error));
    }
}

/// A connection resolved to stage indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Route {
    pub pipeline: usize,
    pub stage: usize,
}

pub(crate) struct CompiledPipeline {
    pub name: String,
    pub stages: Vec<Arc<ComponentHandle>>,
    pub errors: Arc<ErrorChannel>,
    /// Outgoing routes, indexed by stage.
    pub routes: Vec<Vec<Route>>,
}

/// Tracks the tasks spawned by dispatch so `drain` can await them,
/// including tasks spawned transitively by other dispatched runs.
#[derive(Clone, Default)]
pub(crate) struct Dispatch {
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Dispatch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Long-lived trackers only keep what is still running.
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Wait until every tracked task, and every task those spawn, is done.
    pub(crate) async fn drain(&self) {
        loop {
            let batch: Vec<JoinHandle<()>> = std::mem::take(
                &mut *self
                    .pending
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            );
            if batch.is_empty() {
                break;
            }
            for handle in batch {
                if let Err(e) = handle.await {
                    error!(error = %e, "Dispatch task did not complete");
                }
            }
        }
    }
}

/// Immutable execution plan produced by `Graph::compile`.
pub(crate) struct Plan {
    pipelines: Vec<CompiledPipeline>,
    index: HashMap<String, usize>,
    events: Arc<EventBus>,
    graph_errors: Arc<ErrorChannel>,
    max_dispatch_depth: usize,
}

impl Plan {
    pub(crate) fn new(
        pipelines: Vec<CompiledPipeline>,
        events: Arc<EventBus>,
        graph_errors: Arc<ErrorChannel>,
        max_dispatch_depth: usize,
    ) -> Self {
        let index = pipelines
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();
        Self {
            pipelines,
            index,
            events,
            graph_errors,
            max_dispatch_depth,
        }
    }

    pub(crate) fn pipeline_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Run `pipeline` starting at `start`, feeding each output forward.
    pub(crate) fn run(
        self: Arc<Self>,
        pipeline: usize,
        start: usize,
        input: Value,
        execution_id: ExecutionId,
        depth: usize,
        dispatch: Dispatch,
    ) -> BoxFuture<'static, Result<ExecutionResult>> {
        Box::pin(async move {
            let started = Instant::now();
            let compiled = &self.pipelines[pipeline];
            let scope = Scope {
                execution_id: &execution_id,
                pipeline: &compiled.name,
                events: &self.events,
            };

            info!(
                execution_id = %execution_id,
                pipeline = %compiled.name,
                depth,
                "Executing pipeline"
            );
            self.events.publish(FlowEvent::ExecutionStarted {
                execution_id: execution_id.clone(),
                pipeline: compiled.name.clone(),
            });

            let mut value = input;
            let mut branch = None;

            for (idx, stage) in compiled.stages.iter().enumerate().skip(start) {
                self.events.publish(FlowEvent::ComponentStarted {
                    execution_id: execution_id.clone(),
                    pipeline: compiled.name.clone(),
                    component: stage.name().to_string(),
                });

                let step_start = Instant::now();
                let output = match stage.invoke(value, &scope).await {
                    Ok(output) => output,
                    Err(e) => return Err(self.fail(compiled, stage, e, &scope)),
                };
                let elapsed_ms = step_start.elapsed().as_millis() as u64;

                debug!(
                    pipeline = %compiled.name,
                    component = %stage.name(),
                    elapsed_ms,
                    "Component complete"
                );
                self.events.publish(FlowEvent::ComponentCompleted {
                    execution_id: execution_id.clone(),
                    pipeline: compiled.name.clone(),
                    component: stage.name().to_string(),
                    elapsed_ms,
                });

                self.dispatch(pipeline, idx, output.value(), &execution_id, depth, &dispatch);

                match output {
                    StepOutput::Value(next) => value = next,
                    StepOutput::Branched { label, value: result } => {
                        // The chosen handler replaces the rest of the pipeline.
                        branch = label;
                        value = result;
                        break;
                    }
                }
            }

            let elapsed_ms = started.elapsed().as_millis() as u64;
            info!(
                execution_id = %execution_id,
                pipeline = %compiled.name,
                branch = branch.as_deref().unwrap_or(""),
                elapsed_ms,
                "Pipeline complete"
            );
            self.events.publish(FlowEvent::ExecutionCompleted {
                execution_id: execution_id.clone(),
                pipeline: compiled.name.clone(),
                branch: branch.clone(),
                result: value.clone(),
            });

            Ok(ExecutionResult {
                execution_id,
                pipeline: compiled.name.clone(),
                branch,
                result: value,
                elapsed_ms,
            })
        })
    }

    /// Deliver a component failure to every error channel (component, then
    /// pipeline, then graph) and wrap it for the caller.
    fn fail(
        &self,
        compiled: &CompiledPipeline,
        stage: &ComponentHandle,
        error: FlowError,
        scope: &Scope<'_>,
    ) -> FlowError {
        let event = scope.error_event(stage.name(), &error);
        stage.errors().notify(&event);
        compiled.errors.notify(&event);
        self.graph_errors.notify(&event);

        error!(
            execution_id = %event.execution_id,
            pipeline = %compiled.name,
            component = %stage.name(),
            error = %error,
            "Component failed"
        );
        self.events.publish(FlowEvent::ComponentFailed {
            execution_id: event.execution_id.clone(),
            pipeline: compiled.name.clone(),
            component: stage.name().to_string(),
            error: error.to_string(),
        });
        self.events.publish(FlowEvent::ExecutionFailed {
            execution_id: event.execution_id,
            pipeline: compiled.name.clone(),
            error: error.to_string(),
        });

        FlowError::Execution {
            pipeline: compiled.name.clone(),
            component: stage.name().to_string(),
            source: Box::new(error),
        }
    }

    /// Forward `value` along every connection leaving `(pipeline, stage)`.
    fn dispatch(
        self: &Arc<Self>,
        pipeline: usize,
        stage: usize,
        value: &Value,
        execution_id: &ExecutionId,
        depth: usize,
        dispatch: &Dispatch,
    ) {
        let source = &self.pipelines[pipeline];
        for route in &source.routes[stage] {
            let target = &self.pipelines[route.pipeline];
            let from = format!("{}.{}", source.name, source.stages[stage].name());
            let to = format!("{}.{}", target.name, target.stages[route.stage].name());

            if depth + 1 > self.max_dispatch_depth {
                warn!(
                    from = %from,
                    to = %to,
                    max_depth = self.max_dispatch_depth,
                    "Dispatch depth exceeded, dropping"
                );
                continue;
            }

            self.events.publish(FlowEvent::Dispatched {
                execution_id: execution_id.clone(),
                from: from.clone(),
                to: to.clone(),
                depth: depth + 1,
            });

            let plan = Arc::clone(self);
            let value = value.clone();
            let id = execution_id.clone();
            let tracker = dispatch.clone();
            let route = *route;
            let handle = tokio::spawn(async move {
                // Failures were already delivered on the error channels.
                if let Err(e) = plan
                    .run(route.pipeline, route.stage, value, id, depth + 1, tracker)
                    .await
                {
                    warn!(from = %from, to = %to, error = %e, "Dispatched execution failed");
                }
            });
            dispatch.track(handle);
        }
    }
}
