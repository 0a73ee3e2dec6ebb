//! Graph registry: owns pipelines and cross-pipeline connections,
//! validates them in a compile step, and exposes the execution entry points.
//!
//! A graph is `Building` until `compile` succeeds. Structural changes on a
//! compiled graph (adding or removing pipelines, components, or
//! connections) drop the compiled plan and return it to `Building`, so it
//! must be compiled again before the next `execute`. Invocations already in
//! flight keep running against the plan they started with.
//!
//! Removed components are retired rather than forgotten: `shutdown` still
//! runs `cleanup` for any that were initialized.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use pipegraph_core::config::EngineConfig;
use pipegraph_core::error::{FlowError, Result};
use pipegraph_core::event::{ErrorChannel, EventBus, FlowEvent};
use pipegraph_core::traits::Component;
use pipegraph_core::types::{ErrorEvent, ExecutionId, ExecutionResult, Value};

use crate::branch::BranchingComponent;
use crate::executor::{CompiledPipeline, Dispatch, Plan, Route};
use crate::handle::ComponentHandle;
use crate::pipeline::Pipeline;

/// Lifecycle of a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    Building,
    Compiled,
}

/// Directional edge from a component's output in one pipeline to a
/// component's input in another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub source_pipeline: String,
    pub source_component: String,
    pub target_pipeline: String,
    pub target_component: String,
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.source_pipeline, self.source_component, self.target_pipeline, self.target_component
        )
    }
}

/// Top-level registry of named pipelines and their connections.
pub struct Graph {
    pipelines: Vec<Pipeline>,
    connections: Vec<Connection>,
    config: EngineConfig,
    events: Arc<EventBus>,
    errors: Arc<ErrorChannel>,
    plan: Option<Arc<Plan>>,
    /// Handles removed from the registry that still need disposing.
    retired: Vec<Arc<ComponentHandle>>,
    /// Work dispatched by `execute`, drained by `shutdown`.
    background: Dispatch,
}

impl Graph {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            pipelines: Vec::new(),
            connections: Vec::new(),
            events: Arc::new(EventBus::new(config.event_capacity)),
            errors: Arc::new(ErrorChannel::new()),
            config,
            plan: None,
            retired: Vec::new(),
            background: Dispatch::new(),
        }
    }

    pub fn state(&self) -> GraphState {
        if self.plan.is_some() {
            GraphState::Compiled
        } else {
            GraphState::Building
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.plan.is_some()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Registration ───────────────────────────────────────────

    /// Register a new, empty pipeline.
    pub fn create_pipeline(&mut self, name: impl Into<String>) -> Result<()> {
        self.add_pipeline(Pipeline::new(name))
    }

    /// Register a pipeline assembled elsewhere.
    pub fn add_pipeline(&mut self, pipeline: Pipeline) -> Result<()> {
        if self.pipeline_index(pipeline.name()).is_some() {
            return Err(FlowError::DuplicateName {
                kind: "pipeline",
                name: pipeline.name().to_string(),
            });
        }
        debug!(pipeline = %pipeline.name(), "Pipeline registered");
        self.pipelines.push(pipeline);
        self.invalidate();
        Ok(())
    }

    /// Remove a pipeline. Connections that referenced it are kept and will
    /// fail validation until removed. Its components are disposed at
    /// `shutdown` unless the returned pipeline is registered again.
    pub fn remove_pipeline(&mut self, name: &str) -> Option<Pipeline> {
        let index = self.pipeline_index(name)?;
        self.invalidate();
        let pipeline = self.pipelines.remove(index);
        self.retired.extend(pipeline.components().iter().cloned());
        Some(pipeline)
    }

    /// Append a plain component to a pipeline.
    pub fn add_component(
        &mut self,
        pipeline: &str,
        name: impl Into<String>,
        component: impl Component,
    ) -> Result<Arc<ComponentHandle>> {
        self.add_handle(pipeline, ComponentHandle::new(name, component))
    }

    /// Append a branching component to a pipeline.
    pub fn add_branching(
        &mut self,
        pipeline: &str,
        name: impl Into<String>,
        branching: BranchingComponent,
    ) -> Result<Arc<ComponentHandle>> {
        self.add_handle(pipeline, ComponentHandle::branching(name, branching))
    }

    /// Append a prebuilt handle to a pipeline.
    pub fn add_handle(
        &mut self,
        pipeline: &str,
        handle: ComponentHandle,
    ) -> Result<Arc<ComponentHandle>> {
        let index = self
            .pipeline_index(pipeline)
            .ok_or_else(|| FlowError::UnknownReference(format!("pipeline '{}'", pipeline)))?;
        let target = &mut self.pipelines[index];
        if target.component(handle.name()).is_some() {
            return Err(FlowError::DuplicateName {
                kind: "component",
                name: format!("{}.{}", pipeline, handle.name()),
            });
        }
        debug!(pipeline = %pipeline, component = %handle.name(), "Component added");
        let handle = target.push(handle);
        self.invalidate();
        Ok(handle)
    }

    /// Remove a component from a pipeline. Connections are relations, not
    /// owners, so any that referenced it stay registered and will fail
    /// validation until removed. The removed instance is still disposed
    /// at `shutdown`.
    pub fn remove_component(
        &mut self,
        pipeline: &str,
        name: &str,
    ) -> Option<Arc<ComponentHandle>> {
        let index = self.pipeline_index(pipeline)?;
        let removed = self.pipelines[index].remove(name)?;
        self.invalidate();
        self.retired.push(removed.clone());
        Some(removed)
    }

    /// Register a connection. Both endpoints must resolve now.
    pub fn connect_components(
        &mut self,
        source_pipeline: &str,
        source_component: &str,
        target_pipeline: &str,
        target_component: &str,
    ) -> Result<()> {
        for (pipeline, component) in [
            (source_pipeline, source_component),
            (target_pipeline, target_component),
        ] {
            if let Some(problem) = self.unresolved(pipeline, component) {
                return Err(FlowError::UnknownReference(problem));
            }
        }
        if source_pipeline == target_pipeline {
            return Err(FlowError::InvalidConnection(format!(
                "connection {}.{} -> {}.{} must join two different pipelines",
                source_pipeline, source_component, target_pipeline, target_component
            )));
        }

        let connection = Connection {
            source_pipeline: source_pipeline.to_string(),
            source_component: source_component.to_string(),
            target_pipeline: target_pipeline.to_string(),
            target_component: target_component.to_string(),
        };
        if self.connections.contains(&connection) {
            return Ok(());
        }
        debug!(connection = %connection, "Connection registered");
        self.connections.push(connection);
        self.invalidate();
        Ok(())
    }

    /// Remove a connection. The referenced components are untouched.
    pub fn disconnect(&mut self, connection: &Connection) -> bool {
        let before = self.connections.len();
        self.connections.retain(|c| c != connection);
        let removed = self.connections.len() != before;
        if removed {
            self.invalidate();
        }
        removed
    }

    // ── Inspection ─────────────────────────────────────────────

    pub fn pipeline(&self, name: &str) -> Option<&Pipeline> {
        self.pipelines.iter().find(|p| p.name() == name)
    }

    /// Pipeline names in registration order.
    pub fn pipeline_names(&self) -> Vec<&str> {
        self.pipelines.iter().map(|p| p.name()).collect()
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn component(&self, pipeline: &str, name: &str) -> Option<Arc<ComponentHandle>> {
        self.pipeline(pipeline)?.component(name).cloned()
    }

    /// Current value of a component's state cell.
    pub fn state_value(&self, pipeline: &str, component: &str, key: &str) -> Option<Value> {
        self.pipeline(pipeline)?.component(component)?.state(key)
    }

    // ── Observation ────────────────────────────────────────────

    /// Attach a graph-wide error handler. It runs after the component's
    /// and the pipeline's own handlers.
    pub fn subscribe_errors(&self, handler: impl Fn(&ErrorEvent) + Send + Sync + 'static) {
        self.errors.subscribe(handler);
    }

    pub fn subscribe_pipeline_errors(
        &self,
        pipeline: &str,
        handler: impl Fn(&ErrorEvent) + Send + Sync + 'static,
    ) -> Result<()> {
        let pipeline = self
            .pipeline(pipeline)
            .ok_or_else(|| FlowError::UnknownReference(format!("pipeline '{}'", pipeline)))?;
        pipeline.subscribe_errors(handler);
        Ok(())
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    // ── Compile ────────────────────────────────────────────────

    /// Every structural problem, in registration order.
    pub fn validate(&self) -> Vec<String> {
        let mut violations = Vec::new();

        for pipeline in &self.pipelines {
            if pipeline.is_empty() {
                violations.push(format!("pipeline '{}' has no components", pipeline.name()));
            }
            for name in pipeline.duplicate_names() {
                violations.push(format!(
                    "pipeline '{}' has duplicate component name '{}'",
                    pipeline.name(),
                    name
                ));
            }
            for stage in pipeline.components() {
                if let Some(branching) = stage.as_branching() {
                    for name in branching.duplicate_targets() {
                        violations.push(format!(
                            "branching component '{}' in pipeline '{}' has duplicate target '{}'",
                            stage.name(),
                            pipeline.name(),
                            name
                        ));
                    }
                }
            }
        }

        for connection in &self.connections {
            for (pipeline, component) in [
                (&connection.source_pipeline, &connection.source_component),
                (&connection.target_pipeline, &connection.target_component),
            ] {
                if let Some(problem) = self.unresolved(pipeline, component) {
                    violations.push(format!("connection {}: {}", connection, problem));
                }
            }
        }

        violations
    }

    /// Validate and build the execution plan.
    ///
    /// A no-op if the graph is already compiled. On failure every violation
    /// is reported and the graph stays in `Building`.
    pub fn compile(&mut self) -> Result<()> {
        if self.plan.is_some() {
            debug!("Graph already compiled");
            return Ok(());
        }

        let violations = self.validate();
        if !violations.is_empty() {
            warn!(count = violations.len(), "Graph validation failed");
            return Err(FlowError::GraphValidation { violations });
        }

        let mut compiled: Vec<CompiledPipeline> = self
            .pipelines
            .iter()
            .map(|p| CompiledPipeline {
                name: p.name().to_string(),
                stages: p.components().to_vec(),
                errors: p.errors().clone(),
                routes: vec![Vec::new(); p.len()],
            })
            .collect();

        for connection in &self.connections {
            let source = self.locate(&connection.source_pipeline, &connection.source_component);
            let target = self.locate(&connection.target_pipeline, &connection.target_component);
            if let (Some((sp, ss)), Some((tp, ts))) = (source, target) {
                compiled[sp].routes[ss].push(Route {
                    pipeline: tp,
                    stage: ts,
                });
            }
        }

        self.plan = Some(Arc::new(Plan::new(
            compiled,
            self.events.clone(),
            self.errors.clone(),
            self.config.max_dispatch_depth,
        )));
        info!(
            pipelines = self.pipelines.len(),
            connections = self.connections.len(),
            "Graph compiled"
        );
        Ok(())
    }

    // ── Execution ──────────────────────────────────────────────

    /// Run a pipeline. Output forwarded along connections runs in the
    /// background; this returns as soon as the named pipeline finishes.
    /// `shutdown` waits for that background work before disposing anything.
    pub async fn execute(&self, pipeline: &str, input: Value) -> Result<ExecutionResult> {
        let (plan, index) = self.entry(pipeline)?;
        plan.run(
            index,
            0,
            input,
            ExecutionId::new(),
            0,
            self.background.clone(),
        )
        .await
    }

    /// Run a pipeline and wait for everything it dispatched, transitively,
    /// before returning. The returned result is the same as `execute`'s.
    pub async fn execute_and_await(&self, pipeline: &str, input: Value) -> Result<ExecutionResult> {
        let (plan, index) = self.entry(pipeline)?;
        let dispatch = Dispatch::new();
        let result = plan
            .run(index, 0, input, ExecutionId::new(), 0, dispatch.clone())
            .await;
        dispatch.drain().await;
        result
    }

    /// Tear down every component: `cleanup` runs once for each instance
    /// whose `initialize` succeeded, then all are disposed. Work still
    /// running from `execute` is awaited first, and components removed
    /// earlier are disposed along with the registered ones. The compiled
    /// plan is dropped.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.background.drain().await;
        self.invalidate();
        let mut failures = Vec::new();
        for pipeline in &self.pipelines {
            for stage in pipeline.components() {
                failures.extend(stage.dispose().await);
            }
        }
        for handle in std::mem::take(&mut self.retired) {
            failures.extend(handle.dispose().await);
        }
        info!(failures = failures.len(), "Graph shut down");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(FlowError::Teardown { failures })
        }
    }

    // ── Internals ──────────────────────────────────────────────

    fn entry(&self, pipeline: &str) -> Result<(Arc<Plan>, usize)> {
        let plan = self.plan.clone().ok_or(FlowError::NotCompiled)?;
        let index = plan
            .pipeline_index(pipeline)
            .ok_or_else(|| FlowError::UnknownPipeline(pipeline.to_string()))?;
        Ok((plan, index))
    }

    fn pipeline_index(&self, name: &str) -> Option<usize> {
        self.pipelines.iter().position(|p| p.name() == name)
    }

    fn locate(&self, pipeline: &str, component: &str) -> Option<(usize, usize)> {
        let p = self.pipeline_index(pipeline)?;
        let c = self.pipelines[p].position(component)?;
        Some((p, c))
    }

    fn unresolved(&self, pipeline: &str, component: &str) -> Option<String> {
        match self.pipeline(pipeline) {
            None => Some(format!("unknown pipeline '{}'", pipeline)),
            Some(p) if p.component(component).is_none() => Some(format!(
                "unknown component '{}' in pipeline '{}'",
                component, pipeline
            )),
            Some(_) => None,
        }
    }

    fn invalidate(&mut self) {
        if self.plan.take().is_some() {
            debug!("Structural change, compiled plan dropped");
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("state", &self.state())
            .field("pipelines", &self.pipelines)
            .field("connections", &self.connections)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::Passthrough;

    fn two_pipelines() -> Graph {
        let mut graph = Graph::new();
        graph.create_pipeline("a").unwrap();
        graph.create_pipeline("b").unwrap();
        graph.add_component("a", "src", Passthrough).unwrap();
        graph.add_component("b", "dst", Passthrough).unwrap();
        graph
    }

    #[test]
    fn duplicate_pipeline_rejected() {
        let mut graph = Graph::new();
        graph.create_pipeline("main").unwrap();
        let err = graph.create_pipeline("main").unwrap_err();
        assert!(matches!(err, FlowError::DuplicateName { kind: "pipeline", .. }));
    }

    #[test]
    fn duplicate_component_rejected_on_add() {
        let mut graph = Graph::new();
        graph.create_pipeline("main").unwrap();
        graph.add_component("main", "x", Passthrough).unwrap();
        let err = graph.add_component("main", "x", Passthrough).unwrap_err();
        assert!(matches!(err, FlowError::DuplicateName { kind: "component", .. }));
    }

    #[test]
    fn add_to_unknown_pipeline() {
        let mut graph = Graph::new();
        let err = graph.add_component("ghost", "x", Passthrough).unwrap_err();
        assert!(matches!(err, FlowError::UnknownReference(_)));
    }

    #[test]
    fn connect_requires_resolvable_endpoints() {
        let mut graph = two_pipelines();
        assert!(matches!(
            graph.connect_components("a", "missing", "b", "dst"),
            Err(FlowError::UnknownReference(_))
        ));
        assert!(matches!(
            graph.connect_components("a", "src", "nope", "dst"),
            Err(FlowError::UnknownReference(_))
        ));
        graph.connect_components("a", "src", "b", "dst").unwrap();
        graph.connect_components("a", "src", "b", "dst").unwrap();
        assert_eq!(graph.connections().len(), 1);
        assert_eq!(graph.connections()[0].to_string(), "a.src -> b.dst");
    }

    #[test]
    fn connect_within_one_pipeline_rejected() {
        let mut graph = two_pipelines();
        graph.add_component("a", "other", Passthrough).unwrap();
        assert!(matches!(
            graph.connect_components("a", "src", "a", "other"),
            Err(FlowError::InvalidConnection(msg)) if msg.contains("a.src -> a.other")
        ));
    }

    #[test]
    fn compile_collects_all_violations() {
        let mut graph = two_pipelines();
        graph.connect_components("a", "src", "b", "dst").unwrap();
        graph.create_pipeline("empty").unwrap();
        graph.add_pipeline(
            Pipeline::new("dupes")
                .with_component("x", Passthrough)
                .with_component("x", Passthrough),
        )
        .unwrap();
        graph.remove_component("b", "dst").unwrap();

        let err = graph.compile().unwrap_err();
        let FlowError::GraphValidation { violations } = err else {
            panic!("expected validation error");
        };
        assert_eq!(violations.len(), 4);
        assert!(violations[0].contains("'b' has no components"));
        assert!(violations[1].contains("'empty' has no components"));
        assert!(violations[2].contains("duplicate component name 'x'"));
        assert!(violations[3].contains("unknown component 'dst'"));
        assert_eq!(graph.state(), GraphState::Building);
    }

    #[test]
    fn compile_is_idempotent_and_mutation_invalidates() {
        let mut graph = two_pipelines();
        graph.compile().unwrap();
        assert_eq!(graph.state(), GraphState::Compiled);
        graph.compile().unwrap();
        assert!(graph.is_compiled());

        graph.add_component("b", "more", Passthrough).unwrap();
        assert_eq!(graph.state(), GraphState::Building);
        graph.compile().unwrap();
        assert!(graph.is_compiled());
    }

    #[test]
    fn disconnect_keeps_components() {
        let mut graph = two_pipelines();
        graph.connect_components("a", "src", "b", "dst").unwrap();
        let connection = graph.connections()[0].clone();
        assert!(graph.disconnect(&connection));
        assert!(!graph.disconnect(&connection));
        assert!(graph.component("a", "src").is_some());
        assert!(graph.component("b", "dst").is_some());
    }

    #[tokio::test]
    async fn execute_before_compile() {
        let graph = two_pipelines();
        let err = graph.execute("a", Value::Null).await.unwrap_err();
        assert!(matches!(err, FlowError::NotCompiled));
    }

    #[tokio::test]
    async fn execute_unknown_pipeline() {
        let mut graph = two_pipelines();
        graph.compile().unwrap();
        let err = graph.execute("zzz", Value::Null).await.unwrap_err();
        assert!(matches!(err, FlowError::UnknownPipeline(name) if name == "zzz"));
    }

    #[test]
    fn pipeline_error_subscription_requires_pipeline() {
        let graph = two_pipelines();
        assert!(graph.subscribe_pipeline_errors("a", |_| {}).is_ok());
        assert!(graph.subscribe_pipeline_errors("zzz", |_| {}).is_err());
    }
}
