use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use pipegraph_core::config::{ComponentConfig, FlowConfig};
use pipegraph_core::error::{FlowError, Result};
use pipegraph_core::traits::Component;

use crate::branch::{BranchingComponent, Predicate};
use crate::builtin::{Counter, Passthrough, SetFields, Template};
use crate::graph::Graph;
use crate::handle::ComponentHandle;

/// Builds a component instance from its declaration.
pub type Constructor = Arc<dyn Fn(&ComponentConfig) -> Result<Arc<dyn Component>> + Send + Sync>;

/// Kind reserved for branching components; its shape is fixed by
/// `ComponentConfig::branches` and `ComponentConfig::default`.
pub const ROUTER_KIND: &str = "router";

/// Maps component kinds to constructors and assembles graphs from flow files.
#[derive(Clone, Default)]
pub struct ComponentFactory {
    constructors: HashMap<String, Constructor>,
}

impl ComponentFactory {
    /// An empty factory. Only `router` is understood.
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory with `passthrough`, `template`, `counter` and `set`.
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        factory.register("passthrough", |_| Ok(Arc::new(Passthrough)));
        factory.register("template", |config| {
            Ok(Arc::new(Template::new(config.require_str("template")?)))
        });
        factory.register("counter", |config| {
            let mut counter = Counter::new();
            if let Some(key) = config.option_str("key") {
                counter = counter.with_key(key);
            }
            if let Some(step) = config.options.get("step") {
                let step = step.as_i64().ok_or_else(|| {
                    FlowError::Config(format!(
                        "component '{}' (counter): 'step' must be an integer",
                        config.name
                    ))
                })?;
                counter = counter.with_step(step);
            }
            Ok(Arc::new(counter))
        });
        factory.register("set", |config| {
            let fields = config
                .options
                .get("fields")
                .and_then(|v| v.as_object())
                .cloned()
                .ok_or_else(|| {
                    FlowError::Config(format!(
                        "component '{}' (set) requires a 'fields' table",
                        config.name
                    ))
                })?;
            Ok(Arc::new(SetFields::new(fields)))
        });
        factory
    }

    /// Register a constructor. Replaces any previous one for `kind`.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        constructor: impl Fn(&ComponentConfig) -> Result<Arc<dyn Component>> + Send + Sync + 'static,
    ) {
        self.constructors.insert(kind.into(), Arc::new(constructor));
    }

    /// Registered kinds, sorted. `router` is always available.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.constructors.keys().map(|k| k.as_str()).collect();
        kinds.push(ROUTER_KIND);
        kinds.sort_unstable();
        kinds.dedup();
        kinds
    }

    /// Build one component handle. Router targets are built recursively.
    pub fn build_component(&self, config: &ComponentConfig) -> Result<ComponentHandle> {
        if config.kind == ROUTER_KIND {
            return self.build_router(config);
        }
        let constructor = self.constructors.get(&config.kind).ok_or_else(|| {
            FlowError::Config(format!(
                "component '{}' has unknown kind '{}' (known: {})",
                config.name,
                config.kind,
                self.kinds().join(", ")
            ))
        })?;
        let component = constructor(config)?;
        Ok(ComponentHandle::from_arc(config.name.clone(), component))
    }

    fn build_router(&self, config: &ComponentConfig) -> Result<ComponentHandle> {
        let mut router = BranchingComponent::new();
        for branch in &config.branches {
            let predicate = Predicate::expr(&branch.when).map_err(|e| {
                FlowError::Config(format!(
                    "router '{}' branch '{}': {}",
                    config.name, branch.label, e
                ))
            })?;
            let target = self.build_component(&branch.target)?;
            router = router.branch_to(branch.label.clone(), predicate, target);
        }
        if let Some(default) = &config.default {
            router = router.default_to(self.build_component(default)?);
        }
        Ok(ComponentHandle::branching(config.name.clone(), router))
    }

    /// Assemble an uncompiled graph from a flow file.
    pub fn build(&self, flow: &FlowConfig) -> Result<Graph> {
        let mut graph = Graph::with_config(flow.engine.clone());

        for pipeline in &flow.pipelines {
            graph.create_pipeline(pipeline.name.clone())?;
            for component in &pipeline.components {
                graph.add_handle(&pipeline.name, self.build_component(component)?)?;
            }
        }

        for connection in &flow.connections {
            let ((sp, sc), (tp, tc)) = connection.endpoints()?;
            graph.connect_components(sp, sc, tp, tc)?;
        }

        debug!(
            pipelines = flow.pipelines.len(),
            connections = flow.connections.len(),
            "Graph built from flow"
        );
        Ok(graph)
    }
}

impl std::fmt::Debug for ComponentFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentFactory")
            .field("kinds", &self.kinds())
            .finish()
    }
}
