use std::collections::HashSet;
use std::sync::Arc;

use pipegraph_core::event::ErrorChannel;
use pipegraph_core::traits::Component;
use pipegraph_core::types::ErrorEvent;

use crate::branch::BranchingComponent;
use crate::handle::ComponentHandle;

/// An ordered sequence of components. Append order is execution order.
///
/// A pipeline can be assembled on its own and handed to
/// `Graph::add_pipeline`; component names are only checked for uniqueness
/// by `Graph::compile` in that case.
pub struct Pipeline {
    name: String,
    stages: Vec<Arc<ComponentHandle>>,
    errors: Arc<ErrorChannel>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            errors: Arc::new(ErrorChannel::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a plain component.
    pub fn with_component(self, name: impl Into<String>, component: impl Component) -> Self {
        self.with_handle(ComponentHandle::new(name, component))
    }

    /// Append a branching component.
    pub fn with_branching(self, name: impl Into<String>, branching: BranchingComponent) -> Self {
        self.with_handle(ComponentHandle::branching(name, branching))
    }

    pub fn with_handle(mut self, handle: ComponentHandle) -> Self {
        self.push(handle);
        self
    }

    pub(crate) fn push(&mut self, handle: ComponentHandle) -> Arc<ComponentHandle> {
        let handle = Arc::new(handle);
        self.stages.push(handle.clone());
        handle
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<Arc<ComponentHandle>> {
        let position = self.position(name)?;
        Some(self.stages.remove(position))
    }

    /// Components in execution order.
    pub fn components(&self) -> &[Arc<ComponentHandle>] {
        &self.stages
    }

    pub fn component(&self, name: &str) -> Option<&Arc<ComponentHandle>> {
        self.stages.iter().find(|s| s.name() == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name() == name)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Attach a handler that sees every component failure in this pipeline.
    pub fn subscribe_errors(&self, handler: impl Fn(&ErrorEvent) + Send + Sync + 'static) {
        self.errors.subscribe(handler);
    }

    pub(crate) fn errors(&self) -> &Arc<ErrorChannel> {
        &self.errors
    }

    /// Component names that appear more than once, in first-seen order.
    pub(crate) fn duplicate_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut duplicates: Vec<String> = Vec::new();
        for stage in &self.stages {
            if !seen.insert(stage.name()) && !duplicates.iter().any(|d| d == stage.name()) {
                duplicates.push(stage.name().to_string());
            }
        }
        duplicates
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field(
                "components",
                &self.stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::Passthrough;

    #[test]
    fn append_order_is_preserved() {
        let pipeline = Pipeline::new("main")
            .with_component("a", Passthrough)
            .with_component("b", Passthrough)
            .with_component("c", Passthrough);
        let names: Vec<&str> = pipeline.components().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(pipeline.position("b"), Some(1));
        assert!(pipeline.component("z").is_none());
    }

    #[test]
    fn duplicates_reported_once() {
        let pipeline = Pipeline::new("main")
            .with_component("a", Passthrough)
            .with_component("a", Passthrough)
            .with_component("a", Passthrough)
            .with_component("b", Passthrough);
        assert_eq!(pipeline.duplicate_names(), vec!["a".to_string()]);
    }

    #[test]
    fn remove_keeps_order() {
        let mut pipeline = Pipeline::new("main")
            .with_component("a", Passthrough)
            .with_component("b", Passthrough)
            .with_component("c", Passthrough);
        assert!(pipeline.remove("b").is_some());
        assert!(pipeline.remove("b").is_none());
        assert_eq!(pipeline.position("c"), Some(1));
    }
}
