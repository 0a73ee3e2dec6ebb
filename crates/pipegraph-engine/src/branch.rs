//! Branching components: route an input to exactly one target.
//!
//! Branches are evaluated in registration order and the first predicate
//! that returns true wins; later predicates are never evaluated. If nothing
//! matches, the default target runs (with no label). Without a default the
//! step fails with `NoBranchMatched`.
//!
//! Predicates must be free of side effects. This is not checked.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use pipegraph_core::error::{FlowError, Result};
use pipegraph_core::traits::Component;
use pipegraph_core::types::Value;

use crate::executor::Scope;
use crate::expr::Expr;
use crate::handle::{ComponentHandle, StepOutput};

/// A side-effect-free test over a component input.
#[derive(Clone)]
pub struct Predicate(Arc<dyn Fn(&Value) -> bool + Send + Sync>);

impl Predicate {
    pub fn new(f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Parse a predicate expression such as `priority == "high"`.
    pub fn expr(expr: &str) -> Result<Self> {
        let parsed = Expr::parse(expr)?;
        Ok(Self::new(move |input| parsed.evaluate(input)))
    }

    /// Matches every input.
    pub fn always() -> Self {
        Self::new(|_| true)
    }

    pub fn test(&self, input: &Value) -> bool {
        (self.0)(input)
    }
}

impl std::fmt::Debug for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Predicate")
    }
}

struct Branch {
    label: String,
    predicate: Predicate,
    target: Arc<ComponentHandle>,
}

/// Routes its input to the first branch whose predicate matches.
///
/// Owns its targets; they are not members of the enclosing pipeline and
/// cannot be addressed by connections.
#[derive(Default)]
pub struct BranchingComponent {
    branches: Vec<Branch>,
    default: Option<Arc<ComponentHandle>>,
}

impl BranchingComponent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a branch whose target is a plain component.
    pub fn branch(
        self,
        label: impl Into<String>,
        predicate: Predicate,
        target_name: impl Into<String>,
        target: impl Component,
    ) -> Self {
        self.branch_to(label, predicate, ComponentHandle::new(target_name, target))
    }

    /// Append a branch with a prebuilt target handle (which may itself branch).
    pub fn branch_to(
        mut self,
        label: impl Into<String>,
        predicate: Predicate,
        target: ComponentHandle,
    ) -> Self {
        self.branches.push(Branch {
            label: label.into(),
            predicate,
            target: Arc::new(target),
        });
        self
    }

    /// Set the target used when no predicate matches.
    pub fn default_branch(self, target_name: impl Into<String>, target: impl Component) -> Self {
        self.default_to(ComponentHandle::new(target_name, target))
    }

    pub fn default_to(mut self, target: ComponentHandle) -> Self {
        self.default = Some(Arc::new(target));
        self
    }

    /// Branch labels in evaluation order.
    pub fn labels(&self) -> Vec<&str> {
        self.branches.iter().map(|b| b.label.as_str()).collect()
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// Pick the target for `input`. The label is `None` for the default.
    pub fn select(&self, input: &Value) -> Option<(Option<&str>, &Arc<ComponentHandle>)> {
        self.branches
            .iter()
            .find(|b| b.predicate.test(input))
            .map(|b| (Some(b.label.as_str()), &b.target))
            .or_else(|| self.default.as_ref().map(|d| (None, d)))
    }

    /// Every target handle, branches first, then the default.
    pub fn targets(&self) -> impl Iterator<Item = &Arc<ComponentHandle>> {
        self.branches
            .iter()
            .map(|b| &b.target)
            .chain(self.default.iter())
    }

    /// Target names that appear more than once.
    pub(crate) fn duplicate_targets(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for target in self.targets() {
            if !seen.insert(target.name()) && !duplicates.iter().any(|d| d == target.name()) {
                duplicates.push(target.name().to_string());
            }
        }
        duplicates
    }

    pub(crate) async fn route(
        &self,
        owner: &str,
        input: Value,
        scope: &Scope<'_>,
    ) -> Result<StepOutput> {
        let (label, target) = self.select(&input).ok_or_else(|| FlowError::NoBranchMatched {
            component: owner.to_string(),
        })?;
        let label = label.map(str::to_string);

        debug!(
            component = %owner,
            branch = label.as_deref().unwrap_or("<default>"),
            target = %target.name(),
            "Branch selected"
        );
        scope.branch_taken(owner, label.clone(), target.name());

        match target.invoke(input, scope).await {
            Ok(output) => Ok(StepOutput::Branched {
                label,
                value: output.into_value(),
            }),
            Err(e) => {
                scope.notify_error(target.errors(), target.name(), &e);
                Err(FlowError::Execution {
                    pipeline: scope.pipeline().to_string(),
                    component: target.name().to_string(),
                    source: Box::new(e),
                })
            }
        }
    }
}

impl std::fmt::Debug for BranchingComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchingComponent")
            .field("branches", &self.labels())
            .field("default", &self.default.as_ref().map(|d| d.name().to_string()))
            .finish()
    }
}
