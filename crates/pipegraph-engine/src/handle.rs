use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use pipegraph_core::error::{FlowError, Result};
use pipegraph_core::event::ErrorChannel;
use pipegraph_core::state::ComponentContext;
use pipegraph_core::traits::Component;
use pipegraph_core::types::{ErrorEvent, Lifecycle, Value};

use crate::branch::BranchingComponent;
use crate::executor::Scope;

/// What a handle wraps.
pub(crate) enum Kind {
    Plain(Arc<dyn Component>),
    Branching(BranchingComponent),
}

/// Output of a single step.
pub(crate) enum StepOutput {
    /// Linear output; the pipeline continues.
    Value(Value),
    /// A branching component ran; the pipeline stops here.
    Branched { label: Option<String>, value: Value },
}

impl StepOutput {
    pub(crate) fn value(&self) -> &Value {
        match self {
            Self::Value(v) => v,
            Self::Branched { value, .. } => value,
        }
    }

    pub(crate) fn into_value(self) -> Value {
        match self {
            Self::Value(v) => v,
            Self::Branched { value, .. } => value,
        }
    }
}

/// A named component instance inside a pipeline.
///
/// The handle owns the instance's state cells, its error channel, and an
/// execution lock. The lock serializes `process` calls on this instance
/// across concurrent invocations, which keeps read-modify-write sequences
/// on its state cells atomic.
pub struct ComponentHandle {
    name: String,
    kind: Kind,
    ctx: ComponentContext,
    lifecycle: Mutex<Lifecycle>,
    errors: ErrorChannel,
}

impl ComponentHandle {
    pub fn new(name: impl Into<String>, component: impl Component) -> Self {
        Self::from_arc(name, Arc::new(component))
    }

    pub fn from_arc(name: impl Into<String>, component: Arc<dyn Component>) -> Self {
        Self::with_kind(name.into(), Kind::Plain(component))
    }

    pub fn branching(name: impl Into<String>, branching: BranchingComponent) -> Self {
        Self::with_kind(name.into(), Kind::Branching(branching))
    }

    fn with_kind(name: String, kind: Kind) -> Self {
        Self {
            ctx: ComponentContext::new(name.clone()),
            name,
            kind,
            lifecycle: Mutex::new(Lifecycle::Created),
            errors: ErrorChannel::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// This instance's state cells.
    pub fn context(&self) -> &ComponentContext {
        &self.ctx
    }

    /// Current value of one of this instance's state cells.
    pub fn state(&self, key: &str) -> Option<Value> {
        self.ctx.state_value(key)
    }

    pub fn is_branching(&self) -> bool {
        matches!(self.kind, Kind::Branching(_))
    }

    pub(crate) fn as_branching(&self) -> Option<&BranchingComponent> {
        match &self.kind {
            Kind::Branching(b) => Some(b),
            Kind::Plain(_) => None,
        }
    }

    /// Attach a handler to this component's error channel.
    pub fn subscribe_errors(&self, handler: impl Fn(&ErrorEvent) + Send + Sync + 'static) {
        self.errors.subscribe(handler);
    }

    pub(crate) fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    /// Waits for any in-flight `process` call on this instance.
    pub async fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock().await
    }

    /// Run one step. Initializes the component first if needed.
    pub(crate) fn invoke<'a>(
        &'a self,
        input: Value,
        scope: &'a Scope<'a>,
    ) -> BoxFuture<'a, Result<StepOutput>> {
        Box::pin(async move {
            match &self.kind {
                Kind::Plain(component) => {
                    let mut lifecycle = self.lifecycle.lock().await;
                    match *lifecycle {
                        Lifecycle::Disposed => {
                            return Err(FlowError::Disposed(self.name.clone()))
                        }
                        Lifecycle::Created => {
                            component.initialize(&self.ctx).await?;
                            debug!(component = %self.name, "Component initialized");
                            *lifecycle = Lifecycle::Initialized;
                        }
                        Lifecycle::Initialized | Lifecycle::Active => {}
                    }
                    *lifecycle = Lifecycle::Active;
                    let value = component.process(input, &self.ctx).await?;
                    Ok(StepOutput::Value(value))
                }
                Kind::Branching(branching) => {
                    {
                        let mut lifecycle = self.lifecycle.lock().await;
                        if *lifecycle == Lifecycle::Disposed {
                            return Err(FlowError::Disposed(self.name.clone()));
                        }
                        *lifecycle = Lifecycle::Active;
                    }
                    // Targets carry their own execution locks.
                    branching.route(&self.name, input, scope).await
                }
            }
        })
    }

    /// Run `cleanup` if owed and mark the instance disposed. Returns a
    /// description of every cleanup failure, including branch targets.
    pub(crate) fn dispose(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move {
            let mut failures = Vec::new();
            let mut lifecycle = self.lifecycle.lock().await;

            match &self.kind {
                Kind::Plain(component) => {
                    if lifecycle.needs_cleanup() {
                        if let Err(e) = component.cleanup(&self.ctx).await {
                            warn!(component = %self.name, error = %e, "Component cleanup failed");
                            failures.push(format!("{}: {}", self.name, e));
                        }
                    }
                }
                Kind::Branching(branching) => {
                    for target in branching.targets() {
                        failures.extend(target.dispose().await);
                    }
                }
            }

            *lifecycle = Lifecycle::Disposed;
            failures
        })
    }
}

impl std::fmt::Debug for ComponentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentHandle")
            .field("name", &self.name)
            .field("branching", &self.is_branching())
            .field("state", &self.ctx)
            .finish()
    }
}
