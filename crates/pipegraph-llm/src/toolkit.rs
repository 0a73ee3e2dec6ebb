use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use pipegraph_core::error::{FlowError, Result};
use pipegraph_core::types::{ToolCall, ToolSchema, Value};

/// A callable toolkit function.
pub type ToolFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A named set of functions with the schemas offered to a provider.
#[derive(Clone)]
pub struct Toolkit {
    name: String,
    description: String,
    functions: HashMap<String, ToolFn>,
    schemas: Vec<ToolSchema>,
}

impl Toolkit {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            functions: HashMap::new(),
            schemas: Vec::new(),
        }
    }

    /// Add a function. Registering a name twice replaces the earlier one.
    pub fn function<F, Fut>(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        f: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let name = name.into();
        self.schemas.retain(|s| s.name != name);
        self.schemas.push(ToolSchema {
            name: name.clone(),
            description: description.into(),
            parameters,
        });
        let call: ToolFn = Arc::new(move |args: Value| -> BoxFuture<'static, Result<Value>> {
            Box::pin(f(args))
        });
        self.functions.insert(name, call);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Function schemas in registration order.
    pub fn schemas(&self) -> &[ToolSchema] {
        &self.schemas
    }

    pub fn contains(&self, function: &str) -> bool {
        self.functions.contains_key(function)
    }

    /// Call a function by name.
    pub async fn call(&self, function: &str, arguments: Value) -> Result<Value> {
        let f = self
            .functions
            .get(function)
            .ok_or_else(|| FlowError::UnknownTool(function.to_string()))?;
        f(arguments).await.map_err(|e| match e {
            e @ FlowError::ToolExecution { .. } => e,
            other => FlowError::ToolExecution {
                tool: function.to_string(),
                message: other.to_string(),
            },
        })
    }
}

impl std::fmt::Debug for Toolkit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolkit")
            .field("name", &self.name)
            .field(
                "functions",
                &self.schemas.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// The toolkits configured on one component.
///
/// Dispatch resolves a call name against each toolkit in the order they
/// were added; the first toolkit that has the function handles it.
#[derive(Debug, Clone, Default)]
pub struct ToolkitSet {
    toolkits: Vec<Toolkit>,
}

impl ToolkitSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, toolkit: Toolkit) {
        self.toolkits.push(toolkit);
    }

    pub fn is_empty(&self) -> bool {
        self.toolkits.is_empty()
    }

    pub fn toolkits(&self) -> &[Toolkit] {
        &self.toolkits
    }

    /// Every schema, toolkit by toolkit.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.toolkits
            .iter()
            .flat_map(|t| t.schemas().iter().cloned())
            .collect()
    }

    /// Run a provider-requested tool call.
    pub async fn dispatch(&self, call: &ToolCall) -> Result<Value> {
        let toolkit = self
            .toolkits
            .iter()
            .find(|t| t.contains(&call.name))
            .ok_or_else(|| FlowError::UnknownTool(call.name.clone()))?;
        debug!(toolkit = %toolkit.name(), tool = %call.name, call_id = %call.id, "Dispatching tool call");
        toolkit.call(&call.name, call.arguments.clone()).await
    }
}
