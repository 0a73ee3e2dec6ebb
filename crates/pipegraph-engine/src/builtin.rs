//! Built-in components available to every flow file.

use futures::future::BoxFuture;
use serde_json::json;

use pipegraph_core::error::{FlowError, Result};
use pipegraph_core::state::ComponentContext;
use pipegraph_core::traits::Component;
use pipegraph_core::types::Value;

use crate::expr::lookup_text;

/// Returns its input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Component for Passthrough {
    fn process<'a>(&'a self, input: Value, _ctx: &'a ComponentContext) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move { Ok(input) })
    }
}

/// Renders a string template against the input.
///
/// `{{input}}` is the whole input; `{{field}}` and `{{a.b}}` read object
/// fields. Strings are inserted as-is, other values as JSON. Placeholders
/// that do not resolve are left in place.
#[derive(Debug, Clone)]
pub struct Template {
    template: String,
}

impl Template {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn render(&self, input: &Value) -> String {
        render(&self.template, input)
    }
}

impl Component for Template {
    fn process<'a>(&'a self, input: Value, _ctx: &'a ComponentContext) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move { Ok(Value::String(self.render(&input))) })
    }
}

pub(crate) fn render(template: &str, input: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };
        let key = after[..close].trim();
        match lookup_text(input, key) {
            Some(text) => out.push_str(&text),
            None => out.push_str(&rest[open..open + 2 + close + 2]),
        }
        rest = &after[close + 2..];
    }

    out.push_str(rest);
    out
}

/// Counts invocations in a state cell and outputs the new count.
///
/// The cell is created at zero on `initialize`. Because calls into one
/// instance are serialized, concurrent invocations never lose an update.
#[derive(Debug, Clone)]
pub struct Counter {
    key: String,
    step: i64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            key: "count".to_string(),
            step: 1,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_step(mut self, step: i64) -> Self {
        self.step = step;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for Counter {
    fn initialize<'a>(&'a self, ctx: &'a ComponentContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            ctx.create_state(&self.key, json!(0));
            Ok(())
        })
    }

    fn process<'a>(&'a self, _input: Value, ctx: &'a ComponentContext) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let current = ctx
                .state_value(&self.key)
                .and_then(|v| v.as_i64())
                .ok_or_else(|| {
                    FlowError::component(format!("counter state '{}' is not an integer", self.key))
                })?;
            let next = current + self.step;
            ctx.update_state(&self.key, json!(next))?;
            Ok(json!(next))
        })
    }
}

/// Merges fixed fields into the input object.
///
/// Non-object input is wrapped as `{"input": <value>}` first. Fields
/// overwrite existing keys.
#[derive(Debug, Clone, Default)]
pub struct SetFields {
    fields: serde_json::Map<String, Value>,
}

impl SetFields {
    pub fn new(fields: serde_json::Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

impl Component for SetFields {
    fn process<'a>(&'a self, input: Value, _ctx: &'a ComponentContext) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let mut object = match input {
                Value::Object(map) => map,
                other => {
                    let mut map = serde_json::Map::new();
                    map.insert("input".to_string(), other);
                    map
                }
            };
            for (key, value) in &self.fields {
                object.insert(key.clone(), value.clone());
            }
            Ok(Value::Object(object))
        })
    }
}
