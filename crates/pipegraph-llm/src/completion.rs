use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::{debug, warn};

use pipegraph_core::error::Result;
use pipegraph_core::state::ComponentContext;
use pipegraph_core::traits::{CompletionProvider, Component, MemoryStore};
use pipegraph_core::types::{ChatMessage, ModelParameters, Value};

use crate::toolkit::{Toolkit, ToolkitSet};

/// State key holding the most recent response text.
pub const LAST_RESPONSE: &str = "last_response";

/// A component that asks a completion provider to respond to its input.
///
/// The input becomes the user message: a string is used as-is, an object's
/// `prompt` field is used if it is a string, anything else is sent as JSON.
/// Tool calls in the response are dispatched to the configured toolkits and
/// their results fed back, for at most `max_tool_rounds` rounds.
///
/// Output is `{"text": <response>, "tool_calls": <number dispatched>}`.
pub struct CompletionComponent {
    provider: Arc<dyn CompletionProvider>,
    params: ModelParameters,
    system_prompt: Option<String>,
    toolkits: ToolkitSet,
    memory: Option<Arc<dyn MemoryStore>>,
    recall_limit: usize,
    remember: bool,
    max_tool_rounds: usize,
    recover_errors: bool,
}

impl CompletionComponent {
    pub fn new(provider: Arc<dyn CompletionProvider>, params: ModelParameters) -> Self {
        Self {
            provider,
            params,
            system_prompt: None,
            toolkits: ToolkitSet::new(),
            memory: None,
            recall_limit: 3,
            remember: false,
            max_tool_rounds: 4,
            recover_errors: false,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_toolkit(mut self, toolkit: Toolkit) -> Self {
        self.toolkits.add(toolkit);
        self
    }

    /// Recall up to `recall_limit` memory hits for each prompt.
    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>, recall_limit: usize) -> Self {
        self.memory = Some(memory);
        self.recall_limit = recall_limit;
        self
    }

    /// Store each prompt and its response in memory after a successful call.
    pub fn remembering(mut self) -> Self {
        self.remember = true;
        self
    }

    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    /// Return `{"error": .., "kind": ..}` instead of failing the pipeline.
    pub fn recovering_errors(mut self) -> Self {
        self.recover_errors = true;
        self
    }

    async fn respond(&self, input: &Value, ctx: &ComponentContext) -> Result<Value> {
        let prompt = prompt_text(input);
        let mut messages = Vec::new();
        if let Some(system) = &self.system_prompt {
            messages.push(ChatMessage::system(system.clone()));
        }
        if let Some(memory) = &self.memory {
            let hits = memory.search(&prompt, self.recall_limit).await?;
            if !hits.is_empty() {
                let mut recalled = String::from("Relevant memory:\n");
                for hit in &hits {
                    recalled.push_str(&format!("- {}: {}\n", hit.key, display(&hit.value)));
                }
                messages.push(ChatMessage::system(recalled));
            }
        }
        messages.push(ChatMessage::user(prompt.clone()));

        let schemas = self.toolkits.schemas();
        let mut dispatched = 0usize;
        let mut rounds = 0usize;

        let text = loop {
            let completion = self
                .provider
                .invoke(&messages, &self.params, &schemas)
                .await?;
            if completion.tool_calls.is_empty() {
                break completion.text;
            }
            if rounds >= self.max_tool_rounds {
                warn!(
                    component = %ctx.name(),
                    max_rounds = self.max_tool_rounds,
                    "Tool round limit reached, ignoring further tool calls"
                );
                break completion.text;
            }
            rounds += 1;

            let calls = completion.tool_calls;
            messages.push(ChatMessage::assistant_with_tool_calls(
                completion.text,
                calls.clone(),
            ));
            for call in &calls {
                let result = self.toolkits.dispatch(call).await?;
                messages.push(ChatMessage::tool_result(call.id.clone(), display(&result)));
                dispatched += 1;
            }
            debug!(component = %ctx.name(), round = rounds, dispatched, "Tool round complete");
        };

        ctx.update_state(LAST_RESPONSE, json!(text))?;

        if self.remember {
            if let Some(memory) = &self.memory {
                memory.add(prompt, json!(text)).await?;
            }
        }

        Ok(json!({ "text": text, "tool_calls": dispatched }))
    }
}

impl Component for CompletionComponent {
    fn initialize<'a>(&'a self, ctx: &'a ComponentContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            ctx.create_state(LAST_RESPONSE, Value::Null);
            Ok(())
        })
    }

    fn process<'a>(&'a self, input: Value, ctx: &'a ComponentContext) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            match self.respond(&input, ctx).await {
                Ok(output) => Ok(output),
                Err(e) if self.recover_errors => {
                    warn!(component = %ctx.name(), error = %e, "Completion failed, returning error value");
                    Ok(json!({ "error": e.to_string(), "kind": e.kind() }))
                }
                Err(e) => Err(e),
            }
        })
    }
}

fn prompt_text(input: &Value) -> String {
    match input {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("prompt") {
            Some(Value::String(s)) => s.clone(),
            _ => input.to_string(),
        },
        other => other.to_string(),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipegraph_core::error::FlowError;
    use pipegraph_core::types::Role;
    use pipegraph_test_utils::{InMemoryStore, MockProvider};

    fn params() -> ModelParameters {
        ModelParameters {
            model: "test-model".into(),
            ..Default::default()
        }
    }

    async fn run(component: &CompletionComponent, input: Value) -> (Result<Value>, ComponentContext) {
        let ctx = ComponentContext::new("llm");
        component.initialize(&ctx).await.unwrap();
        let out = component.process(input, &ctx).await;
        (out, ctx)
    }

    fn echo_kit() -> Toolkit {
        Toolkit::new("util", "Utilities").function("echo", "Echo back", json!({}), |args| async move {
            Ok(args)
        })
    }

    #[test]
    fn prompt_extraction() {
        assert_eq!(prompt_text(&json!("hi")), "hi");
        assert_eq!(prompt_text(&json!({"prompt": "p", "x": 1})), "p");
        assert_eq!(prompt_text(&json!({"x": 1})), r#"{"x":1}"#);
        assert_eq!(prompt_text(&json!(3)), "3");
    }

    #[tokio::test]
    async fn plain_response() {
        let provider = MockProvider::new().reply("hello there");
        let component = CompletionComponent::new(Arc::new(provider.clone()), params())
            .with_system_prompt("be brief");

        let (out, ctx) = run(&component, json!("hello")).await;
        assert_eq!(out.unwrap(), json!({"text": "hello there", "tool_calls": 0}));
        assert_eq!(ctx.state_value(LAST_RESPONSE), Some(json!("hello there")));

        let calls = provider.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].model, "test-model");
        assert_eq!(calls[0].messages.len(), 2);
        assert_eq!(calls[0].messages[0].role, Role::System);
        assert_eq!(calls[0].messages[1].content, "hello");
    }

    #[tokio::test]
    async fn tool_calls_are_dispatched_and_fed_back() {
        let provider = MockProvider::new()
            .tool_call("c1", "echo", json!({"v": 1}))
            .reply("done");
        let component =
            CompletionComponent::new(Arc::new(provider.clone()), params()).with_toolkit(echo_kit());

        let (out, _) = run(&component, json!("go")).await;
        assert_eq!(out.unwrap(), json!({"text": "done", "tool_calls": 1}));

        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].tools, vec!["echo".to_string()]);
        let request = &calls[1].messages[calls[1].messages.len() - 2];
        assert_eq!(request.role, Role::Assistant);
        assert_eq!(request.tool_calls.len(), 1);
        assert_eq!(request.tool_calls[0].id, "c1");
        assert_eq!(request.tool_calls[0].name, "echo");
        assert_eq!(request.tool_calls[0].arguments, json!({"v": 1}));
        let last = calls[1].messages.last().unwrap();
        assert_eq!(last.role, Role::Tool);
        assert_eq!(last.tool_call_id.as_deref(), Some("c1"));
        assert_eq!(last.content, r#"{"v":1}"#);
    }

    #[tokio::test]
    async fn tool_rounds_are_bounded() {
        let provider = MockProvider::new()
            .tool_call("c1", "echo", json!(1))
            .tool_call("c2", "echo", json!(2))
            .tool_call("c3", "echo", json!(3));
        let component = CompletionComponent::new(Arc::new(provider.clone()), params())
            .with_toolkit(echo_kit())
            .with_max_tool_rounds(2);

        let (out, _) = run(&component, json!("loop")).await;
        assert_eq!(out.unwrap()["tool_calls"], json!(2));
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn unknown_tool_fails() {
        let provider = MockProvider::new().tool_call("c1", "missing", json!({}));
        let component =
            CompletionComponent::new(Arc::new(provider), params()).with_toolkit(echo_kit());
        let (out, _) = run(&component, json!("x")).await;
        assert!(matches!(out, Err(FlowError::UnknownTool(name)) if name == "missing"));
    }

    #[tokio::test]
    async fn provider_failure_recovered_as_value() {
        let provider = MockProvider::new().fail("rate limited");
        let component = CompletionComponent::new(Arc::new(provider), params()).recovering_errors();
        let (out, ctx) = run(&component, json!("x")).await;
        let out = out.unwrap();
        assert_eq!(out["kind"], json!("provider"));
        assert!(out["error"].as_str().unwrap().contains("rate limited"));
        assert_eq!(ctx.state_value(LAST_RESPONSE), Some(Value::Null));
    }

    #[tokio::test]
    async fn memory_recall_and_remember() {
        let store = InMemoryStore::new();
        store
            .add("favourite colour".into(), json!("teal"))
            .await
            .unwrap();
        let provider = MockProvider::new().reply("teal, I recall");
        let component = CompletionComponent::new(Arc::new(provider.clone()), params())
            .with_memory(Arc::new(store.clone()), 5)
            .remembering();

        let (out, _) = run(&component, json!({"prompt": "colour"})).await;
        assert_eq!(out.unwrap()["text"], json!("teal, I recall"));

        let messages = &provider.calls()[0].messages;
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.contains("favourite colour: teal"));
        assert_eq!(store.get("colour").await.unwrap(), Some(json!("teal, I recall")));
    }
}
