//! Shared test doubles for pipegraph crates.
//!
//! Components here are cheap to clone; clones share their recorded data, so
//! a test can keep one copy and hand another to a graph.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;

use pipegraph_core::error::{FlowError, Result};
use pipegraph_core::state::ComponentContext;
use pipegraph_core::traits::{CompletionProvider, Component, MemoryStore};
use pipegraph_core::types::{
    ChatMessage, Completion, MemoryEntry, ModelParameters, ToolCall, ToolSchema, Value,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Components ─────────────────────────────────────────────────

/// Records every input it sees and passes it through.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<Value>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> Vec<Value> {
        lock(&self.seen).clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.seen).len()
    }
}

impl Component for Recorder {
    fn process<'a>(&'a self, input: Value, _ctx: &'a ComponentContext) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            lock(&self.seen).push(input.clone());
            Ok(input)
        })
    }
}

/// Always fails in `process`.
#[derive(Clone)]
pub struct Failing {
    message: String,
}

impl Failing {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Component for Failing {
    fn process<'a>(&'a self, _input: Value, _ctx: &'a ComponentContext) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move { Err(FlowError::component(self.message.clone())) })
    }
}

/// Sleeps, then passes its input through.
#[derive(Clone)]
pub struct Sleeper {
    delay: Duration,
}

impl Sleeper {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn millis(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }
}

impl Component for Sleeper {
    fn process<'a>(&'a self, input: Value, _ctx: &'a ComponentContext) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(input)
        })
    }
}

/// Counter that yields between reading and writing its state, so lost
/// updates show up if calls into one instance are not serialized.
#[derive(Clone, Default)]
pub struct SlowCounter;

impl Component for SlowCounter {
    fn initialize<'a>(&'a self, ctx: &'a ComponentContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            ctx.create_state("count", json!(0));
            Ok(())
        })
    }

    fn process<'a>(&'a self, _input: Value, ctx: &'a ComponentContext) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let current = ctx
                .state_value("count")
                .and_then(|v| v.as_i64())
                .unwrap_or_default();
            tokio::task::yield_now().await;
            ctx.update_state("count", json!(current + 1))?;
            Ok(json!(current + 1))
        })
    }
}

/// Counts lifecycle calls. `initialize` can be made to fail a number of
/// times before it succeeds.
#[derive(Clone, Default)]
pub struct LifecycleTracker {
    initialized: Arc<AtomicUsize>,
    processed: Arc<AtomicUsize>,
    cleaned: Arc<AtomicUsize>,
    init_failures: Arc<AtomicUsize>,
    cleanup_fails: bool,
}

impl LifecycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `n` calls to `initialize`.
    pub fn failing_init(self, n: usize) -> Self {
        self.init_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn failing_cleanup(mut self) -> Self {
        self.cleanup_fails = true;
        self
    }

    /// Successful `initialize` calls.
    pub fn initialized(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn cleaned(&self) -> usize {
        self.cleaned.load(Ordering::SeqCst)
    }
}

impl Component for LifecycleTracker {
    fn initialize<'a>(&'a self, _ctx: &'a ComponentContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let remaining = self.init_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.init_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(FlowError::component("initialize failed"));
            }
            self.initialized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn process<'a>(&'a self, input: Value, _ctx: &'a ComponentContext) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            self.processed.fetch_add(1, Ordering::SeqCst);
            Ok(input)
        })
    }

    fn cleanup<'a>(&'a self, _ctx: &'a ComponentContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
            if self.cleanup_fails {
                return Err(FlowError::component("cleanup failed"));
            }
            Ok(())
        })
    }
}

// ── Completion provider ────────────────────────────────────────

/// One recorded provider call.
#[derive(Debug, Clone)]
pub struct ProviderCall {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub tools: Vec<String>,
}

/// Completion provider that replays a script of responses in order.
///
/// Once the script runs out every call fails with a `Provider` error.
#[derive(Clone, Default)]
pub struct MockProvider {
    script: Arc<Mutex<VecDeque<Result<Completion>>>>,
    calls: Arc<Mutex<Vec<ProviderCall>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plain text response.
    pub fn reply(self, text: impl Into<String>) -> Self {
        lock(&self.script).push_back(Ok(Completion::text(text)));
        self
    }

    /// Queue a response that requests one tool call.
    pub fn tool_call(self, id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        lock(&self.script).push_back(Ok(Completion {
            text: String::new(),
            tool_calls: vec![ToolCall {
                id: id.into(),
                name: name.into(),
                arguments,
            }],
        }));
        self
    }

    /// Queue a provider failure.
    pub fn fail(self, message: impl Into<String>) -> Self {
        lock(&self.script).push_back(Err(FlowError::Provider(message.into())));
        self
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

impl CompletionProvider for MockProvider {
    fn invoke<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        params: &'a ModelParameters,
        tools: &'a [ToolSchema],
    ) -> BoxFuture<'a, Result<Completion>> {
        Box::pin(async move {
            lock(&self.calls).push(ProviderCall {
                messages: messages.to_vec(),
                model: params.model.clone(),
                tools: tools.iter().map(|t| t.name.clone()).collect(),
            });
            lock(&self.script)
                .pop_front()
                .unwrap_or_else(|| Err(FlowError::Provider("mock script exhausted".into())))
        })
    }
}

// ── Memory store ───────────────────────────────────────────────

/// In-memory `MemoryStore`. Search is a case-insensitive substring match
/// over keys and values, in key order.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    entries: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

impl MemoryStore for InMemoryStore {
    fn add(&self, key: String, value: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            lock(&self.entries).insert(key, value);
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>>> {
        Box::pin(async move { Ok(lock(&self.entries).get(key).cloned()) })
    }

    fn search<'a>(&'a self, query: &'a str, limit: usize) -> BoxFuture<'a, Result<Vec<MemoryEntry>>> {
        Box::pin(async move {
            let needle = query.to_lowercase();
            let hits = lock(&self.entries)
                .iter()
                .filter(|(key, value)| {
                    let text = match value {
                        Value::String(s) => s.to_lowercase(),
                        other => other.to_string().to_lowercase(),
                    };
                    key.to_lowercase().contains(&needle) || text.contains(&needle)
                })
                .take(limit)
                .map(|(key, value)| MemoryEntry {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect();
            Ok(hits)
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { Ok(lock(&self.entries).remove(key).is_some()) })
    }
}
