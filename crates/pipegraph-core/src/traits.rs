use futures::future::BoxFuture;

use crate::error::Result;
use crate::state::ComponentContext;
use crate::types::*;

/// Component: the polymorphic processing unit of a pipeline.
///
/// One instance is shared by every invocation of the pipeline it belongs
/// to. The engine serializes calls into a single instance, so `process`
/// may read-modify-write its own state without extra locking.
pub trait Component: Send + Sync + 'static {
    /// Consume one input and produce one output.
    ///
    /// `ctx` is this instance's own context; state belonging to other
    /// components is not reachable from here.
    fn process<'a>(&'a self, input: Value, ctx: &'a ComponentContext)
        -> BoxFuture<'a, Result<Value>>;

    /// Acquire resources. Runs once before the first `process` call.
    fn initialize<'a>(&'a self, ctx: &'a ComponentContext) -> BoxFuture<'a, Result<()>> {
        let _ = ctx;
        Box::pin(async { Ok(()) })
    }

    /// Release resources. Runs once on teardown if `initialize` succeeded.
    fn cleanup<'a>(&'a self, ctx: &'a ComponentContext) -> BoxFuture<'a, Result<()>> {
        let _ = ctx;
        Box::pin(async { Ok(()) })
    }
}

/// Completion provider: the language-model collaborator.
///
/// The engine never speaks a wire protocol itself; implementations own
/// transport, retries, and timeouts.
pub trait CompletionProvider: Send + Sync + 'static {
    fn invoke<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        params: &'a ModelParameters,
        tools: &'a [ToolSchema],
    ) -> BoxFuture<'a, Result<Completion>>;
}

/// Memory store: injected key/value persistence with search.
pub trait MemoryStore: Send + Sync + 'static {
    /// Insert or replace the value stored under `key`.
    fn add(&self, key: String, value: Value) -> BoxFuture<'_, Result<()>>;

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>>>;

    /// Entries relevant to `query`, most relevant first.
    fn search<'a>(&'a self, query: &'a str, limit: usize)
        -> BoxFuture<'a, Result<Vec<MemoryEntry>>>;

    /// Returns true if an entry was removed.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>>;
}
