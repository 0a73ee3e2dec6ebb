//! Completion-provider backed components for pipegraph.
//!
//! Providers and memory stores are injected through the traits in
//! `pipegraph-core`; this crate never speaks a provider wire protocol.

pub mod completion;
pub mod toolkit;

pub use completion::{CompletionComponent, LAST_RESPONSE};
pub use toolkit::{ToolFn, Toolkit, ToolkitSet};
