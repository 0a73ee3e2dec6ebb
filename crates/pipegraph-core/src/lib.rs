//! Core types, traits, and error hierarchy for pipegraph.
//!
//! Everything the engine and its collaborators share lives here: the
//! `Component` contract, observable `StateCell`s, collaborator traits for
//! completion providers and memory stores, the event bus, and flow-file
//! configuration.

pub mod config;
pub mod error;
pub mod event;
pub mod state;
pub mod traits;
pub mod types;

pub use config::FlowConfig;
pub use error::{FlowError, Result};
pub use event::{ErrorChannel, EventBus, FlowEvent};
pub use state::{ComponentContext, StateCell, Subscription};
pub use traits::{Component, CompletionProvider, MemoryStore};
pub use types::*;
