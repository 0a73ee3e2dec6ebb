pub mod branch;
pub mod builtin;
mod executor;
pub mod expr;
pub mod factory;
pub mod graph;
pub mod handle;
pub mod pipeline;

pub use branch::{BranchingComponent, Predicate};
pub use builtin::{Counter, Passthrough, SetFields, Template};
pub use expr::Expr;
pub use factory::{ComponentFactory, Constructor};
pub use graph::{Connection, Graph, GraphState};
pub use handle::ComponentHandle;
pub use pipeline::Pipeline;
