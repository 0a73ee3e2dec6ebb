use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Registration / compile errors
    #[error("Duplicate {kind} name: {name}")]
    DuplicateName { kind: &'static str, name: String },

    #[error("Unknown reference: {0}")]
    UnknownReference(String),

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),

    #[error("Graph validation failed: {}", .violations.join("; "))]
    GraphValidation { violations: Vec<String> },

    #[error("Graph is not compiled")]
    NotCompiled,

    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(String),

    // Runtime errors
    #[error("Component '{component}' in pipeline '{pipeline}' failed: {source}")]
    Execution {
        pipeline: String,
        component: String,
        #[source]
        source: Box<FlowError>,
    },

    #[error("No branch matched in '{component}' and no default branch is set")]
    NoBranchMatched { component: String },

    #[error("Unknown state key '{key}' on component '{component}'")]
    UnknownStateKey { component: String, key: String },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Component error: {0}")]
    Component(String),

    #[error("Component '{0}' has been disposed")]
    Disposed(String),

    #[error("Teardown failed: {}", .failures.join("; "))]
    Teardown { failures: Vec<String> },

    // Collaborator errors
    #[error("Completion provider error: {0}")]
    Provider(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Memory store error: {0}")]
    Memory(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Shorthand for a free-form failure raised inside `process`.
    pub fn component(message: impl Into<String>) -> Self {
        Self::Component(message.into())
    }

    /// Stable snake_case identifier for logs, events, and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateName { .. } => "duplicate_name",
            Self::UnknownReference(_) => "unknown_reference",
            Self::InvalidConnection(_) => "invalid_connection",
            Self::GraphValidation { .. } => "graph_validation",
            Self::NotCompiled => "not_compiled",
            Self::UnknownPipeline(_) => "unknown_pipeline",
            Self::Execution { .. } => "execution",
            Self::NoBranchMatched { .. } => "no_branch_matched",
            Self::UnknownStateKey { .. } => "unknown_state_key",
            Self::UnknownTool(_) => "unknown_tool",
            Self::Component(_) => "component",
            Self::Disposed(_) => "disposed",
            Self::Teardown { .. } => "teardown",
            Self::Provider(_) => "provider",
            Self::ToolExecution { .. } => "tool_execution",
            Self::Memory(_) => "memory",
            Self::Config(_) => "config",
            Self::ConfigNotFound(_) => "config_not_found",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    /// The innermost error beneath any `Execution` wrappers.
    ///
    /// A failure inside a branch target is wrapped twice (once for the
    /// target, once for the branching component), so callers that only care
    /// about the original cause should match on this.
    pub fn root_cause(&self) -> &FlowError {
        let mut current = self;
        while let Self::Execution { source, .. } = current {
            current = source;
        }
        current
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_lists_every_violation() {
        let err = FlowError::GraphValidation {
            violations: vec!["pipeline 'a' is empty".into(), "dangling connection".into()],
        };
        assert_eq!(
            err.to_string(),
            "Graph validation failed: pipeline 'a' is empty; dangling connection"
        );
    }

    #[test]
    fn root_cause_unwraps_nested_execution() {
        let err = FlowError::Execution {
            pipeline: "main".into(),
            component: "router".into(),
            source: Box::new(FlowError::Execution {
                pipeline: "main".into(),
                component: "handler".into(),
                source: Box::new(FlowError::component("boom")),
            }),
        };
        assert_eq!(err.kind(), "execution");
        assert!(matches!(err.root_cause(), FlowError::Component(m) if m == "boom"));
    }

    #[test]
    fn io_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: FlowError = io.into();
        assert_eq!(err.kind(), "io");
    }

    #[test]
    fn invalid_connection_has_its_own_kind() {
        let err = FlowError::InvalidConnection("a.x -> a.y".into());
        assert_eq!(err.kind(), "invalid_connection");
        assert_eq!(err.to_string(), "Invalid connection: a.x -> a.y");
    }
}
