use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FlowError, Result};
use crate::types::Value;

/// Top-level flow file: engine settings plus the declared pipelines.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum length of a chain of cross-pipeline dispatches.
    #[serde(default = "default_max_dispatch_depth")]
    pub max_dispatch_depth: usize,
    /// Capacity of the broadcast channel backing the event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_dispatch_depth: default_max_dispatch_depth(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_max_dispatch_depth() -> usize {
    8
}

fn default_event_capacity() -> usize {
    256
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. `pipegraph=debug`.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

pub fn default_log_filter() -> String {
    "pipegraph=info,warn".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default)]
    pub components: Vec<ComponentConfig>,
}

/// A component declaration. `kind` selects the factory; any keys other
/// than the named fields are collected into `options`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub name: String,
    pub kind: String,
    /// Branches, for `router` components.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<BranchConfig>,
    /// Fallback target, for `router` components.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Box<ComponentConfig>>,
    #[serde(flatten)]
    pub options: serde_json::Map<String, Value>,
}

impl ComponentConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            branches: vec![],
            default: None,
            options: serde_json::Map::new(),
        }
    }

    /// Set an option value.
    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// String option, if present and a string.
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }

    /// String option that must be present.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.option_str(key).ok_or_else(|| {
            FlowError::Config(format!(
                "component '{}' ({}) requires string option '{}'",
                self.name, self.kind, key
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchConfig {
    pub label: String,
    /// Predicate expression over the input, e.g. `priority == "high"`.
    pub when: String,
    pub target: ComponentConfig,
}

/// A cross-pipeline connection. Endpoints are written `pipeline.component`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub from: String,
    pub to: String,
}

impl ConnectionConfig {
    /// Split both endpoints into `(pipeline, component)` pairs.
    pub fn endpoints(&self) -> Result<((&str, &str), (&str, &str))> {
        Ok((split_endpoint(&self.from)?, split_endpoint(&self.to)?))
    }
}

fn split_endpoint(endpoint: &str) -> Result<(&str, &str)> {
    match endpoint.split_once('.') {
        Some((pipeline, component)) if !pipeline.is_empty() && !component.is_empty() => {
            Ok((pipeline.trim(), component.trim()))
        }
        _ => Err(FlowError::Config(format!(
            "connection endpoint '{}' must be written 'pipeline.component'",
            endpoint
        ))),
    }
}

impl FlowConfig {
    /// Load a flow file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading flow file");
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse a flow from TOML text, with env var expansion.
    pub fn from_toml(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))
    }

    /// Effective log filter.
    pub fn log_filter(&self) -> String {
        self.log
            .as_ref()
            .map(|l| l.filter.clone())
            .unwrap_or_else(default_log_filter)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FLOW: &str = r#"
[engine]
max_dispatch_depth = 3

[log]
filter = "pipegraph=debug"

[[pipelines]]
name = "intake"

[[pipelines.components]]
name = "greet"
kind = "template"
template = "Hello {{input}}"

[[pipelines.components]]
name = "route"
kind = "router"

[[pipelines.components.branches]]
label = "urgent"
when = 'priority == "high"'
target = { name = "page", kind = "template", template = "PAGE {{input}}" }

[pipelines.components.default]
name = "queue"
kind = "passthrough"

[[pipelines]]
name = "audit"

[[pipelines.components]]
name = "log"
kind = "counter"

[[connections]]
from = "intake.greet"
to = "audit.log"
"#;

    #[test]
    fn parses_full_flow() {
        let flow = FlowConfig::from_toml(FLOW).unwrap();
        assert_eq!(flow.engine.max_dispatch_depth, 3);
        assert_eq!(flow.engine.event_capacity, 256);
        assert_eq!(flow.log_filter(), "pipegraph=debug");
        assert_eq!(flow.pipelines.len(), 2);

        let greet = &flow.pipelines[0].components[0];
        assert_eq!(greet.kind, "template");
        assert_eq!(greet.option_str("template"), Some("Hello {{input}}"));
        assert!(!greet.options.contains_key("name"));

        let route = &flow.pipelines[0].components[1];
        assert_eq!(route.branches.len(), 1);
        assert_eq!(route.branches[0].label, "urgent");
        assert_eq!(route.branches[0].target.name, "page");
        assert_eq!(route.default.as_ref().unwrap().kind, "passthrough");

        let ((sp, sc), (tp, tc)) = flow.connections[0].endpoints().unwrap();
        assert_eq!((sp, sc, tp, tc), ("intake", "greet", "audit", "log"));
    }

    #[test]
    fn defaults_apply_to_empty_file() {
        let flow = FlowConfig::from_toml("").unwrap();
        assert_eq!(flow.engine.max_dispatch_depth, 8);
        assert!(flow.pipelines.is_empty());
        assert_eq!(flow.log_filter(), "pipegraph=info,warn");
    }

    #[test]
    fn bad_endpoint_is_rejected() {
        let conn = ConnectionConfig {
            from: "nodot".into(),
            to: "a.b".into(),
        };
        assert!(matches!(conn.endpoints(), Err(FlowError::Config(_))));
    }

    #[test]
    fn require_str_reports_component() {
        let c = ComponentConfig::new("greet", "template");
        let err = c.require_str("template").unwrap_err();
        assert!(err.to_string().contains("greet"));
    }

    #[test]
    fn env_vars_expand_and_unset_vars_survive() {
        std::env::set_var("PIPEGRAPH_TEST_GREETING", "Howdy");
        let expanded = expand_env_vars("a=${PIPEGRAPH_TEST_GREETING} b=${PIPEGRAPH_TEST_UNSET_VAR}");
        assert_eq!(expanded, "a=Howdy b=${PIPEGRAPH_TEST_UNSET_VAR}");
    }

    #[test]
    fn load_missing_file() {
        let err = FlowConfig::load(Path::new("/nonexistent/flow.toml")).unwrap_err();
        assert!(matches!(err, FlowError::ConfigNotFound(_)));
    }

    #[test]
    fn load_from_file() {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(FLOW.as_bytes()).expect("write toml");
        let flow = FlowConfig::load(tmp.path()).expect("load flow");
        assert_eq!(flow.connections.len(), 1);
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = FlowConfig::from_toml("[[pipelines]\nname=").unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
    }
}
