use std::io::Write;

use serde_json::json;

use pipegraph_core::config::FlowConfig;
use pipegraph_core::error::FlowError;
use pipegraph_engine::ComponentFactory;

const FLOW: &str = r#"
[engine]
max_dispatch_depth = 4
event_capacity = 64

[log]
filter = "pipegraph=debug"

[[pipelines]]
name = "support"

[[pipelines.components]]
name = "stamp"
kind = "set"
fields = { team = "${PIPEGRAPH_TEST_TEAM}" }

[[pipelines.components]]
name = "triage"
kind = "router"

[[pipelines.components.branches]]
label = "billing"
when = 'topic contains "invoice"'
target = { name = "billing", kind = "template", template = "billing/{{team}}" }

[[pipelines.components.branches]]
label = "outage"
when = 'topic matches "(?i)down|outage"'
target = { name = "oncall", kind = "template", template = "oncall/{{team}}" }

[pipelines.components.default]
name = "general"
kind = "template"
template = "general/{{team}}"

[[pipelines]]
name = "metrics"

[[pipelines.components]]
name = "tickets"
kind = "counter"
step = 1

[[connections]]
from = "support.stamp"
to = "metrics.tickets"
"#;

fn write_flow(content: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(content.as_bytes()).expect("write flow");
    tmp
}

#[tokio::test]
async fn test_load_build_and_run_flow_file() {
    std::env::set_var("PIPEGRAPH_TEST_TEAM", "blue");
    let tmp = write_flow(FLOW);

    let config = FlowConfig::load(tmp.path()).expect("load flow");
    assert_eq!(config.engine.max_dispatch_depth, 4);
    assert_eq!(config.engine.event_capacity, 64);
    assert_eq!(config.log_filter(), "pipegraph=debug");
    assert_eq!(config.pipelines.len(), 2);
    assert_eq!(config.connections.len(), 1);

    let mut graph = ComponentFactory::with_builtins()
        .build(&config)
        .expect("build graph");
    graph.compile().expect("compile");

    let cases = [
        ("invoice overdue", Some("billing"), "billing/blue"),
        ("site is DOWN", Some("outage"), "oncall/blue"),
        ("hello", None, "general/blue"),
    ];
    for (topic, branch, expected) in cases {
        let result = graph
            .execute_and_await("support", json!({ "topic": topic }))
            .await
            .expect("execute");
        assert_eq!(result.branch.as_deref(), branch, "topic {topic}");
        assert_eq!(result.result, json!(expected));
    }

    assert_eq!(
        graph.state_value("metrics", "tickets", "count"),
        Some(json!(3))
    );
    graph.shutdown().await.expect("shutdown");
}

#[test]
fn test_defaults_when_sections_missing() {
    let config = FlowConfig::from_toml("").expect("parse empty flow");
    assert_eq!(config.engine.max_dispatch_depth, 8);
    assert_eq!(config.engine.event_capacity, 256);
    assert_eq!(config.log_filter(), "pipegraph=info,warn");
    assert!(config.pipelines.is_empty());
}

#[test]
fn test_missing_flow_file() {
    let err = FlowConfig::load(std::path::Path::new("/nonexistent/flow.toml")).unwrap_err();
    assert!(matches!(err, FlowError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_toml_is_config_error() {
    let tmp = write_flow("[[pipelines]\nname = ");
    let err = FlowConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, FlowError::Config(_)));
}

#[test]
fn test_bad_connection_endpoint() {
    let config = FlowConfig::from_toml(
        r#"
[[pipelines]]
name = "a"
[[pipelines.components]]
name = "x"
kind = "passthrough"

[[connections]]
from = "a"
to = "a.x"
"#,
    )
    .unwrap();
    let err = ComponentFactory::with_builtins().build(&config).unwrap_err();
    assert!(matches!(err, FlowError::Config(msg) if msg.contains("pipeline.component")));
}

#[test]
fn test_validation_reports_every_problem() {
    let config = FlowConfig::from_toml(
        r#"
[[pipelines]]
name = "empty"

[[pipelines]]
name = "also_empty"
"#,
    )
    .unwrap();
    let mut graph = ComponentFactory::with_builtins().build(&config).unwrap();
    let err = graph.compile().unwrap_err();
    match err {
        FlowError::GraphValidation { violations } => assert_eq!(violations.len(), 2),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!graph.is_compiled());
}
