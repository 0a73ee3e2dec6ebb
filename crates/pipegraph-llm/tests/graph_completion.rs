use std::sync::Arc;

use serde_json::json;

use pipegraph_core::error::FlowError;
use pipegraph_core::types::ModelParameters;
use pipegraph_engine::{BranchingComponent, Graph, Predicate, Template};
use pipegraph_llm::{CompletionComponent, Toolkit, LAST_RESPONSE};
use pipegraph_test_utils::MockProvider;

#[tokio::test]
async fn test_completion_component_in_pipeline() {
    let provider = MockProvider::new()
        .tool_call("c1", "lookup", json!({"id": 42}))
        .reply("order 42 shipped");
    let lookup = Toolkit::new("orders", "Order lookups").function(
        "lookup",
        "Find an order",
        json!({"type": "object"}),
        |args| async move { Ok(json!({"id": args["id"], "status": "shipped"})) },
    );
    let llm = CompletionComponent::new(Arc::new(provider.clone()), ModelParameters::default())
        .with_toolkit(lookup);

    let mut graph = Graph::new();
    graph.create_pipeline("chat").unwrap();
    graph
        .add_component("chat", "prompt", Template::new("Where is order {{order}}?"))
        .unwrap();
    graph.add_component("chat", "llm", llm).unwrap();
    graph.compile().unwrap();

    let result = graph.execute("chat", json!({"order": 42})).await.unwrap();
    assert_eq!(result.result, json!({"text": "order 42 shipped", "tool_calls": 1}));
    assert_eq!(
        graph.state_value("chat", "llm", LAST_RESPONSE),
        Some(json!("order 42 shipped"))
    );
    assert_eq!(
        provider.calls()[0].messages[0].content,
        "Where is order 42?"
    );
}

#[tokio::test]
async fn test_provider_failure_surfaces_as_execution_error() {
    let provider = MockProvider::new().fail("upstream 503");
    let llm = CompletionComponent::new(Arc::new(provider), ModelParameters::default());

    let router = BranchingComponent::new()
        .branch("ask", Predicate::expr("question").unwrap(), "answer", llm)
        .default_branch("ignore", Template::new("nothing to do"));
    let mut graph = Graph::new();
    graph.create_pipeline("inbox").unwrap();
    graph.add_branching("inbox", "route", router).unwrap();
    graph.compile().unwrap();

    let skipped = graph.execute("inbox", json!({"note": "hi"})).await.unwrap();
    assert_eq!(skipped.result, json!("nothing to do"));

    let err = graph
        .execute("inbox", json!({"question": "why?"}))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Execution { ref component, .. } if component == "route"));
    assert!(matches!(err.root_cause(), FlowError::Provider(msg) if msg == "upstream 503"));
}
