//! End-to-end gateway scenarios over embedded services.
//!
//! These exercise the public surface the façade consumes: orchestrated
//! lifecycle, the merged catalog, routed invocation, and state subscription.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use mcphub::protocol::types::{
    ContentBlock, InitializeResult, ParameterKind, ServerInfo, ToolParameter,
};
use mcphub::{
    CallToolRequest, CallToolResult, EmbeddedService, GatewayError, McpAgent, ServiceConfig,
    ServiceState, Tool,
};

// ─── Test service ───────────────────────────────────────────────────────────

/// Embedded backend exposing named tools; each call echoes the `text`
/// argument, or reports an application error for the `broken` tool.
struct EchoService {
    backend_name: String,
    tools: Vec<String>,
}

impl EchoService {
    fn new(backend_name: &str, tools: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            backend_name: backend_name.to_string(),
            tools: tools.iter().map(|s| s.to_string()).collect(),
        })
    }
}

#[async_trait]
impl EmbeddedService for EchoService {
    async fn initialize(&self) -> Result<InitializeResult, GatewayError> {
        Ok(InitializeResult {
            server_info: ServerInfo {
                name: self.backend_name.clone(),
                version: "1.0.0".into(),
            },
            ..InitializeResult::default()
        })
    }

    async fn list_tools(&self) -> Result<Vec<Tool>, GatewayError> {
        Ok(self
            .tools
            .iter()
            .map(|name| Tool {
                name: name.clone(),
                description: format!("{name} ({})", self.backend_name),
                input_schema: ToolParameter::object([(
                    "text".to_string(),
                    ToolParameter::of_kind(ParameterKind::String),
                )]),
            })
            .collect())
    }

    async fn call_tool(&self, request: CallToolRequest) -> Result<CallToolResult, GatewayError> {
        if !self.tools.contains(&request.name) {
            return Err(GatewayError::ToolNotFound { name: request.name });
        }
        if request.name == "broken" {
            return Ok(CallToolResult::error_text("backend says no"));
        }
        let text = request
            .arguments
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.backend_name)
            .to_string();
        Ok(CallToolResult::text(text))
    }
}

fn config(id: &str) -> ServiceConfig {
    ServiceConfig {
        id: id.to_string(),
        name: format!("{id} display"),
        description: None,
        transport: mcphub::config::TransportConfig::Embedded,
        auto_start: true,
    }
}

fn agent(services: Vec<(&str, Arc<EchoService>)>) -> McpAgent {
    let configs = services.iter().map(|(id, _)| config(id)).collect();
    let embedded: HashMap<String, Arc<dyn EmbeddedService>> = services
        .into_iter()
        .map(|(id, svc)| (id.to_string(), svc as Arc<dyn EmbeddedService>))
        .collect();
    McpAgent::new(configs, embedded).unwrap()
}

// ─── Scenarios ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn echo_round_trip_through_the_gateway() {
    let agent = agent(vec![("echo-svc", EchoService::new("echo-backend", &["echo"]))]);
    let aggregator = agent.aggregator();

    agent.start("echo-svc").await.unwrap();

    let tools = aggregator.get_all_tools().await;
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].tool.name, "echo");
    assert_eq!(tools[0].service_id, "echo-svc");
    assert_eq!(tools[0].service_name, "echo-svc display");

    let outcome = aggregator
        .call_tool(CallToolRequest::new(
            "echo",
            serde_json::json!({"text": "hi"}),
        ))
        .await
        .unwrap();

    assert_eq!(outcome.service_id, "echo-svc");
    assert!(!outcome.result.is_error);
    assert_eq!(
        outcome.result.content,
        vec![ContentBlock::Text { text: "hi".into() }]
    );
}

#[tokio::test]
async fn catalog_excludes_services_not_running() {
    let agent = agent(vec![
        ("up", EchoService::new("up", &["a"])),
        ("down", EchoService::new("down", &["b"])),
    ]);
    let aggregator = agent.aggregator();

    agent.start("up").await.unwrap();

    let tools = aggregator.get_all_tools().await;
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].service_id, "up");

    // Once the second service reaches RUNNING its tools appear, in
    // registration order.
    agent.start("down").await.unwrap();
    let tools = aggregator.get_all_tools().await;
    assert_eq!(tools.len(), 2);
    assert_eq!(tools[0].service_id, "up");
    assert_eq!(tools[1].service_id, "down");

    // And a stop removes them again.
    agent.stop("down").await.unwrap();
    let tools = aggregator.get_all_tools().await;
    assert_eq!(tools.len(), 1);
}

#[tokio::test]
async fn duplicate_tool_names_first_registered_wins() {
    let agent = agent(vec![
        ("first", EchoService::new("first-backend", &["search"])),
        ("second", EchoService::new("second-backend", &["search"])),
    ]);
    let aggregator = agent.aggregator();
    agent.start_all().await;

    let tools = aggregator.get_all_tools().await;
    let search_owners: Vec<&str> = tools
        .iter()
        .filter(|t| t.tool.name == "search")
        .map(|t| t.service_id.as_str())
        .collect();
    assert_eq!(search_owners, vec!["first", "second"]);

    // No text argument: the backend echoes its own name, proving which
    // service took the call.
    let outcome = aggregator
        .call_tool(CallToolRequest::new("search", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(outcome.service_id, "first");
    assert_eq!(
        outcome.result.content,
        vec![ContentBlock::Text {
            text: "first-backend".into()
        }]
    );
}

#[tokio::test]
async fn unknown_tool_fails_without_a_running_owner() {
    let agent = agent(vec![("svc", EchoService::new("svc", &["echo"]))]);
    let aggregator = agent.aggregator();

    // Nothing running: even a declared name resolves nowhere.
    let err = aggregator
        .call_tool(CallToolRequest::new("echo", serde_json::json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ToolNotFound { .. }));

    agent.start("svc").await.unwrap();
    let err = aggregator
        .call_tool(CallToolRequest::new("nope", serde_json::json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ToolNotFound { name } if name == "nope"));
}

#[tokio::test]
async fn application_errors_pass_through_with_flag_intact() {
    let agent = agent(vec![("svc", EchoService::new("svc", &["broken"]))]);
    let aggregator = agent.aggregator();
    agent.start("svc").await.unwrap();

    let outcome = aggregator
        .call_tool(CallToolRequest::new("broken", serde_json::json!({})))
        .await
        .unwrap();

    // An isError result is a protocol-level success; the flag and content
    // arrive unchanged, with timing metadata attached.
    assert!(outcome.result.is_error);
    assert_eq!(
        outcome.result.content,
        vec![ContentBlock::Text {
            text: "backend says no".into()
        }]
    );
}

#[tokio::test]
async fn state_subscribers_observe_lifecycle_transitions() {
    let agent = agent(vec![("svc", EchoService::new("svc", &["t"]))]);
    let states = agent.state_manager();
    let mut events = states.subscribe();

    agent.start("svc").await.unwrap();
    agent.stop("svc").await.unwrap();

    let first = events.recv().await.unwrap();
    assert_eq!(first.service_id, "svc");
    assert_eq!(first.from, ServiceState::Stopped);
    assert_eq!(first.to, ServiceState::Starting);

    let second = events.recv().await.unwrap();
    assert_eq!(second.to, ServiceState::Running);

    let third = events.recv().await.unwrap();
    assert_eq!(third.to, ServiceState::Stopped);
}

#[tokio::test]
async fn one_failing_service_leaves_others_untouched() {
    struct RefusingService;

    #[async_trait]
    impl EmbeddedService for RefusingService {
        async fn initialize(&self) -> Result<InitializeResult, GatewayError> {
            Err(GatewayError::Handshake {
                service: "refuser".into(),
                reason: "not today".into(),
            })
        }

        async fn list_tools(&self) -> Result<Vec<Tool>, GatewayError> {
            Ok(Vec::new())
        }

        async fn call_tool(
            &self,
            request: CallToolRequest,
        ) -> Result<CallToolResult, GatewayError> {
            Err(GatewayError::ToolNotFound { name: request.name })
        }
    }

    let configs = vec![config("healthy"), config("refuser")];
    let mut embedded: HashMap<String, Arc<dyn EmbeddedService>> = HashMap::new();
    embedded.insert(
        "healthy".into(),
        EchoService::new("healthy", &["echo"]) as Arc<dyn EmbeddedService>,
    );
    embedded.insert("refuser".into(), Arc::new(RefusingService));
    let agent = McpAgent::new(configs, embedded).unwrap();

    let errors = agent.start_all().await;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "refuser");

    let states = agent.state_manager();
    assert_eq!(states.get("healthy"), ServiceState::Running);
    assert_eq!(states.get("refuser"), ServiceState::Error);

    // The healthy service still serves calls.
    let outcome = agent
        .aggregator()
        .call_tool(CallToolRequest::new(
            "echo",
            serde_json::json!({"text": "still here"}),
        ))
        .await
        .unwrap();
    assert_eq!(
        outcome.result.content,
        vec![ContentBlock::Text {
            text: "still here".into()
        }]
    );

    // And the snapshot reflects both outcomes.
    let meta = agent.metadata().await;
    let refuser = meta.iter().find(|m| m.id == "refuser").unwrap();
    assert_eq!(refuser.status, ServiceState::Error);
    assert!(refuser.last_error.as_ref().unwrap().contains("not today"));
    let healthy = meta.iter().find(|m| m.id == "healthy").unwrap();
    assert_eq!(healthy.status, ServiceState::Running);
    assert_eq!(healthy.tool_count, 1);
}

#[tokio::test]
async fn reload_brings_a_new_service_into_the_catalog() {
    let mut embedded: HashMap<String, Arc<dyn EmbeddedService>> = HashMap::new();
    embedded.insert(
        "original".into(),
        EchoService::new("original", &["one"]) as Arc<dyn EmbeddedService>,
    );
    embedded.insert(
        "extra".into(),
        EchoService::new("extra", &["two"]) as Arc<dyn EmbeddedService>,
    );
    let agent = McpAgent::new(vec![config("original")], embedded).unwrap();
    agent.start_all().await;

    let errors = agent
        .apply_config(vec![config("original"), config("extra")])
        .await
        .unwrap();
    assert!(errors.is_empty());

    let tools = agent.aggregator().get_all_tools().await;
    let names: Vec<&str> = tools.iter().map(|t| t.tool.name.as_str()).collect();
    assert_eq!(names, vec!["one", "two"]);
}
