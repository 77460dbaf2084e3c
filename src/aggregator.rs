//! Tool catalog aggregation and invocation routing.
//!
//! The aggregator composes every configured adapter into one discovery and
//! invocation surface. It holds non-owning references to the orchestrator's
//! service table for the duration of each call and keeps no mutable state of
//! its own, so concurrent callers are safe.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::agent::ServiceTable;
use crate::errors::GatewayError;
use crate::protocol::types::{CallToolRequest, CallToolResult, Tool};
use crate::state::{ServiceState, StateManager};

/// One tool tagged with the service that owns it.
///
/// Names may collide across services; `service_id` disambiguates.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedTool {
    pub service_id: String,
    pub service_name: String,
    #[serde(flatten)]
    pub tool: Tool,
}

/// A routed call's result plus invocation metadata.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedCallResult {
    pub result: CallToolResult,
    pub execution_time_ms: u64,
    pub service_id: String,
}

/// Merged view over all adapters.
#[derive(Clone)]
pub struct Aggregator {
    services: Arc<ServiceTable>,
    states: Arc<StateManager>,
}

impl Aggregator {
    pub(crate) fn new(services: Arc<ServiceTable>, states: Arc<StateManager>) -> Self {
        Self { services, states }
    }

    /// The combined tool catalog across all `RUNNING` services.
    ///
    /// Catalogs are queried live and concatenated in service-registration
    /// order, tool-declaration order within each service. Services in any
    /// other state are skipped silently, as is a running service whose
    /// listing fails (logged; its cached catalog is left untouched).
    pub async fn get_all_tools(&self) -> Vec<AggregatedTool> {
        let mut table = self.services.write().await;
        let mut catalog = Vec::new();

        for entry in table.iter_mut() {
            if self.states.get(&entry.config.id) != ServiceState::Running {
                continue;
            }

            match entry.adapter.list_tools().await {
                Ok(tools) => {
                    entry.tools = tools.clone();
                    catalog.extend(tools.into_iter().map(|tool| AggregatedTool {
                        service_id: entry.config.id.clone(),
                        service_name: entry.config.name.clone(),
                        tool,
                    }));
                }
                Err(e) => {
                    tracing::warn!(
                        service = %entry.config.id,
                        error = %e,
                        "tool listing failed, omitting service from catalog"
                    );
                    entry.note_error(&e);
                }
            }
        }

        catalog
    }

    /// Route a call to the service owning the named tool.
    ///
    /// Resolution walks currently known tools in catalog order; when several
    /// services declare the same name, the first registered wins. The owning
    /// adapter's result or failure passes through unchanged; timing metadata
    /// is added on success only.
    pub async fn call_tool(
        &self,
        request: CallToolRequest,
    ) -> Result<AggregatedCallResult, GatewayError> {
        let target = {
            let table = self.services.read().await;
            table
                .iter()
                .find(|entry| {
                    self.states.get(&entry.config.id) == ServiceState::Running
                        && entry.tools.iter().any(|tool| tool.name == request.name)
                })
                .map(|entry| (entry.config.id.clone(), Arc::clone(&entry.adapter)))
        };

        let Some((service_id, adapter)) = target else {
            return Err(GatewayError::ToolNotFound {
                name: request.name,
            });
        };

        let tool_name = request.name.clone();
        let start = Instant::now();
        let result = adapter.call_tool(request).await?;
        let execution_time_ms = start.elapsed().as_millis() as u64;

        tracing::info!(
            service = %service_id,
            tool = %tool_name,
            elapsed_ms = execution_time_ms,
            is_error = result.is_error,
            "tool call completed"
        );

        Ok(AggregatedCallResult {
            result,
            execution_time_ms,
            service_id,
        })
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::agent::McpAgent;
    use crate::config::{ServiceConfig, TransportConfig};
    use crate::errors::GatewayError;
    use crate::protocol::types::{
        CallToolRequest, CallToolResult, InitializeResult, ParameterKind, Tool, ToolParameter,
    };
    use crate::transport::EmbeddedService;

    /// Backend whose catalog can change between discoveries.
    struct GrowingService {
        grown: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl EmbeddedService for GrowingService {
        async fn initialize(&self) -> Result<InitializeResult, GatewayError> {
            Ok(InitializeResult::default())
        }

        async fn list_tools(&self) -> Result<Vec<Tool>, GatewayError> {
            let mut names = vec!["stable"];
            if self.grown.load(std::sync::atomic::Ordering::Acquire) {
                names.push("grown");
            }
            Ok(names
                .into_iter()
                .map(|name| Tool {
                    name: name.to_string(),
                    description: String::new(),
                    input_schema: ToolParameter::of_kind(ParameterKind::Object),
                })
                .collect())
        }

        async fn call_tool(
            &self,
            request: CallToolRequest,
        ) -> Result<CallToolResult, GatewayError> {
            Ok(CallToolResult::text(request.name))
        }
    }

    fn growing_agent() -> (McpAgent, Arc<GrowingService>) {
        let service = Arc::new(GrowingService {
            grown: std::sync::atomic::AtomicBool::new(false),
        });
        let configs = vec![ServiceConfig {
            id: "svc".into(),
            name: "svc".into(),
            description: None,
            transport: TransportConfig::Embedded,
            auto_start: true,
        }];
        let embedded: HashMap<String, Arc<dyn EmbeddedService>> = [(
            "svc".to_string(),
            Arc::clone(&service) as Arc<dyn EmbeddedService>,
        )]
        .into();
        (McpAgent::new(configs, embedded).unwrap(), service)
    }

    #[tokio::test]
    async fn test_discovery_refreshes_the_routing_cache() {
        let (agent, service) = growing_agent();
        let aggregator = agent.aggregator();
        agent.start("svc").await.unwrap();

        // The new tool is not routable until a discovery has seen it.
        service
            .grown
            .store(true, std::sync::atomic::Ordering::Release);
        let err = aggregator
            .call_tool(CallToolRequest::new("grown", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ToolNotFound { .. }));

        assert_eq!(aggregator.get_all_tools().await.len(), 2);
        let outcome = aggregator
            .call_tool(CallToolRequest::new("grown", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(outcome.service_id, "svc");
    }
}
