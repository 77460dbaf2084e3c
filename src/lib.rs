//! mcphub — a gateway fronting multiple MCP tool services.
//!
//! Each backend service speaks JSON-RPC over its own transport (spawned
//! process, in-process object, server-event stream, or plain HTTP); the
//! gateway merges their tool catalogs into one surface and routes
//! invocations to the owning service. Embedding applications consume three
//! handles: the [`agent::McpAgent`] for lifecycle control, its
//! [`aggregator::Aggregator`] for discovery and invocation, and the
//! [`state::StateManager`] for status reads and subscriptions.

pub mod agent;
pub mod aggregator;
pub mod config;
pub mod errors;
pub mod protocol;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use aggregator::{AggregatedCallResult, AggregatedTool, Aggregator};
pub use agent::{McpAgent, McpServiceMetadata};
pub use config::{ServiceConfig, ServicesConfig, TransportKind};
pub use errors::GatewayError;
pub use protocol::types::{CallToolRequest, CallToolResult, Tool};
pub use state::{ServiceState, StateEvent, StateManager};
pub use transport::{EmbeddedService, ServiceAdapter};

/// Initialize the tracing subscriber for an embedding application.
///
/// Honors `RUST_LOG`; defaults to info-level output for the gateway and
/// warnings elsewhere. Calling this twice is a no-op (the second install
/// fails quietly), so library consumers that configure their own subscriber
/// can simply skip it.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcphub=info,warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
