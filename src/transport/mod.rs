//! Transport adapters.
//!
//! One adapter owns one backend service's connection and translates the
//! shared capability surface — initialize, list tools, call tool, close —
//! onto its transport. The four variants are a closed set selected once at
//! construction time; after that, callers only see [`ServiceAdapter`].

pub mod embedded;
pub mod http;
pub mod sse;
pub mod stdio;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ServiceConfig, TransportConfig};
use crate::errors::GatewayError;
use crate::protocol::envelope::error_codes;
use crate::protocol::types::{CallToolRequest, CallToolResult, InitializeResult, Tool};
use crate::protocol::RequestError;
use crate::state::StateManager;

pub use embedded::{EmbeddedAdapter, EmbeddedService};
pub use http::HttpAdapter;
pub use sse::SseAdapter;
pub use stdio::StdioAdapter;

/// Default deadline for steady-state requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the initialize exchange; backends loading heavy runtimes can
/// take a while on first start.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Capability surface ─────────────────────────────────────────────────────

/// The capability surface every transport variant implements.
///
/// The adapter is the sole originator of state-transition requests for its
/// service: `initialize` drives `STARTING` → `RUNNING`/`ERROR`, and session
/// watchers drive `RUNNING` → `ERROR` on transport loss.
#[async_trait]
pub trait ServiceAdapter: Send + Sync {
    /// Establish the transport and run the protocol initialization exchange.
    async fn initialize(&self) -> Result<InitializeResult, GatewayError>;

    /// Discover the service's tool catalog over the established session.
    async fn list_tools(&self) -> Result<Vec<Tool>, GatewayError>;

    /// Invoke one tool over the established session.
    async fn call_tool(&self, request: CallToolRequest) -> Result<CallToolResult, GatewayError>;

    /// Release the transport. Idempotent; never fails.
    async fn close(&self);
}

// ─── Construction ───────────────────────────────────────────────────────────

/// Build the adapter variant a config calls for.
///
/// Embedded entries resolve their in-process service from `embedded`, keyed
/// by service id; a missing registration is a configuration error.
pub fn build_adapter(
    config: &ServiceConfig,
    states: Arc<StateManager>,
    embedded: Option<Arc<dyn EmbeddedService>>,
) -> Result<Arc<dyn ServiceAdapter>, GatewayError> {
    match &config.transport {
        TransportConfig::Stdio {
            command,
            args,
            env,
            cwd,
        } => Ok(Arc::new(StdioAdapter::new(
            &config.id,
            command,
            args.clone(),
            env.clone(),
            cwd.clone(),
            states,
        ))),
        TransportConfig::Embedded => {
            let service = embedded.ok_or_else(|| GatewayError::Config {
                reason: format!("no embedded service registered for '{}'", config.id),
            })?;
            Ok(Arc::new(EmbeddedAdapter::new(&config.id, service, states)))
        }
        TransportConfig::Sse { url } => Ok(Arc::new(SseAdapter::new(&config.id, url, states))),
        TransportConfig::Http { url } => Ok(Arc::new(HttpAdapter::new(&config.id, url, states))),
    }
}

// ─── Error mapping ──────────────────────────────────────────────────────────

/// Map a failed initialize exchange onto the taxonomy: the transport was up,
/// so everything is a handshake failure except outright loss.
pub(crate) fn map_init_error(service: &str, error: RequestError) -> GatewayError {
    match error {
        RequestError::ConnectionLost(reason) => GatewayError::Connection {
            service: service.to_string(),
            reason,
        },
        RequestError::Rpc(error) => GatewayError::Handshake {
            service: service.to_string(),
            reason: error.to_string(),
        },
        RequestError::Timeout { timeout_ms } => GatewayError::Handshake {
            service: service.to_string(),
            reason: format!("initialize timed out after {timeout_ms}ms"),
        },
    }
}

/// Map a failed discovery request onto the taxonomy.
pub(crate) fn map_list_error(service: &str, error: RequestError) -> GatewayError {
    match error {
        RequestError::ConnectionLost(reason) => GatewayError::Connection {
            service: service.to_string(),
            reason,
        },
        RequestError::Rpc(error) => GatewayError::Protocol {
            service: service.to_string(),
            reason: format!("tool listing rejected: {error}"),
        },
        RequestError::Timeout { timeout_ms } => GatewayError::Timeout {
            method: "tools/list".to_string(),
            timeout_ms,
        },
    }
}

/// Map a failed invocation onto the taxonomy. A backend error object naming
/// an unknown tool becomes `ToolNotFound`; any other error object is the
/// backend reporting the call failed.
pub(crate) fn map_call_error(service: &str, tool: &str, error: RequestError) -> GatewayError {
    match error {
        RequestError::ConnectionLost(reason) => GatewayError::Connection {
            service: service.to_string(),
            reason,
        },
        RequestError::Rpc(error) => {
            if error.code == error_codes::METHOD_NOT_FOUND
                || error.message.to_lowercase().contains("unknown tool")
            {
                GatewayError::ToolNotFound {
                    name: tool.to_string(),
                }
            } else {
                GatewayError::ToolExecution {
                    tool: tool.to_string(),
                    message: error.to_string(),
                }
            }
        }
        RequestError::Timeout { timeout_ms } => GatewayError::Timeout {
            method: format!("tools/call {tool}"),
            timeout_ms,
        },
    }
}

/// Decode a reply payload, mapping malformed shapes to `Protocol`.
pub(crate) fn decode_payload<T: serde::de::DeserializeOwned>(
    service: &str,
    what: &str,
    payload: serde_json::Value,
) -> Result<T, GatewayError> {
    serde_json::from_value(payload).map_err(|e| GatewayError::Protocol {
        service: service.to_string(),
        reason: format!("malformed {what} reply: {e}"),
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────
