//! Gateway error types.

use thiserror::Error;

use crate::state::ServiceState;

/// Errors that can occur while talking to or managing a backend service.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The transport could not be established or was lost.
    #[error("service '{service}' unreachable: {reason}")]
    Connection {
        service: String,
        reason: String,
    },

    /// The transport came up but protocol negotiation failed or timed out.
    #[error("service '{service}' handshake failed: {reason}")]
    Handshake {
        service: String,
        reason: String,
    },

    /// An operation was attempted before/after a valid session.
    #[error("service '{service}' is not connected")]
    NotConnected {
        service: String,
    },

    /// A malformed or unexpected envelope arrived on an established session.
    #[error("protocol violation from service '{service}': {reason}")]
    Protocol {
        service: String,
        reason: String,
    },

    /// No currently known tool matches the requested name.
    #[error("unknown tool: '{name}'")]
    ToolNotFound {
        name: String,
    },

    /// The backend reported an application-level failure for a tool call.
    #[error("tool '{tool}' failed: {message}")]
    ToolExecution {
        tool: String,
        message: String,
    },

    /// A pending request's deadline elapsed before a reply arrived.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        method: String,
        timeout_ms: u64,
    },

    /// A state transition outside the allowed-edge table was requested.
    ///
    /// This is a logic error in the caller, not a runtime service failure.
    #[error("invalid state transition for '{service}': {from} -> {to}")]
    InvalidTransition {
        service: String,
        from: ServiceState,
        to: ServiceState,
    },

    /// Configuration error (duplicate ids, unknown embedded service, bad file).
    #[error("config error: {reason}")]
    Config {
        reason: String,
    },
}

impl GatewayError {
    /// Whether this failure means the session itself is gone (as opposed to
    /// a single operation failing on a healthy session).
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}
