//! In-process transport.
//!
//! A compatibility shim: wraps a service object living in this process behind
//! the same capability surface as the out-of-process adapters, so the
//! aggregator treats both identically. There is no serialization and no
//! transport to lose; the failure surface is whatever the wrapped object
//! raises.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::GatewayError;
use crate::protocol::types::{CallToolRequest, CallToolResult, InitializeResult, Tool};
use crate::state::{ServiceState, StateManager};

use super::ServiceAdapter;

/// The surface an in-process service implements to be mounted behind the
/// gateway. Mirrors the wire protocol's operations without the wire.
#[async_trait]
pub trait EmbeddedService: Send + Sync {
    /// Session setup; returns the service's identity and capabilities.
    async fn initialize(&self) -> Result<InitializeResult, GatewayError>;

    /// The service's tool catalog.
    async fn list_tools(&self) -> Result<Vec<Tool>, GatewayError>;

    /// Invoke one tool.
    async fn call_tool(&self, request: CallToolRequest) -> Result<CallToolResult, GatewayError>;

    /// Session teardown. Default: nothing to release.
    async fn shutdown(&self) {}
}

/// Adapter wrapping one [`EmbeddedService`].
pub struct EmbeddedAdapter {
    service_id: String,
    service: Arc<dyn EmbeddedService>,
    states: Arc<StateManager>,
    ready: AtomicBool,
}

impl EmbeddedAdapter {
    pub fn new(
        service_id: &str,
        service: Arc<dyn EmbeddedService>,
        states: Arc<StateManager>,
    ) -> Self {
        Self {
            service_id: service_id.to_string(),
            service,
            states,
            ready: AtomicBool::new(false),
        }
    }

    fn ensure_ready(&self) -> Result<(), GatewayError> {
        if self.ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(GatewayError::NotConnected {
                service: self.service_id.clone(),
            })
        }
    }
}

#[async_trait]
impl ServiceAdapter for EmbeddedAdapter {
    async fn initialize(&self) -> Result<InitializeResult, GatewayError> {
        self.states.set(&self.service_id, ServiceState::Starting)?;

        match self.service.initialize().await {
            Ok(init) => {
                self.ready.store(true, Ordering::Release);
                self.states.set(&self.service_id, ServiceState::Running)?;
                tracing::info!(
                    service = %self.service_id,
                    server = %init.server_info.name,
                    "embedded service initialized"
                );
                Ok(init)
            }
            Err(e) => {
                let _ = self.states.set(&self.service_id, ServiceState::Error);
                Err(GatewayError::Handshake {
                    service: self.service_id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn list_tools(&self) -> Result<Vec<Tool>, GatewayError> {
        self.ensure_ready()?;
        self.service.list_tools().await
    }

    async fn call_tool(&self, request: CallToolRequest) -> Result<CallToolResult, GatewayError> {
        self.ensure_ready()?;
        self.service.call_tool(request).await
    }

    async fn close(&self) {
        if self.ready.swap(false, Ordering::AcqRel) {
            self.service.shutdown().await;
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
