//! Plain request/response transport.
//!
//! Each protocol operation is one POST exchange against the configured URL.
//! There is no persistent connection to lose: `close()` is a local no-op
//! beyond forgetting the session, and the only session state kept is the
//! `mcp-session-id` header echoed back for remote ends that track one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::GatewayError;
use crate::protocol::envelope::{Envelope, JsonRpcNotification, JsonRpcRequest, RequestId};
use crate::protocol::types::{
    CallToolRequest, CallToolResult, InitializeParams, InitializeResult, ListToolsResult, Tool,
};
use crate::protocol::RequestError;
use crate::state::{ServiceState, StateManager};

use super::{
    decode_payload, map_call_error, map_init_error, map_list_error, ServiceAdapter, INIT_TIMEOUT,
    REQUEST_TIMEOUT,
};

/// Adapter issuing one HTTP exchange per operation.
pub struct HttpAdapter {
    service_id: String,
    url: String,
    states: Arc<StateManager>,
    http: reqwest::Client,
    next_id: AtomicU64,
    ready: AtomicBool,
    /// Session id the remote end handed us, echoed on subsequent requests.
    session_id: std::sync::Mutex<Option<String>>,
}

impl HttpAdapter {
    pub fn new(service_id: &str, url: &str, states: Arc<StateManager>) -> Self {
        Self {
            service_id: service_id.to_string(),
            url: url.to_string(),
            states,
            http: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
            ready: AtomicBool::new(false),
            session_id: std::sync::Mutex::new(None),
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

    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// One POST exchange: send the request envelope, match the reply to it.
    async fn exchange(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, RequestError> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let request = JsonRpcRequest::new(id.clone(), method, params);

        let mut builder = self
            .http
            .post(&self.url)
            .header("accept", "application/json")
            .timeout(timeout)
            .json(&request);
        if let Some(session) = self.session_id() {
            builder = builder.header("mcp-session-id", session);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                RequestError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                }
            } else {
                RequestError::ConnectionLost(format!("request failed: {e}"))
            }
        })?;

        if let Some(session) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            *self
                .session_id
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(session.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            return Err(RequestError::ConnectionLost(format!(
                "server returned status {status}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RequestError::ConnectionLost(format!("failed to read reply: {e}")))?;

        match Envelope::decode(&body) {
            Ok(Envelope::Response { id: reply_id, result }) if reply_id == id => Ok(result),
            Ok(Envelope::Error { id: reply_id, error }) if reply_id == id => {
                Err(RequestError::Rpc(error))
            }
            Ok(_) => Err(RequestError::ConnectionLost(
                "reply does not correlate with the request".into(),
            )),
            Err(reason) => Err(RequestError::ConnectionLost(format!(
                "malformed reply: {reason}"
            ))),
        }
    }

    async fn post_notification(&self, method: &str) -> Result<(), RequestError> {
        let notification = JsonRpcNotification::new(method, None);
        let mut builder = self.http.post(&self.url).json(&notification);
        if let Some(session) = self.session_id() {
            builder = builder.header("mcp-session-id", session);
        }
        builder
            .send()
            .await
            .map_err(|e| RequestError::ConnectionLost(format!("notification failed: {e}")))?;
        Ok(())
    }

    fn note_failure(&self, error: &GatewayError) {
        if error.is_connection_loss() && self.states.get(&self.service_id) == ServiceState::Running
        {
            let _ = self.states.set(&self.service_id, ServiceState::Error);
        }
    }
}

#[async_trait]
impl ServiceAdapter for HttpAdapter {
    async fn initialize(&self) -> Result<InitializeResult, GatewayError> {
        if self.ready.load(Ordering::Acquire) {
            return Err(GatewayError::Handshake {
                service: self.service_id.clone(),
                reason: "already initialized".into(),
            });
        }

        self.states.set(&self.service_id, ServiceState::Starting)?;

        let params = serde_json::to_value(InitializeParams::for_gateway()).ok();
        let result = async {
            let payload = self
                .exchange("initialize", params, INIT_TIMEOUT)
                .await
                .map_err(|e| map_init_error(&self.service_id, e))?;
            let init: InitializeResult = decode_payload(&self.service_id, "initialize", payload)
                .map_err(|e| GatewayError::Handshake {
                    service: self.service_id.clone(),
                    reason: e.to_string(),
                })?;
            // Best effort: stateless remotes often have nowhere to put this.
            if let Err(e) = self.post_notification("notifications/initialized").await {
                tracing::debug!(
                    service = %self.service_id,
                    error = ?e,
                    "initialized notification not delivered"
                );
            }
            Ok::<_, GatewayError>(init)
        }
        .await;

        match result {
            Ok(init) => {
                self.ready.store(true, Ordering::Release);
                self.states.set(&self.service_id, ServiceState::Running)?;
                tracing::info!(
                    service = %self.service_id,
                    server = %init.server_info.name,
                    "http service initialized"
                );
                Ok(init)
            }
            Err(e) => {
                let _ = self.states.set(&self.service_id, ServiceState::Error);
                Err(e)
            }
        }
    }

    async fn list_tools(&self) -> Result<Vec<Tool>, GatewayError> {
        self.ensure_ready()?;
        let payload = self
            .exchange("tools/list", None, REQUEST_TIMEOUT)
            .await
            .map_err(|e| {
                let mapped = map_list_error(&self.service_id, e);
                self.note_failure(&mapped);
                mapped
            })?;

        let list: ListToolsResult = decode_payload(&self.service_id, "tools/list", payload)?;
        Ok(list.tools)
    }

    async fn call_tool(&self, request: CallToolRequest) -> Result<CallToolResult, GatewayError> {
        self.ensure_ready()?;
        let params = serde_json::json!({
            "name": request.name,
            "arguments": request.arguments,
        });

        let payload = self
            .exchange("tools/call", Some(params), REQUEST_TIMEOUT)
            .await
            .map_err(|e| {
                let mapped = map_call_error(&self.service_id, &request.name, e);
                self.note_failure(&mapped);
                mapped
            })?;

        decode_payload(&self.service_id, "tools/call", payload)
    }

    async fn close(&self) {
        // Nothing to release; just forget the session.
        self.ready.store(false, Ordering::Release);
        *self
            .session_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
