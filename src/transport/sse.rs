//! Server-event transport.
//!
//! Inbound envelopes arrive as frames on a long-lived event stream; outbound
//! requests go out on a secondary POST channel named by the stream's opening
//! `endpoint` event. Replies are matched to requests by id through the shared
//! pending table, never by arrival order.
//!
//! A dropped stream fails everything in flight immediately (requests are
//! delivered at most once), then reconnects with bounded exponential backoff
//! before declaring the service failed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::errors::GatewayError;
use crate::protocol::envelope::{Envelope, JsonRpcNotification, JsonRpcRequest, RequestId};
use crate::protocol::pending::{PendingRequests, RpcFailure};
use crate::protocol::types::{
    CallToolRequest, CallToolResult, InitializeParams, InitializeResult, ListToolsResult, Tool,
};
use crate::protocol::RequestError;
use crate::state::{ServiceState, StateManager};

use super::{
    decode_payload, map_call_error, map_init_error, map_list_error, ServiceAdapter, INIT_TIMEOUT,
    REQUEST_TIMEOUT,
};

/// Attempts to re-establish a dropped stream before giving up.
const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Base reconnect delay; doubles per attempt.
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// How long to wait for the stream's opening `endpoint` event.
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10);

/// Backoff before reconnect attempt `n` (1-based): 1s, 2s, 4s.
fn reconnect_delay(attempt: u32) -> Duration {
    RECONNECT_BASE_DELAY * 2u32.pow(attempt.saturating_sub(1))
}

// ─── SSE framing ────────────────────────────────────────────────────────────

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SseEvent {
    /// The `event:` field, if present.
    pub name: Option<String>,
    /// Joined `data:` lines.
    pub data: String,
}

/// Incremental decoder for the `text/event-stream` format.
///
/// Feed arbitrary chunk boundaries; complete blank-line-delimited events come
/// out. Comment lines and unknown fields are ignored.
#[derive(Default)]
pub(crate) struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);

        let mut events = Vec::new();
        // An event is terminated by a blank line (LF or CRLF framing); any
        // trailing partial event stays buffered for the next chunk.
        loop {
            let lf = self.buffer.find("\n\n").map(|i| (i, 2));
            let crlf = self.buffer.find("\r\n\r\n").map(|i| (i, 4));
            let (split, len) = match (lf, crlf) {
                (Some(a), Some(b)) => std::cmp::min_by_key(a, b, |(i, _)| *i),
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => break,
            };
            let frame: String = self.buffer.drain(..split + len).collect();
            if let Some(event) = parse_frame(&frame) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_frame(frame: &str) -> Option<SseEvent> {
    let mut name = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in frame.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            name = Some(rest.trim_start().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start());
        }
    }

    if name.is_none() && data_lines.is_empty() {
        return None;
    }
    Some(SseEvent {
        name,
        data: data_lines.join("\n"),
    })
}

/// Resolve the `endpoint` event's payload against the stream URL.
fn resolve_endpoint(stream_url: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    // Scheme + authority of the stream URL, then the absolute path.
    let origin_end = stream_url
        .find("://")
        .map(|i| i + 3)
        .and_then(|start| stream_url[start..].find('/').map(|i| start + i))
        .unwrap_or(stream_url.len());
    format!("{}{}", &stream_url[..origin_end], endpoint)
}

// ─── SseAdapter ─────────────────────────────────────────────────────────────

/// Shared pieces the stream task and callers both touch.
struct Shared {
    service_id: String,
    pending: PendingRequests,
    connected: AtomicBool,
    /// POST target, refreshed on every (re)connect handshake.
    post_url: std::sync::Mutex<String>,
}

impl Shared {
    fn post_url(&self) -> String {
        self.post_url
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn set_post_url(&self, url: String) {
        *self
            .post_url
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = url;
    }
}

/// Adapter owning one event-stream session.
pub struct SseAdapter {
    service_id: String,
    url: String,
    states: Arc<StateManager>,
    http: reqwest::Client,
    next_id: AtomicU64,
    live: Mutex<Option<SseSession>>,
}

struct SseSession {
    shared: Arc<Shared>,
    stream_task: JoinHandle<()>,
}

impl SseAdapter {
    pub fn new(service_id: &str, url: &str, states: Arc<StateManager>) -> Self {
        Self {
            service_id: service_id.to_string(),
            url: url.to_string(),
            states,
            http: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
            live: Mutex::new(None),
        }
    }

    /// Open the stream and wait for its `endpoint` event.
    async fn open_stream(
        &self,
    ) -> Result<(EventStream, String), String> {
        let response = self
            .http
            .get(&self.url)
            .header("accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| format!("stream request failed: {e}"))?;

        if !response.status().is_success() {
            return Err(format!("stream returned status {}", response.status()));
        }

        let mut stream = EventStream {
            bytes: Box::pin(response.bytes_stream()),
            decoder: SseDecoder::default(),
            queued: Vec::new(),
        };

        let endpoint = tokio::time::timeout(ENDPOINT_TIMEOUT, async {
            while let Some(event) = stream.next_event().await {
                if event.name.as_deref() == Some("endpoint") {
                    return Some(event.data);
                }
            }
            None
        })
        .await
        .map_err(|_| "no endpoint event before deadline".to_string())?
        .ok_or_else(|| "stream closed before endpoint event".to_string())?;

        Ok((stream, resolve_endpoint(&self.url, &endpoint)))
    }

    /// Issue one request over the POST channel and await its correlated reply
    /// from the stream.
    async fn request(
        &self,
        shared: &Arc<Shared>,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, RequestError> {
        if !shared.connected.load(Ordering::Acquire) {
            return Err(RequestError::ConnectionLost("stream down".into()));
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let rx = shared.pending.register(id.clone());

        if !shared.connected.load(Ordering::Acquire) {
            shared.pending.remove(&id);
            return Err(RequestError::ConnectionLost("stream down".into()));
        }

        let request = JsonRpcRequest::new(id.clone(), method, params);
        let sent = self
            .http
            .post(shared.post_url())
            .json(&request)
            .send()
            .await;

        match sent {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                shared.pending.remove(&id);
                return Err(RequestError::ConnectionLost(format!(
                    "request channel returned status {}",
                    response.status()
                )));
            }
            Err(e) => {
                shared.pending.remove(&id);
                return Err(RequestError::ConnectionLost(format!(
                    "request channel failed: {e}"
                )));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(RpcFailure::Rpc(error)))) => Err(RequestError::Rpc(error)),
            Ok(Ok(Err(RpcFailure::ConnectionLost(reason)))) => {
                Err(RequestError::ConnectionLost(reason))
            }
            Ok(Err(_)) => Err(RequestError::ConnectionLost("stream down".into())),
            Err(_) => {
                shared.pending.remove(&id);
                Err(RequestError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn notify(
        &self,
        shared: &Arc<Shared>,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), RequestError> {
        let notification = JsonRpcNotification::new(method, params);
        self.http
            .post(shared.post_url())
            .json(&notification)
            .send()
            .await
            .map_err(|e| RequestError::ConnectionLost(format!("request channel failed: {e}")))?;
        Ok(())
    }

    async fn shared(&self) -> Result<Arc<Shared>, GatewayError> {
        let live = self.live.lock().await;
        match live.as_ref() {
            Some(session) if session.shared.connected.load(Ordering::Acquire) => {
                Ok(Arc::clone(&session.shared))
            }
            _ => Err(GatewayError::NotConnected {
                service: self.service_id.clone(),
            }),
        }
    }

    fn note_failure(&self, error: &GatewayError) {
        if error.is_connection_loss() && self.states.get(&self.service_id) == ServiceState::Running
        {
            let _ = self.states.set(&self.service_id, ServiceState::Error);
        }
    }
}

#[async_trait]
impl ServiceAdapter for SseAdapter {
    async fn initialize(&self) -> Result<InitializeResult, GatewayError> {
        let mut live = self.live.lock().await;
        if let Some(session) = live.as_ref() {
            if session.shared.connected.load(Ordering::Acquire) {
                return Err(GatewayError::Handshake {
                    service: self.service_id.clone(),
                    reason: "already initialized".into(),
                });
            }
        }

        self.states.set(&self.service_id, ServiceState::Starting)?;

        let (stream, post_url) = match self.open_stream().await {
            Ok(open) => open,
            Err(reason) => {
                let _ = self.states.set(&self.service_id, ServiceState::Error);
                return Err(GatewayError::Connection {
                    service: self.service_id.clone(),
                    reason,
                });
            }
        };

        let shared = Arc::new(Shared {
            service_id: self.service_id.clone(),
            pending: PendingRequests::new(),
            connected: AtomicBool::new(true),
            post_url: std::sync::Mutex::new(post_url),
        });

        let stream_task = spawn_stream_task(
            Arc::clone(&shared),
            stream,
            self.http.clone(),
            self.url.clone(),
            Arc::clone(&self.states),
        );

        let params = serde_json::to_value(InitializeParams::for_gateway()).ok();
        let init = async {
            let payload = self
                .request(&shared, "initialize", params, INIT_TIMEOUT)
                .await
                .map_err(|e| map_init_error(&self.service_id, e))?;
            let init: InitializeResult =
                decode_payload(&self.service_id, "initialize", payload).map_err(|e| {
                    GatewayError::Handshake {
                        service: self.service_id.clone(),
                        reason: e.to_string(),
                    }
                })?;
            self.notify(&shared, "notifications/initialized", None)
                .await
                .map_err(|e| map_init_error(&self.service_id, e))?;
            Ok::<_, GatewayError>(init)
        }
        .await;

        let init = match init {
            Ok(init) => init,
            Err(e) => {
                shared.connected.store(false, Ordering::Release);
                stream_task.abort();
                shared.pending.fail_all("handshake aborted");
                let _ = self.states.set(&self.service_id, ServiceState::Error);
                return Err(e);
            }
        };

        self.states.set(&self.service_id, ServiceState::Running)?;
        tracing::info!(
            service = %self.service_id,
            server = %init.server_info.name,
            "sse service initialized"
        );

        *live = Some(SseSession {
            shared,
            stream_task,
        });
        Ok(init)
    }

    async fn list_tools(&self) -> Result<Vec<Tool>, GatewayError> {
        let shared = self.shared().await?;
        let payload = self
            .request(&shared, "tools/list", None, REQUEST_TIMEOUT)
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
        let shared = self.shared().await?;
        let params = serde_json::json!({
            "name": request.name,
            "arguments": request.arguments,
        });

        let payload = self
            .request(&shared, "tools/call", Some(params), REQUEST_TIMEOUT)
            .await
            .map_err(|e| {
                let mapped = map_call_error(&self.service_id, &request.name, e);
                self.note_failure(&mapped);
                mapped
            })?;

        decode_payload(&self.service_id, "tools/call", payload)
    }

    async fn close(&self) {
        let Some(session) = self.live.lock().await.take() else {
            return;
        };
        session.shared.connected.store(false, Ordering::Release);
        session.stream_task.abort();
        session.shared.pending.fail_all("session closed");
    }
}

// ─── Stream task ────────────────────────────────────────────────────────────

/// A connected event stream plus its decoder.
struct EventStream {
    bytes: futures::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    decoder: SseDecoder,
    queued: Vec<SseEvent>,
}

impl EventStream {
    /// Next decoded event, or `None` when the stream ends or errors.
    async fn next_event(&mut self) -> Option<SseEvent> {
        loop {
            if !self.queued.is_empty() {
                return Some(self.queued.remove(0));
            }
            match self.bytes.next().await? {
                Ok(chunk) => {
                    let text = String::from_utf8_lossy(&chunk).into_owned();
                    self.queued = self.decoder.feed(&text);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "event stream error");
                    return None;
                }
            }
        }
    }
}

/// Pumps the stream, reconnecting with backoff when it drops.
///
/// Requests pending at disconnect fail immediately; they are never replayed
/// onto the new stream.
fn spawn_stream_task(
    shared: Arc<Shared>,
    stream: EventStream,
    http: reqwest::Client,
    stream_url: String,
    states: Arc<StateManager>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = stream;
        loop {
            pump_events(&shared, &mut stream).await;

            if !shared.connected.load(Ordering::Acquire) {
                // Deliberate close.
                return;
            }

            // At-most-once: whatever was in flight when the stream dropped is
            // failed now, not retried.
            shared.pending.fail_all("event stream dropped");

            match reconnect(&shared, &http, &stream_url).await {
                Some(new_stream) => {
                    stream = new_stream;
                    tracing::info!(service = %shared.service_id, "event stream re-established");
                }
                None => {
                    shared.connected.store(false, Ordering::Release);
                    tracing::warn!(
                        service = %shared.service_id,
                        attempts = MAX_RECONNECT_ATTEMPTS,
                        "event stream reconnect exhausted"
                    );
                    if states.get(&shared.service_id) == ServiceState::Running {
                        let _ = states.set(&shared.service_id, ServiceState::Error);
                    }
                    return;
                }
            }
        }
    })
}

/// Dispatch decoded events until the stream drops.
async fn pump_events(shared: &Arc<Shared>, stream: &mut EventStream) {
    while let Some(event) = stream.next_event().await {
        if event.data.is_empty() {
            continue;
        }
        match Envelope::decode(&event.data) {
            Ok(Envelope::Response { id, result }) => {
                if !shared.pending.resolve(&id, Ok(result)) {
                    tracing::debug!(
                        service = %shared.service_id,
                        id = %id,
                        "discarding reply with no pending request"
                    );
                }
            }
            Ok(Envelope::Error { id, error }) => {
                if !shared.pending.resolve(&id, Err(RpcFailure::Rpc(error))) {
                    tracing::debug!(
                        service = %shared.service_id,
                        id = %id,
                        "discarding error reply with no pending request"
                    );
                }
            }
            Ok(Envelope::Notification(notification)) => {
                tracing::debug!(
                    service = %shared.service_id,
                    method = %notification.method,
                    "server notification"
                );
            }
            Ok(Envelope::Request(request)) => {
                tracing::debug!(
                    service = %shared.service_id,
                    method = %request.method,
                    "ignoring server-initiated request"
                );
            }
            Err(reason) => {
                tracing::debug!(
                    service = %shared.service_id,
                    reason = %reason,
                    "skipping non-envelope event"
                );
            }
        }
    }
}

/// Bounded-retry reconnect: open the stream and redo the endpoint handshake.
async fn reconnect(
    shared: &Arc<Shared>,
    http: &reqwest::Client,
    stream_url: &str,
) -> Option<EventStream> {
    for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
        tokio::time::sleep(reconnect_delay(attempt)).await;
        if !shared.connected.load(Ordering::Acquire) {
            return None;
        }

        tracing::debug!(
            service = %shared.service_id,
            attempt,
            "reconnecting event stream"
        );

        let response = match http
            .get(stream_url)
            .header("accept", "text/event-stream")
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                tracing::debug!(
                    service = %shared.service_id,
                    status = %response.status(),
                    "reconnect attempt rejected"
                );
                continue;
            }
            Err(e) => {
                tracing::debug!(service = %shared.service_id, error = %e, "reconnect failed");
                continue;
            }
        };

        let mut stream = EventStream {
            bytes: Box::pin(response.bytes_stream()),
            decoder: SseDecoder::default(),
            queued: Vec::new(),
        };

        let endpoint = tokio::time::timeout(ENDPOINT_TIMEOUT, async {
            while let Some(event) = stream.next_event().await {
                if event.name.as_deref() == Some("endpoint") {
                    return Some(event.data);
                }
            }
            None
        })
        .await;

        match endpoint {
            Ok(Some(endpoint)) => {
                shared.set_post_url(resolve_endpoint(stream_url, &endpoint));
                return Some(stream);
            }
            _ => continue,
        }
    }
    None
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_single_event() {
        let mut decoder = SseDecoder::default();
        let events = decoder.feed("event: message\ndata: {\"jsonrpc\":\"2.0\"}\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                name: Some("message".into()),
                data: "{\"jsonrpc\":\"2.0\"}".into(),
            }]
        );
    }

    #[test]
    fn test_decoder_joins_multiline_data() {
        let mut decoder = SseDecoder::default();
        let events = decoder.feed("data: a\ndata: b\n\n");
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn test_decoder_across_chunk_boundaries() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed("event: mess").is_empty());
        assert!(decoder.feed("age\ndata: hi\n").is_empty());
        let events = decoder.feed("\ndata: next\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name.as_deref(), Some("message"));
        assert_eq!(events[0].data, "hi");
        assert_eq!(events[1].data, "next");
    }

    #[test]
    fn test_decoder_ignores_comments_and_crlf() {
        let mut decoder = SseDecoder::default();
        let events = decoder.feed(": keepalive\r\ndata: x\r\n\r\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn test_resolve_endpoint_absolute_and_relative() {
        assert_eq!(
            resolve_endpoint("http://host:9000/sse", "/messages?session=1"),
            "http://host:9000/messages?session=1"
        );
        assert_eq!(
            resolve_endpoint("http://host:9000/sse", "http://other/post"),
            "http://other/post"
        );
    }

    #[test]
    fn test_reconnect_backoff_schedule() {
        assert_eq!(reconnect_delay(1), Duration::from_secs(1));
        assert_eq!(reconnect_delay(2), Duration::from_secs(2));
        assert_eq!(reconnect_delay(3), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_operations_before_initialize_are_not_connected() {
        let states = Arc::new(StateManager::new());
        states.register("svc");
        let adapter = SseAdapter::new("svc", "http://localhost:0/sse", states);

        assert!(matches!(
            adapter.list_tools().await.unwrap_err(),
            GatewayError::NotConnected { .. }
        ));
    }
}
