//! Line-delimited JSON-RPC session over arbitrary stream halves.
//!
//! [`RpcSession`] owns the write half of a connection and a background task
//! reading the other half. Outbound requests are multiplexed over the single
//! stream with distinct ids; inbound replies are matched through the pending
//! table, so they may arrive in any order. Notifications are fanned out to
//! registered subscriber channels without blocking the reader.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::envelope::{Envelope, JsonRpcNotification, JsonRpcRequest, RequestId};
use super::pending::{PendingRequests, RpcFailure};

/// Buffered notifications per subscriber; overflow drops the notification
/// for that subscriber rather than stalling the reader.
const NOTIFICATION_BUFFER: usize = 32;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Why a request issued on a session did not produce a result payload.
#[derive(Debug)]
pub enum RequestError {
    /// The backend answered with a JSON-RPC error object.
    Rpc(super::envelope::JsonRpcError),
    /// The transport dropped before the reply arrived.
    ConnectionLost(String),
    /// The per-request deadline elapsed.
    Timeout { timeout_ms: u64 },
}

/// One live JSON-RPC session.
pub struct RpcSession {
    /// Label used in log lines (the owning service id).
    label: String,
    writer: Mutex<BoxedWriter>,
    pending: Arc<PendingRequests>,
    next_id: AtomicU64,
    request_timeout: Duration,
    connected: Arc<AtomicBool>,
    subscribers: std::sync::Mutex<Vec<mpsc::Sender<JsonRpcNotification>>>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RpcSession {
    /// Start a session over the given stream halves.
    ///
    /// Spawns the reader task immediately; the session is live until the
    /// stream ends, errors, or [`RpcSession::shutdown`] runs.
    pub fn spawn(
        label: &str,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            label: label.to_string(),
            writer: Mutex::new(Box::new(writer) as BoxedWriter),
            pending: Arc::new(PendingRequests::new()),
            next_id: AtomicU64::new(1),
            request_timeout,
            connected: Arc::new(AtomicBool::new(true)),
            subscribers: std::sync::Mutex::new(Vec::new()),
            reader_task: std::sync::Mutex::new(None),
        });

        let handle = tokio::spawn(read_loop(Arc::clone(&session), BufReader::new(reader)));
        *session
            .reader_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);

        session
    }

    /// Whether the underlying transport is still up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Number of requests currently awaiting replies.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Receive server-initiated notifications arriving after this call.
    pub fn subscribe_notifications(&self) -> mpsc::Receiver<JsonRpcNotification> {
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Issue a request and wait for its correlated reply.
    ///
    /// Concurrent callers multiplex over the stream with distinct ids. A
    /// deadline expiry removes the pending entry, so a late reply for that id
    /// is discarded without affecting other in-flight requests.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, RequestError> {
        self.request_with_timeout(method, params, self.request_timeout)
            .await
    }

    /// [`RpcSession::request`] with an explicit deadline (initialize uses a
    /// longer one than steady-state calls).
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, RequestError> {
        if !self.is_connected() {
            return Err(RequestError::ConnectionLost("session closed".into()));
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let rx = self.pending.register(id.clone());

        // The transport may have dropped between the connectivity check and
        // the registration; entries added after a fail-all would otherwise
        // dangle until their deadline.
        if !self.is_connected() {
            self.pending.remove(&id);
            return Err(RequestError::ConnectionLost("session closed".into()));
        }

        let request = JsonRpcRequest::new(id.clone(), method, params);
        if let Err(e) = self.write_line(&request).await {
            self.pending.remove(&id);
            return Err(RequestError::ConnectionLost(e));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(RpcFailure::Rpc(error)))) => Err(RequestError::Rpc(error)),
            Ok(Ok(Err(RpcFailure::ConnectionLost(reason)))) => {
                Err(RequestError::ConnectionLost(reason))
            }
            // Sender dropped without resolving: the table was torn down.
            Ok(Err(_)) => Err(RequestError::ConnectionLost("session closed".into())),
            Err(_) => {
                self.pending.remove(&id);
                Err(RequestError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a notification; no reply is ever expected.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), RequestError> {
        if !self.is_connected() {
            return Err(RequestError::ConnectionLost("session closed".into()));
        }
        let notification = JsonRpcNotification::new(method, params);
        self.write_line(&notification)
            .await
            .map_err(RequestError::ConnectionLost)
    }

    /// Tear the session down: stop the reader, fail everything in flight,
    /// close the write half. Idempotent.
    pub async fn shutdown(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }

        let task = self
            .reader_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }

        self.pending.fail_all("session closed");

        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Mark the session lost and fail everything in flight. Called by the
    /// reader loop and by transport watchers (process exit).
    pub fn mark_disconnected(&self, reason: &str) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.pending.fail_all(reason);
        }
    }

    async fn write_line(&self, message: &impl serde::Serialize) -> Result<(), String> {
        let mut line =
            serde_json::to_string(message).map_err(|e| format!("failed to serialize: {e}"))?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| format!("failed to write: {e}"))?;
        writer
            .flush()
            .await
            .map_err(|e| format!("failed to flush: {e}"))
    }

    /// Dispatch one classified inbound envelope.
    fn dispatch(&self, envelope: Envelope) {
        match envelope {
            Envelope::Response { id, result } => {
                if !self.pending.resolve(&id, Ok(result)) {
                    tracing::debug!(
                        service = %self.label,
                        id = %id,
                        "discarding reply with no pending request"
                    );
                }
            }
            Envelope::Error { id, error } => {
                if !self.pending.resolve(&id, Err(RpcFailure::Rpc(error))) {
                    tracing::debug!(
                        service = %self.label,
                        id = %id,
                        "discarding error reply with no pending request"
                    );
                }
            }
            Envelope::Notification(notification) => {
                let mut subscribers = self
                    .subscribers
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                subscribers.retain(|tx| match tx.try_send(notification.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::debug!(
                            service = %self.label,
                            method = %notification.method,
                            "notification subscriber full, dropping"
                        );
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
            Envelope::Request(request) => {
                // Backends may ping us; the gateway issues no server-side
                // features, so inbound requests are logged and dropped.
                tracing::debug!(
                    service = %self.label,
                    method = %request.method,
                    "ignoring server-initiated request"
                );
            }
        }
    }
}

/// Read newline-delimited envelopes until EOF or a read error.
async fn read_loop(session: Arc<RpcSession>, mut reader: BufReader<impl AsyncRead + Unpin>) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                tracing::info!(service = %session.label, "stream closed by peer");
                session.mark_disconnected("stream closed by peer");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match Envelope::decode(trimmed) {
                    Ok(envelope) => session.dispatch(envelope),
                    Err(reason) => {
                        // Not protocol data — backends sometimes leak log
                        // output onto the stream. Skip it.
                        tracing::debug!(
                            service = %session.label,
                            reason = %reason,
                            "skipping non-envelope line"
                        );
                    }
                }
            }
            Err(e) => {
                tracing::warn!(service = %session.label, error = %e, "stream read error");
                session.mark_disconnected(&format!("read error: {e}"));
                break;
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
