//! Pending-request correlation table.
//!
//! Replies on a shared stream may arrive in any order; the table maps each
//! in-flight request id to a single-resolution channel. Resolving an id twice
//! is a no-op, and an unknown id is reported back to the caller so the stray
//! reply can be logged and discarded.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use super::envelope::{JsonRpcError, RequestId};

/// Failure of one correlated request, before taxonomy mapping.
///
/// Adapters translate these into typed gateway errors with service and
/// operation context attached.
#[derive(Debug, Clone)]
pub enum RpcFailure {
    /// The backend answered with a JSON-RPC error object.
    Rpc(JsonRpcError),
    /// The transport dropped while the request was in flight.
    ConnectionLost(String),
}

/// Outcome of one correlated request.
pub type RpcOutcome = Result<serde_json::Value, RpcFailure>;

/// Identifier-keyed table of in-flight requests.
pub struct PendingRequests {
    inner: Mutex<HashMap<RequestId, oneshot::Sender<RpcOutcome>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Insert an entry for `id` and hand back the receiving half.
    pub fn register(&self, id: RequestId) -> oneshot::Receiver<RpcOutcome> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        rx
    }

    /// Resolve the entry for `id`, removing it.
    ///
    /// Returns `false` when no entry exists — either the reply is late (the
    /// deadline already removed the entry) or it was never ours. A second
    /// resolution for the same id is therefore a no-op.
    pub fn resolve(&self, id: &RequestId, outcome: RpcOutcome) -> bool {
        match self.lock().remove(id) {
            Some(tx) => {
                // The caller may have given up; a dropped receiver is fine.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop the entry for `id` without resolving it (deadline expiry).
    pub fn remove(&self, id: &RequestId) {
        self.lock().remove(id);
    }

    /// Fail every in-flight request as lost (transport dropped).
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(RpcFailure::ConnectionLost(reason.to_string())));
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, oneshot::Sender<RpcOutcome>>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_delivers_once() {
        let pending = PendingRequests::new();
        let rx = pending.register(RequestId::Number(1));

        assert!(pending.resolve(&RequestId::Number(1), Ok(serde_json::json!({"ok": true}))));
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.unwrap()["ok"], true);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_second_resolution_is_noop() {
        let pending = PendingRequests::new();
        let _rx = pending.register(RequestId::Number(1));

        assert!(pending.resolve(&RequestId::Number(1), Ok(serde_json::Value::Null)));
        assert!(!pending.resolve(&RequestId::Number(1), Ok(serde_json::Value::Null)));
    }

    #[tokio::test]
    async fn test_unknown_id_is_reported() {
        let pending = PendingRequests::new();
        assert!(!pending.resolve(&RequestId::String("ghost".into()), Ok(serde_json::Value::Null)));
    }

    #[tokio::test]
    async fn test_remove_then_late_reply_discarded() {
        let pending = PendingRequests::new();
        let rx = pending.register(RequestId::Number(7));

        // Deadline expiry removes the entry...
        pending.remove(&RequestId::Number(7));
        assert!(pending.is_empty());

        // ...so the late reply resolves nothing and the waiter sees a closed
        // channel rather than a value.
        assert!(!pending.resolve(&RequestId::Number(7), Ok(serde_json::Value::Null)));
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_fail_all_drains_every_entry() {
        let pending = PendingRequests::new();
        let rx1 = pending.register(RequestId::Number(1));
        let rx2 = pending.register(RequestId::Number(2));

        pending.fail_all("process exited");

        assert!(pending.is_empty());
        for rx in [rx1, rx2] {
            match rx.await.unwrap() {
                Err(RpcFailure::ConnectionLost(reason)) => {
                    assert_eq!(reason, "process exited");
                }
                other => panic!("expected ConnectionLost, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_string_and_number_ids_do_not_collide() {
        let pending = PendingRequests::new();
        let rx_num = pending.register(RequestId::Number(1));
        let rx_str = pending.register(RequestId::String("1".into()));

        assert!(pending.resolve(&RequestId::String("1".into()), Ok(serde_json::json!("s"))));
        assert_eq!(pending.len(), 1);

        assert!(pending.resolve(&RequestId::Number(1), Ok(serde_json::json!("n"))));
        assert_eq!(rx_str.await.unwrap().unwrap(), "s");
        assert_eq!(rx_num.await.unwrap().unwrap(), "n");
    }
}
