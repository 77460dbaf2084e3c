//! Child-process transport.
//!
//! Spawns the configured command and speaks newline-delimited JSON-RPC over
//! its standard streams. Standard error is captured for diagnostics only and
//! never parsed as protocol data. Concurrent calls are multiplexed over the
//! single stream and matched by request id, not arrival order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};

use crate::errors::GatewayError;
use crate::protocol::types::{
    CallToolRequest, CallToolResult, InitializeParams, InitializeResult, ListToolsResult, Tool,
};
use crate::protocol::RpcSession;
use crate::state::{ServiceState, StateManager};

use super::{
    decode_payload, map_call_error, map_init_error, map_list_error, ServiceAdapter, INIT_TIMEOUT,
    REQUEST_TIMEOUT,
};

/// Grace period between stdin EOF and SIGKILL on close.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Stderr lines retained for error context.
const STDERR_TAIL_LINES: usize = 20;

/// Cap on stderr text appended to error messages.
const STDERR_TAIL_CHARS: usize = 2000;

// ─── StdioAdapter ───────────────────────────────────────────────────────────

/// Adapter owning one child process and its stdio session.
pub struct StdioAdapter {
    service_id: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<String>,
    states: Arc<StateManager>,
    live: Mutex<Option<LiveProcess>>,
}

struct LiveProcess {
    session: Arc<RpcSession>,
    /// Tells the exit watcher the close is deliberate.
    shutdown_tx: oneshot::Sender<()>,
}

impl StdioAdapter {
    pub fn new(
        service_id: &str,
        command: &str,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<String>,
        states: Arc<StateManager>,
    ) -> Self {
        Self {
            service_id: service_id.to_string(),
            command: command.to_string(),
            args,
            env,
            cwd,
            states,
            live: Mutex::new(None),
        }
    }

    async fn session(&self) -> Result<Arc<RpcSession>, GatewayError> {
        let live = self.live.lock().await;
        match live.as_ref() {
            Some(process) if process.session.is_connected() => Ok(Arc::clone(&process.session)),
            _ => Err(GatewayError::NotConnected {
                service: self.service_id.clone(),
            }),
        }
    }

    /// Drive `RUNNING → ERROR` when an operation discovers the session is
    /// gone, so subscribers observe the failure before the caller does.
    fn note_failure(&self, error: &GatewayError) {
        if error.is_connection_loss() && self.states.get(&self.service_id) == ServiceState::Running
        {
            let _ = self.states.set(&self.service_id, ServiceState::Error);
        }
    }

    fn spawn_child(&self) -> Result<Child, GatewayError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        cmd.spawn().map_err(|e| GatewayError::Connection {
            service: self.service_id.clone(),
            reason: format!("failed to spawn '{}': {e}", self.command),
        })
    }
}

#[async_trait]
impl ServiceAdapter for StdioAdapter {
    async fn initialize(&self) -> Result<InitializeResult, GatewayError> {
        let mut live = self.live.lock().await;
        if let Some(process) = live.as_ref() {
            if process.session.is_connected() {
                return Err(GatewayError::Handshake {
                    service: self.service_id.clone(),
                    reason: "already initialized".into(),
                });
            }
        }

        self.states.set(&self.service_id, ServiceState::Starting)?;

        let mut child = match self.spawn_child() {
            Ok(child) => child,
            Err(e) => {
                let _ = self.states.set(&self.service_id, ServiceState::Error);
                return Err(e);
            }
        };

        // These are always piped; a missing handle means spawn itself broke.
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            let _ = self.states.set(&self.service_id, ServiceState::Error);
            return Err(GatewayError::Connection {
                service: self.service_id.clone(),
                reason: "failed to capture child stdio".into(),
            });
        };

        let stderr_tail = spawn_stderr_capture(&self.service_id, stderr);
        let session = RpcSession::spawn(&self.service_id, stdout, stdin, REQUEST_TIMEOUT);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        spawn_exit_watcher(
            self.service_id.clone(),
            child,
            Arc::clone(&session),
            Arc::clone(&self.states),
            shutdown_rx,
        );

        // Protocol initialization exchange.
        let params = serde_json::to_value(InitializeParams::for_gateway()).ok();
        let payload = match session
            .request_with_timeout("initialize", params, INIT_TIMEOUT)
            .await
        {
            Ok(payload) => payload,
            Err(e) => {
                let suffix = stderr_suffix(&stderr_tail);
                session.shutdown().await;
                let _ = shutdown_tx.send(());
                let _ = self.states.set(&self.service_id, ServiceState::Error);
                return Err(with_stderr_context(
                    map_init_error(&self.service_id, e),
                    &suffix,
                ));
            }
        };

        let init: InitializeResult = match decode_payload(&self.service_id, "initialize", payload)
        {
            Ok(init) => init,
            Err(e) => {
                session.shutdown().await;
                let _ = shutdown_tx.send(());
                let _ = self.states.set(&self.service_id, ServiceState::Error);
                return Err(GatewayError::Handshake {
                    service: self.service_id.clone(),
                    reason: e.to_string(),
                });
            }
        };

        // Completes the lifecycle handshake; real backends wait for this.
        if let Err(e) = session.notify("notifications/initialized", None).await {
            session.shutdown().await;
            let _ = shutdown_tx.send(());
            let _ = self.states.set(&self.service_id, ServiceState::Error);
            return Err(map_init_error(&self.service_id, e));
        }

        self.states.set(&self.service_id, ServiceState::Running)?;
        tracing::info!(
            service = %self.service_id,
            server = %init.server_info.name,
            version = %init.server_info.version,
            "stdio service initialized"
        );

        *live = Some(LiveProcess {
            session,
            shutdown_tx,
        });
        Ok(init)
    }

    async fn list_tools(&self) -> Result<Vec<Tool>, GatewayError> {
        let session = self.session().await?;
        let payload = session.request("tools/list", None).await.map_err(|e| {
            let mapped = map_list_error(&self.service_id, e);
            self.note_failure(&mapped);
            mapped
        })?;

        let list: ListToolsResult = decode_payload(&self.service_id, "tools/list", payload)?;
        Ok(list.tools)
    }

    async fn call_tool(&self, request: CallToolRequest) -> Result<CallToolResult, GatewayError> {
        let session = self.session().await?;
        let params = serde_json::json!({
            "name": request.name,
            "arguments": request.arguments,
        });

        let payload = session
            .request("tools/call", Some(params))
            .await
            .map_err(|e| {
                let mapped = map_call_error(&self.service_id, &request.name, e);
                self.note_failure(&mapped);
                mapped
            })?;

        decode_payload(&self.service_id, "tools/call", payload)
    }

    async fn close(&self) {
        let Some(process) = self.live.lock().await.take() else {
            return;
        };

        // Stdin EOF first; the watcher gives the child a grace period before
        // killing it.
        process.session.shutdown().await;
        let _ = process.shutdown_tx.send(());
    }
}

// ─── Background tasks ───────────────────────────────────────────────────────

/// Waits on the child. An exit nobody asked for fails all in-flight requests
/// and drives the `ERROR` transition; a signalled shutdown waits out the
/// grace period, then kills.
fn spawn_exit_watcher(
    service_id: String,
    mut child: Child,
    session: Arc<RpcSession>,
    states: Arc<StateManager>,
    shutdown_rx: oneshot::Receiver<()>,
) {
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                let status = match status {
                    Ok(status) => status.to_string(),
                    Err(e) => format!("wait failed: {e}"),
                };
                tracing::warn!(
                    service = %service_id,
                    status = %status,
                    "service process exited unexpectedly"
                );
                session.mark_disconnected(&format!("process exited: {status}"));
                let current = states.get(&service_id);
                if current == ServiceState::Running || current == ServiceState::Starting {
                    let _ = states.set(&service_id, ServiceState::Error);
                }
            }
            _ = shutdown_rx => {
                match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                    Ok(_) => {}
                    Err(_) => {
                        tracing::debug!(
                            service = %service_id,
                            "service ignored stdin EOF, killing"
                        );
                        let _ = child.kill().await;
                    }
                }
            }
        }
    });
}

/// Reads stderr line by line into the log, retaining a bounded tail for
/// error-message context.
fn spawn_stderr_capture(
    service_id: &str,
    stderr: tokio::process::ChildStderr,
) -> Arc<std::sync::Mutex<VecDeque<String>>> {
    let tail = Arc::new(std::sync::Mutex::new(VecDeque::new()));
    let service_id = service_id.to_string();
    let task_tail = Arc::clone(&tail);

    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(service = %service_id, stderr = %line, "service stderr");
            let mut tail = task_tail
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    });

    tail
}

fn stderr_suffix(tail: &Arc<std::sync::Mutex<VecDeque<String>>>) -> String {
    let tail = tail
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    if tail.is_empty() {
        return String::new();
    }
    let mut joined = tail.iter().cloned().collect::<Vec<_>>().join(" | ");
    if joined.len() > STDERR_TAIL_CHARS {
        joined.truncate(STDERR_TAIL_CHARS);
        joined.push_str("...(truncated)");
    }
    joined
}

fn with_stderr_context(error: GatewayError, suffix: &str) -> GatewayError {
    if suffix.is_empty() {
        return error;
    }
    match error {
        GatewayError::Connection { service, reason } => GatewayError::Connection {
            service,
            reason: format!("{reason} | stderr: {suffix}"),
        },
        GatewayError::Handshake { service, reason } => GatewayError::Handshake {
            service,
            reason: format!("{reason} | stderr: {suffix}"),
        },
        other => other,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::ContentBlock;

    fn adapter_for(command: &str, args: &[&str]) -> (StdioAdapter, Arc<StateManager>) {
        let states = Arc::new(StateManager::new());
        states.register("svc");
        let adapter = StdioAdapter::new(
            "svc",
            command,
            args.iter().map(|s| s.to_string()).collect(),
            HashMap::new(),
            None,
            Arc::clone(&states),
        );
        (adapter, states)
    }

    /// Scripted echo backend: answers initialize, swallows the initialized
    /// notification, then serves one tools/list and one tools/call.
    const ECHO_SCRIPT: &str = r#"
read line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-03-26","capabilities":{"tools":{}},"serverInfo":{"name":"echo-server","version":"1.0.0"}}}'
read line
read line
printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"Echo text back","inputSchema":{"type":"object","properties":{"text":{"type":"string"}}}}]}}'
read line
printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"hi"}],"isError":false}}'
read line
"#;

    #[tokio::test]
    async fn test_spawn_failure_is_connection_error() {
        let (adapter, states) = adapter_for("/nonexistent/mcp-server-binary", &[]);

        let err = adapter.initialize().await.unwrap_err();
        assert!(matches!(err, GatewayError::Connection { .. }));
        assert_eq!(states.get("svc"), ServiceState::Error);
    }

    #[tokio::test]
    async fn test_operations_before_initialize_are_not_connected() {
        let (adapter, _states) = adapter_for("true", &[]);

        assert!(matches!(
            adapter.list_tools().await.unwrap_err(),
            GatewayError::NotConnected { .. }
        ));
        assert!(matches!(
            adapter
                .call_tool(CallToolRequest::new("echo", serde_json::json!({})))
                .await
                .unwrap_err(),
            GatewayError::NotConnected { .. }
        ));
    }

    #[tokio::test]
    async fn test_echo_scenario_over_real_process() {
        let (adapter, states) = adapter_for("sh", &["-c", ECHO_SCRIPT]);

        let init = adapter.initialize().await.unwrap();
        assert_eq!(init.server_info.name, "echo-server");
        assert!(init.capabilities.supports_tools());
        assert_eq!(states.get("svc"), ServiceState::Running);

        let tools = adapter.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let result = adapter
            .call_tool(CallToolRequest::new(
                "echo",
                serde_json::json!({"text": "hi"}),
            ))
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(
            result.content,
            vec![ContentBlock::Text { text: "hi".into() }]
        );

        adapter.close().await;
        assert!(matches!(
            adapter.list_tools().await.unwrap_err(),
            GatewayError::NotConnected { .. }
        ));
    }

    #[tokio::test]
    async fn test_unexpected_exit_fails_pending_and_enters_error() {
        // Backend answers initialize, accepts one more request, then dies
        // without replying — leaving that call pending at exit time.
        let script = r#"
read line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-03-26","capabilities":{"tools":{}},"serverInfo":{"name":"flaky","version":"0"}}}'
read line
read line
exit 1
"#;
        let (adapter, states) = adapter_for("sh", &["-c", script]);
        adapter.initialize().await.unwrap();
        assert_eq!(states.get("svc"), ServiceState::Running);

        // A healthy sibling on the same state manager.
        let sibling_states = Arc::clone(&states);
        sibling_states.register("sibling");
        let sibling = StdioAdapter::new(
            "sibling",
            "sh",
            vec!["-c".into(), ECHO_SCRIPT.into()],
            HashMap::new(),
            None,
            Arc::clone(&sibling_states),
        );
        sibling.initialize().await.unwrap();

        let err = adapter
            .call_tool(CallToolRequest::new("echo", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Connection { .. }));

        // The exit watcher drives the transition.
        for _ in 0..50 {
            if states.get("svc") == ServiceState::Error {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(states.get("svc"), ServiceState::Error);

        // The unrelated running adapter is unaffected.
        assert_eq!(states.get("sibling"), ServiceState::Running);
        let tools = sibling.list_tools().await.unwrap();
        assert_eq!(tools[0].name, "echo");
        sibling.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (adapter, _states) = adapter_for("true", &[]);
        adapter.close().await;
        adapter.close().await;
    }
}
