//! Downstream MCP client
//!
//! Protocol state machine over a [`Transport`]: runs the initialize
//! handshake, keeps the last `tools/list` result, dispatches `tools/call`
//! responses by id, and turns downstream notifications into bus events.
//!
//! Errors are passed through untransformed: a downstream tool failure
//! (`isError: true`) is a *successful* call whose payload says so, while a
//! JSON-RPC error object surfaces as [`McpError::Rpc`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use mcpmu_events::{EventBus, GatewayEvent};

use crate::error::{McpError, McpResult};
use crate::protocol::methods;
use crate::protocol::{
    ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcErrorCode, JsonRpcRequest, JsonRpcResponse, Tool, ToolsCallParams, ToolsListResult,
};
use crate::transport::{Transport, TransportEvent};

/// Deadline for the `tools/list` issued after the handshake and after
/// `list_changed` notifications
const LIST_TOOLS_TIMEOUT: Duration = Duration::from_secs(30);

/// Client lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    New,
    Initializing,
    Ready,
    Closing,
    Closed,
    Failed,
}

impl ClientState {
    fn name(&self) -> &'static str {
        match self {
            ClientState::New => "new",
            ClientState::Initializing => "initializing",
            ClientState::Ready => "ready",
            ClientState::Closing => "closing",
            ClientState::Closed => "closed",
            ClientState::Failed => "failed",
        }
    }
}

/// Why the transport went away
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloseReason {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub message: Option<String>,
}

struct ClientInner {
    server_name: String,
    transport: Arc<dyn Transport>,
    state: RwLock<ClientState>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<McpResult<Value>>>>,
    tools: RwLock<Vec<Tool>>,
    bus: EventBus,
    closed_tx: watch::Sender<Option<CloseReason>>,
}

impl ClientInner {
    fn state(&self) -> ClientState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ClientState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Send a request and await its response under `deadline`.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> McpResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        let request = JsonRpcRequest::new(method, params, id);
        let message = serde_json::to_value(&request)?;

        let outcome = tokio::time::timeout(deadline, async {
            self.transport.send(message).await?;
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(McpError::transport_closed("response channel dropped")),
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                // Deadline elapsed: forget the waiter. The downstream may
                // still execute the call; at-most-once is not guaranteed
                // from its point of view.
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                Err(McpError::Cancelled)
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        let notification = JsonRpcRequest::notification(method, params);
        self.transport
            .send(serde_json::to_value(&notification)?)
            .await
    }

    /// Re-list tools and publish the result on the bus.
    async fn refresh_tools(&self) -> McpResult<()> {
        let result = self
            .request(methods::TOOLS_LIST, None, LIST_TOOLS_TIMEOUT)
            .await?;
        let listed: ToolsListResult = serde_json::from_value(result)?;
        let count = listed.tools.len();
        *self.tools.write().unwrap_or_else(|e| e.into_inner()) = listed.tools;
        let _ = self.bus.publish(GatewayEvent::ToolsUpdated {
            server: self.server_name.clone(),
            count,
        });
        Ok(())
    }

    /// Fail every in-flight request with an error from `make_error`.
    fn fail_pending(&self, make_error: impl Fn() -> McpError) {
        let waiters: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (_, tx) in waiters {
            let _ = tx.send(Err(make_error()));
        }
    }

    fn dispatch_response(&self, value: Value) {
        let Some(id) = value.get("id").and_then(Value::as_u64) else {
            debug!(server = %self.server_name, "response with unrecognized id, ignoring");
            return;
        };
        let Some(tx) = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
        else {
            // Cancelled or duplicate; nothing waits for it anymore.
            return;
        };
        let outcome = if let Some(error) = value.get("error") {
            Err(McpError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-32603),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            })
        } else {
            Ok(value.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = tx.send(outcome);
    }

    async fn handle_inbound_request(&self, value: &Value) {
        let method = value.get("method").and_then(Value::as_str).unwrap_or("");
        let id = value.get("id").cloned();
        let response = if method == methods::PING {
            JsonRpcResponse::success(id, json!({}))
        } else {
            JsonRpcResponse::error(
                id,
                JsonRpcError::new(
                    JsonRpcErrorCode::MethodNotFound,
                    format!("method not supported: {method}"),
                ),
            )
        };
        if let Ok(message) = serde_json::to_value(&response) {
            let _ = self.transport.send(message).await;
        }
    }

    fn handle_notification(&self, value: &Value, refresh_tx: &mpsc::UnboundedSender<()>) {
        let method = value.get("method").and_then(Value::as_str).unwrap_or("");
        match method {
            methods::NOTIFICATION_TOOLS_LIST_CHANGED => {
                let _ = refresh_tx.send(());
            }
            methods::NOTIFICATION_MESSAGE => {
                let line = value
                    .get("params")
                    .map(|p| {
                        p.get("data")
                            .map(|d| match d {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .unwrap_or_else(|| p.to_string())
                    })
                    .unwrap_or_default();
                let _ = self.bus.publish(GatewayEvent::LogReceived {
                    server: self.server_name.clone(),
                    line,
                });
            }
            other => {
                debug!(server = %self.server_name, method = other, "ignoring unknown notification");
            }
        }
    }
}

/// A connected downstream MCP server.
pub struct McpClient {
    inner: Arc<ClientInner>,
    closed_rx: watch::Receiver<Option<CloseReason>>,
}

impl McpClient {
    /// Run the handshake over an already-constructed transport and return a
    /// ready client. Fails with [`McpError::StartupTimeout`] when the
    /// downstream does not answer `initialize` within `startup_timeout`.
    pub async fn start(
        server_name: impl Into<String>,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
        bus: EventBus,
        startup_timeout: Duration,
    ) -> McpResult<McpClient> {
        let (closed_tx, closed_rx) = watch::channel(None);
        let inner = Arc::new(ClientInner {
            server_name: server_name.into(),
            transport,
            state: RwLock::new(ClientState::New),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            tools: RwLock::new(Vec::new()),
            bus,
            closed_tx,
        });

        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(Arc::clone(&inner), events, refresh_tx));
        tokio::spawn(refresh_loop(Arc::clone(&inner), refresh_rx));

        inner.set_state(ClientState::Initializing);
        let params = InitializeParams {
            protocol_version: crate::MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: Some(ClientInfo {
                name: "mcpmu".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            }),
        };
        let result = inner
            .request(
                methods::INITIALIZE,
                Some(serde_json::to_value(&params)?),
                startup_timeout,
            )
            .await
            .map_err(|err| match err {
                McpError::Cancelled => McpError::StartupTimeout {
                    timeout: startup_timeout,
                },
                other => {
                    inner.set_state(ClientState::Failed);
                    other
                }
            })?;

        match serde_json::from_value::<InitializeResult>(result) {
            Ok(init) => {
                debug!(
                    server = %inner.server_name,
                    downstream = %init.server_info.name,
                    version = %init.protocol_version,
                    "initialize complete"
                );
            }
            Err(err) => {
                inner.set_state(ClientState::Failed);
                return Err(McpError::protocol(format!("malformed initialize result: {err}")));
            }
        }

        inner
            .notify(methods::NOTIFICATION_INITIALIZED, None)
            .await?;
        inner.set_state(ClientState::Ready);

        inner.refresh_tools().await?;

        Ok(McpClient { inner, closed_rx })
    }

    /// Server name this client belongs to.
    pub fn server_name(&self) -> &str {
        &self.inner.server_name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    /// Last `tools/list` result.
    pub fn tools(&self) -> Vec<Tool> {
        self.inner
            .tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Invoke a tool. Only accepted in `ready`; the result payload is
    /// returned verbatim, including `isError` results.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        deadline: Duration,
    ) -> McpResult<Value> {
        let state = self.inner.state();
        if state != ClientState::Ready {
            return Err(McpError::InvalidState {
                expected: "ready",
                actual: state.name(),
            });
        }
        let params = ToolsCallParams {
            name: name.to_string(),
            arguments,
        };
        self.inner
            .request(
                methods::TOOLS_CALL,
                Some(serde_json::to_value(&params)?),
                deadline,
            )
            .await
    }

    /// Wait until the transport terminates and return the reason.
    pub async fn wait_closed(&self) -> CloseReason {
        let mut rx = self.closed_rx.clone();
        loop {
            if let Some(reason) = rx.borrow().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return CloseReason::default();
            }
        }
    }

    /// Whether the transport already terminated.
    pub fn is_closed(&self) -> bool {
        self.closed_rx.borrow().is_some()
    }

    /// Watch channel that resolves to `Some(reason)` when the transport
    /// terminates. Lets owners select on closure without borrowing the
    /// client.
    pub fn closed_watch(&self) -> watch::Receiver<Option<CloseReason>> {
        self.closed_rx.clone()
    }

    /// Cancel in-flight calls and close the transport. MCP defines no
    /// shutdown RPC, so nothing is sent.
    pub async fn close(&self) {
        self.inner.set_state(ClientState::Closing);
        self.inner.fail_pending(|| McpError::Cancelled);
        let _ = self.inner.transport.close().await;
        self.inner.set_state(ClientState::Closed);
    }
}

async fn read_loop(
    inner: Arc<ClientInner>,
    mut events: mpsc::Receiver<TransportEvent>,
    refresh_tx: mpsc::UnboundedSender<()>,
) {
    loop {
        let Some(event) = events.recv().await else {
            finish(&inner, CloseReason::default());
            break;
        };
        match event {
            TransportEvent::Message(value) => {
                let has_method = value.get("method").is_some();
                let has_id = value.get("id").is_some();
                match (has_method, has_id) {
                    (true, true) => inner.handle_inbound_request(&value).await,
                    (true, false) => inner.handle_notification(&value, &refresh_tx),
                    (false, _) => inner.dispatch_response(value),
                }
            }
            TransportEvent::Stderr(line) => {
                let _ = inner.bus.publish(GatewayEvent::LogReceived {
                    server: inner.server_name.clone(),
                    line,
                });
            }
            TransportEvent::Closed {
                code,
                signal,
                message,
            } => {
                finish(
                    &inner,
                    CloseReason {
                        code,
                        signal,
                        message,
                    },
                );
                break;
            }
        }
    }
}

fn finish(inner: &ClientInner, reason: CloseReason) {
    inner.fail_pending(|| McpError::transport_closed("transport terminated"));
    if inner.state() != ClientState::Closing {
        inner.set_state(ClientState::Closed);
    }
    let _ = inner.closed_tx.send(Some(reason));
}

async fn refresh_loop(inner: Arc<ClientInner>, mut refresh_rx: mpsc::UnboundedReceiver<()>) {
    while refresh_rx.recv().await.is_some() {
        if inner.state() != ClientState::Ready {
            continue;
        }
        if let Err(err) = inner.refresh_tools().await {
            warn!(server = %inner.server_name, error = %err, "tool refresh failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Transport double that answers the protocol from a canned script.
    struct ScriptedTransport {
        events_tx: mpsc::Sender<TransportEvent>,
        sent: Mutex<Vec<Value>>,
        tools: Vec<Tool>,
    }

    impl ScriptedTransport {
        fn create(tools: Vec<Tool>) -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
            let (events_tx, events_rx) = mpsc::channel(64);
            (
                Arc::new(Self {
                    events_tx,
                    sent: Mutex::new(Vec::new()),
                    tools,
                }),
                events_rx,
            )
        }

        fn sent_methods(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|m| m.get("method").and_then(Value::as_str).map(str::to_string))
                .collect()
        }

        async fn push(&self, value: Value) {
            self.events_tx
                .send(TransportEvent::Message(value))
                .await
                .unwrap();
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, message: Value) -> McpResult<()> {
            self.sent.lock().unwrap().push(message.clone());
            let id = message.get("id").cloned();
            let method = message.get("method").and_then(Value::as_str).unwrap_or("");
            let reply = match method {
                methods::INITIALIZE => Some(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "protocolVersion": "2024-11-05",
                        "capabilities": {"tools": {"listChanged": true}},
                        "serverInfo": {"name": "scripted", "version": "0.0.1"}
                    }
                })),
                methods::TOOLS_LIST => Some(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"tools": self.tools}
                })),
                methods::TOOLS_CALL => {
                    let name = message["params"]["name"].as_str().unwrap_or("");
                    if name == "explode" {
                        Some(json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": {"code": -32000, "message": "tool exploded"}
                        }))
                    } else {
                        Some(json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "result": {
                                "content": [{"type": "text", "text": format!("called {name}")}],
                                "isError": name == "fails"
                            }
                        }))
                    }
                }
                _ => None,
            };
            if let Some(reply) = reply {
                let _ = self.events_tx.send(TransportEvent::Message(reply)).await;
            }
            Ok(())
        }

        async fn close(&self) -> McpResult<()> {
            let _ = self
                .events_tx
                .send(TransportEvent::Closed {
                    code: None,
                    signal: None,
                    message: Some("closed".to_string()),
                })
                .await;
            Ok(())
        }
    }

    fn sample_tools() -> Vec<Tool> {
        vec![
            Tool::new("read_file", "Read a file", json!({"type": "object"})),
            Tool::new("fs.read_file", "Dotted name", json!({"type": "object"})),
        ]
    }

    async fn ready_client() -> (McpClient, Arc<ScriptedTransport>, EventBus) {
        let bus = EventBus::new();
        let (transport, events) = ScriptedTransport::create(sample_tools());
        let client = McpClient::start(
            "svr",
            Arc::clone(&transport) as Arc<dyn Transport>,
            events,
            bus.clone(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        (client, transport, bus)
    }

    #[tokio::test]
    async fn handshake_reaches_ready_and_lists_tools() {
        let (client, transport, _bus) = ready_client().await;
        assert_eq!(client.state(), ClientState::Ready);
        assert_eq!(client.tools().len(), 2);

        let methods = transport.sent_methods();
        assert_eq!(
            methods,
            vec![
                methods::INITIALIZE.to_string(),
                methods::NOTIFICATION_INITIALIZED.to_string(),
                methods::TOOLS_LIST.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn call_tool_round_trips_verbatim() {
        let (client, _transport, _bus) = ready_client().await;
        let result = client
            .call_tool("read_file", Some(json!({"path": "/x"})), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "called read_file");
        assert_eq!(result["isError"], false);
    }

    #[tokio::test]
    async fn is_error_payload_is_not_an_rpc_error() {
        let (client, _transport, _bus) = ready_client().await;
        let result = client
            .call_tool("fails", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result["isError"], true);
    }

    #[tokio::test]
    async fn rpc_error_surfaces_with_code() {
        let (client, _transport, _bus) = ready_client().await;
        let err = client
            .call_tool("explode", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            McpError::Rpc { code, message } => {
                assert_eq!(code, -32000);
                assert_eq!(message, "tool exploded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn list_changed_notification_triggers_refresh() {
        let (client, transport, bus) = ready_client().await;
        let mut sub = bus.subscribe();

        transport
            .push(json!({
                "jsonrpc": "2.0",
                "method": methods::NOTIFICATION_TOOLS_LIST_CHANGED
            }))
            .await;

        // The refresh publishes a fresh ToolsUpdated event.
        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, GatewayEvent::ToolsUpdated { count: 2, .. }));
        assert_eq!(client.tools().len(), 2);
    }

    #[tokio::test]
    async fn log_notification_becomes_bus_event() {
        let (_client, transport, bus) = ready_client().await;
        let mut sub = bus.subscribe();

        transport
            .push(json!({
                "jsonrpc": "2.0",
                "method": methods::NOTIFICATION_MESSAGE,
                "params": {"level": "info", "data": "downstream says hi"}
            }))
            .await;

        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            GatewayEvent::LogReceived { server, line } => {
                assert_eq!(server, "svr");
                assert_eq!(line, "downstream says hi");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_close_fails_calls_and_reports_reason() {
        let (client, transport, _bus) = ready_client().await;
        transport.close().await.unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(5), client.wait_closed())
            .await
            .unwrap();
        assert_eq!(reason.message.as_deref(), Some("closed"));
        assert!(client.is_closed());

        let err = client
            .call_tool("read_file", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn calls_outside_ready_are_rejected() {
        let (client, _transport, _bus) = ready_client().await;
        client.close().await;
        let err = client
            .call_tool("read_file", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::InvalidState { .. }));
    }
}
