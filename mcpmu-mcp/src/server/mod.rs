//! Upstream MCP server facade
//!
//! Presents the aggregated gateway as a single MCP server over stdio, using
//! the same line-delimited JSON-RPC framing as the stdio transport. Requests
//! are handled by a bounded pool of tasks; responses and notifications go
//! through a single-writer mutex so frames never interleave.
//!
//! Manager tools live under the reserved `mcpmu.` prefix. They are hidden
//! from `tools/list` unless the facade was started with
//! `expose_manager_tools`, but remain callable either way so a managing
//! client can script lifecycle changes.

mod manager;

pub use manager::manager_tools;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use mcpmu_events::{EventBus, GatewayEvent};

use crate::error::McpResult;
use crate::protocol::methods;
use crate::protocol::{
    negotiate_protocol_version, InitializeResult, JsonRpcError, JsonRpcErrorCode, JsonRpcResponse,
    ServerCapabilities, ServerInfo, Tool, ToolsCallParams, ToolsCapability, ToolsListResult,
};

/// Reserved prefix for gateway-management tools
pub const MANAGER_TOOL_PREFIX: &str = "mcpmu.";

/// Default bound on concurrently handled upstream requests
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

/// Routing errors surfaced to the upstream client.
///
/// `NotFound` and `PermissionDenied` map to JSON-RPC `-32602`; everything
/// else becomes `-32603` with the kind in the message.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Unknown name, or server outside the active namespace / disabled
    #[error("{0}")]
    NotFound(String),

    /// Denied by namespace policy
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Malformed arguments to a manager tool
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Downstream unavailable or internal failure
    #[error("{0}")]
    Internal(String),
}

impl RouterError {
    fn to_jsonrpc(&self) -> JsonRpcError {
        match self {
            RouterError::NotFound(_)
            | RouterError::PermissionDenied(_)
            | RouterError::InvalidParams(_) => {
                JsonRpcError::new(JsonRpcErrorCode::InvalidParams, self.to_string())
            }
            RouterError::Internal(_) => {
                JsonRpcError::new(JsonRpcErrorCode::InternalError, self.to_string())
            }
        }
    }
}

/// What the facade needs from the aggregation layer.
#[async_trait]
pub trait GatewayHandler: Send + Sync {
    /// Qualified tools of the active namespace, permission-filtered.
    async fn list_tools(&self) -> Vec<Tool>;

    /// Route a qualified `tools/call` to its downstream; the result payload
    /// is forwarded verbatim.
    async fn call_tool(
        &self,
        qualified_name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, RouterError>;

    /// Status of every configured server.
    async fn servers_list(&self) -> Result<Value, RouterError>;

    /// Start a server by name.
    async fn server_start(&self, name: &str) -> Result<Value, RouterError>;

    /// Stop a server by name.
    async fn server_stop(&self, name: &str) -> Result<Value, RouterError>;

    /// Switch the active namespace.
    async fn namespace_set(&self, name: &str) -> Result<Value, RouterError>;

    /// Set a tool permission override in the active (or named) namespace.
    async fn permission_set(
        &self,
        namespace: Option<&str>,
        server: &str,
        tool: &str,
        enabled: bool,
    ) -> Result<Value, RouterError>;
}

/// The stdio MCP server facade.
pub struct GatewayServer<H> {
    handler: Arc<H>,
    bus: EventBus,
    expose_manager_tools: bool,
    max_in_flight: usize,
}

impl<H: GatewayHandler + 'static> GatewayServer<H> {
    pub fn new(handler: Arc<H>, bus: EventBus) -> Self {
        Self {
            handler,
            bus,
            expose_manager_tools: false,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    /// Include manager tools in `tools/list` output.
    pub fn expose_manager_tools(mut self, expose: bool) -> Self {
        self.expose_manager_tools = expose;
        self
    }

    /// Override the in-flight request bound.
    pub fn max_in_flight(mut self, bound: usize) -> Self {
        self.max_in_flight = bound;
        self
    }

    /// Serve on the process's stdin/stdout.
    pub async fn serve_stdio(self) -> McpResult<()> {
        self.run(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve on arbitrary streams (tests use in-memory pipes).
    pub async fn run<R, W>(self, reader: R, writer: W) -> McpResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer = Arc::new(Mutex::new(writer));
        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        let in_flight: Arc<std::sync::Mutex<HashMap<String, AbortHandle>>> =
            Arc::new(std::sync::Mutex::new(HashMap::new()));

        // Whenever the aggregator's view changes, tell the upstream client.
        let notifier = tokio::spawn(forward_list_changed(
            self.bus.subscribe(),
            Arc::clone(&writer),
        ));

        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(trimmed) {
                Ok(value) => value,
                Err(err) => {
                    write_response(
                        &writer,
                        &JsonRpcResponse::error(
                            None,
                            JsonRpcError::new(
                                JsonRpcErrorCode::ParseError,
                                format!("parse error: {err}"),
                            ),
                        ),
                    )
                    .await;
                    continue;
                }
            };

            let method = value.get("method").and_then(Value::as_str).unwrap_or("");
            let id = value.get("id").cloned();
            let params = value.get("params").cloned();

            match (method, id) {
                (methods::INITIALIZE, id) => {
                    let client_version = params
                        .as_ref()
                        .and_then(|p| p.get("protocolVersion"))
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    let result = InitializeResult {
                        protocol_version: negotiate_protocol_version(client_version),
                        capabilities: ServerCapabilities {
                            tools: Some(ToolsCapability { list_changed: true }),
                            ..Default::default()
                        },
                        server_info: ServerInfo {
                            name: "mcpmu".to_string(),
                            version: env!("CARGO_PKG_VERSION").to_string(),
                        },
                    };
                    write_response(
                        &writer,
                        &JsonRpcResponse::success(id, serde_json::to_value(&result)?),
                    )
                    .await;
                }
                (m, _) if methods::is_initialized_notification(m) => {}
                (methods::PING, Some(id)) => {
                    write_response(&writer, &JsonRpcResponse::success(Some(id), json!({}))).await;
                }
                (methods::NOTIFICATION_CANCELLED, None) => {
                    let request_id = params
                        .as_ref()
                        .and_then(|p| p.get("requestId"))
                        .map(id_key);
                    if let Some(key) = request_id {
                        let handle = in_flight
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .remove(&key);
                        if let Some(handle) = handle {
                            debug!(id = %key, "cancelling in-flight request");
                            handle.abort();
                        }
                    }
                }
                (methods::TOOLS_LIST, Some(id)) => {
                    let semaphore = Arc::clone(&semaphore);
                    let handler = Arc::clone(&self.handler);
                    let writer = Arc::clone(&writer);
                    let expose = self.expose_manager_tools;
                    let in_flight_task = Arc::clone(&in_flight);
                    let key = id_key(&id);
                    let task_key = key.clone();
                    let task = tokio::spawn(async move {
                        // Bound execution, not intake: the permit is taken
                        // here so cancellations stay readable under load.
                        let _permit = semaphore.acquire_owned().await.ok();
                        let mut tools = handler.list_tools().await;
                        if expose {
                            tools.extend(manager_tools());
                        }
                        let result = ToolsListResult {
                            tools,
                            next_cursor: None,
                        };
                        let response = JsonRpcResponse::success(
                            Some(id),
                            serde_json::to_value(&result).unwrap_or(Value::Null),
                        );
                        write_response(&writer, &response).await;
                        in_flight_task
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .remove(&task_key);
                    });
                    track_in_flight(&in_flight, key, &task);
                }
                (methods::TOOLS_CALL, Some(id)) => {
                    let semaphore = Arc::clone(&semaphore);
                    let handler = Arc::clone(&self.handler);
                    let writer = Arc::clone(&writer);
                    let in_flight_task = Arc::clone(&in_flight);
                    let key = id_key(&id);
                    let task_key = key.clone();
                    let task = tokio::spawn(async move {
                        let _permit = semaphore.acquire_owned().await.ok();
                        let response = handle_tools_call(handler.as_ref(), id, params, &writer).await;
                        write_response(&writer, &response).await;
                        in_flight_task
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .remove(&task_key);
                    });
                    track_in_flight(&in_flight, key, &task);
                }
                (method, Some(id)) => {
                    write_response(
                        &writer,
                        &JsonRpcResponse::error(
                            Some(id),
                            JsonRpcError::new(
                                JsonRpcErrorCode::MethodNotFound,
                                format!("method not found: {method}"),
                            ),
                        ),
                    )
                    .await;
                }
                (method, None) => {
                    debug!(method, "ignoring unknown notification");
                }
            }
        }

        notifier.abort();
        Ok(())
    }
}

async fn handle_tools_call<H: GatewayHandler, W: AsyncWrite + Unpin + Send>(
    handler: &H,
    id: Value,
    params: Option<Value>,
    writer: &Arc<Mutex<W>>,
) -> JsonRpcResponse {
    let params: ToolsCallParams = match params.map(serde_json::from_value).transpose() {
        Ok(Some(params)) => params,
        Ok(None) => {
            return JsonRpcResponse::error(
                Some(id),
                JsonRpcError::new(JsonRpcErrorCode::InvalidParams, "missing params"),
            )
        }
        Err(err) => {
            return JsonRpcResponse::error(
                Some(id),
                JsonRpcError::new(JsonRpcErrorCode::InvalidParams, format!("bad params: {err}")),
            )
        }
    };

    let result = if let Some(manager_tool) = params.name.strip_prefix(MANAGER_TOOL_PREFIX) {
        let outcome = manager::dispatch(handler, manager_tool, params.arguments).await;
        if outcome.view_changed {
            send_list_changed(writer).await;
        }
        outcome.result
    } else {
        handler.call_tool(&params.name, params.arguments).await
    };

    match result {
        Ok(value) => JsonRpcResponse::success(Some(id), value),
        Err(err) => JsonRpcResponse::error(Some(id), err.to_jsonrpc()),
    }
}

/// Stable map key for a request id value.
fn id_key(id: &Value) -> String {
    id.to_string()
}

/// Register a handler task for cancellation by id. A task that already
/// finished is not tracked, so the map never retains dead handles.
fn track_in_flight(
    in_flight: &Arc<std::sync::Mutex<HashMap<String, AbortHandle>>>,
    key: String,
    task: &tokio::task::JoinHandle<()>,
) {
    let mut guard = in_flight.lock().unwrap_or_else(|e| e.into_inner());
    if !task.is_finished() {
        guard.insert(key, task.abort_handle());
    }
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &Arc<Mutex<W>>, response: &JsonRpcResponse) {
    let Ok(mut line) = serde_json::to_string(response) else {
        warn!("unserializable response dropped");
        return;
    };
    line.push('\n');
    let mut guard = writer.lock().await;
    if guard.write_all(line.as_bytes()).await.is_err() {
        warn!("upstream write failed");
        return;
    }
    let _ = guard.flush().await;
}

async fn send_list_changed<W: AsyncWrite + Unpin>(writer: &Arc<Mutex<W>>) {
    let notification = json!({
        "jsonrpc": "2.0",
        "method": methods::NOTIFICATION_TOOLS_LIST_CHANGED,
    });
    let mut line = notification.to_string();
    line.push('\n');
    let mut guard = writer.lock().await;
    let _ = guard.write_all(line.as_bytes()).await;
    let _ = guard.flush().await;
}

/// Forward view-changing bus events as `notifications/tools/list_changed`.
async fn forward_list_changed<W: AsyncWrite + Unpin>(
    mut events: mcpmu_events::EventStream,
    writer: Arc<Mutex<W>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            GatewayEvent::ToolsUpdated { .. } | GatewayEvent::ConfigReloaded => {
                send_list_changed(&writer).await;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    struct StubHandler;

    #[async_trait]
    impl GatewayHandler for StubHandler {
        async fn list_tools(&self) -> Vec<Tool> {
            vec![Tool::new(
                "myfs.fs.read_file",
                "[myfs] Read a file",
                json!({"type": "object"}),
            )]
        }

        async fn call_tool(
            &self,
            qualified_name: &str,
            _arguments: Option<Value>,
        ) -> Result<Value, RouterError> {
            match qualified_name {
                "myfs.fs.read_file" => Ok(json!({
                    "content": [{"type": "text", "text": "file contents"}],
                    "isError": false
                })),
                "prod.denied" => Err(RouterError::PermissionDenied(
                    "tool 'denied' is not allowed in namespace 'prod'".to_string(),
                )),
                "slow.sleep" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(json!({}))
                }
                other => Err(RouterError::NotFound(format!("unknown tool: {other}"))),
            }
        }

        async fn servers_list(&self) -> Result<Value, RouterError> {
            Ok(json!([{"name": "myfs", "state": "running"}]))
        }

        async fn server_start(&self, name: &str) -> Result<Value, RouterError> {
            Ok(json!({"started": name}))
        }

        async fn server_stop(&self, name: &str) -> Result<Value, RouterError> {
            Ok(json!({"stopped": name}))
        }

        async fn namespace_set(&self, name: &str) -> Result<Value, RouterError> {
            Ok(json!({"namespace": name}))
        }

        async fn permission_set(
            &self,
            _namespace: Option<&str>,
            server: &str,
            tool: &str,
            enabled: bool,
        ) -> Result<Value, RouterError> {
            Ok(json!({"server": server, "tool": tool, "enabled": enabled}))
        }
    }

    struct Harness {
        writer: DuplexStream,
        reader: BufReader<DuplexStream>,
        bus: EventBus,
    }

    impl Harness {
        fn spawn(expose_manager_tools: bool) -> Self {
            let (client_to_server_w, client_to_server_r) = tokio::io::duplex(64 * 1024);
            let (server_to_client_w, server_to_client_r) = tokio::io::duplex(64 * 1024);
            let bus = EventBus::new();
            let server = GatewayServer::new(Arc::new(StubHandler), bus.clone())
                .expose_manager_tools(expose_manager_tools);
            tokio::spawn(server.run(client_to_server_r, server_to_client_w));
            Self {
                writer: client_to_server_w,
                reader: BufReader::new(server_to_client_r),
                bus,
            }
        }

        async fn send(&mut self, value: Value) {
            let mut line = value.to_string();
            line.push('\n');
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        async fn send_raw(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let mut line = String::new();
            tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .expect("response within deadline")
                .unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    #[tokio::test]
    async fn initialize_advertises_list_changed() {
        let mut h = Harness::spawn(false);
        h.send(json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": {"protocolVersion": "2024-11-05", "capabilities": {}}
        }))
        .await;
        let response = h.recv().await;
        assert_eq!(response["result"]["protocolVersion"], "2024-11-05");
        assert_eq!(
            response["result"]["capabilities"]["tools"]["listChanged"],
            true
        );
        assert_eq!(response["result"]["serverInfo"]["name"], "mcpmu");
    }

    #[tokio::test]
    async fn tools_list_hides_manager_tools_by_default() {
        let mut h = Harness::spawn(false);
        h.send(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
            .await;
        let response = h.recv().await;
        let tools = response["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "myfs.fs.read_file");
    }

    #[tokio::test]
    async fn tools_list_exposes_manager_tools_on_opt_in() {
        let mut h = Harness::spawn(true);
        h.send(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
            .await;
        let response = h.recv().await;
        let names: Vec<_> = response["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert!(names.contains(&"mcpmu.servers_list".to_string()));
        assert!(names.contains(&"mcpmu.permission_set".to_string()));
    }

    #[tokio::test]
    async fn call_preserves_dotted_tool_names() {
        let mut h = Harness::spawn(false);
        h.send(json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/call",
            "params": {"name": "myfs.fs.read_file", "arguments": {"path": "/etc/hosts"}}
        }))
        .await;
        let response = h.recv().await;
        assert_eq!(response["result"]["content"][0]["text"], "file contents");
    }

    #[tokio::test]
    async fn permission_denied_maps_to_invalid_params_code() {
        let mut h = Harness::spawn(false);
        h.send(json!({
            "jsonrpc": "2.0", "id": 4, "method": "tools/call",
            "params": {"name": "prod.denied"}
        }))
        .await;
        let response = h.recv().await;
        assert_eq!(response["error"]["code"], -32602);
        assert!(response["error"]["message"]
            .as_str()
            .unwrap()
            .contains("permission denied"));
    }

    #[tokio::test]
    async fn manager_tools_are_callable_even_when_hidden() {
        let mut h = Harness::spawn(false);
        h.send(json!({
            "jsonrpc": "2.0", "id": 5, "method": "tools/call",
            "params": {"name": "mcpmu.servers_list"}
        }))
        .await;
        let response = h.recv().await;
        assert_eq!(response["result"][0]["name"], "myfs");
    }

    #[tokio::test]
    async fn namespace_set_emits_list_changed() {
        let mut h = Harness::spawn(false);
        h.send(json!({
            "jsonrpc": "2.0", "id": 6, "method": "tools/call",
            "params": {"name": "mcpmu.namespace_set", "arguments": {"name": "prod"}}
        }))
        .await;
        // Notification precedes the call response.
        let first = h.recv().await;
        assert_eq!(first["method"], "notifications/tools/list_changed");
        let second = h.recv().await;
        assert_eq!(second["result"]["namespace"], "prod");
    }

    #[tokio::test]
    async fn ping_answers_empty_object() {
        let mut h = Harness::spawn(false);
        h.send(json!({"jsonrpc": "2.0", "id": 7, "method": "ping"}))
            .await;
        let response = h.recv().await;
        assert_eq!(response["result"], json!({}));
    }

    #[tokio::test]
    async fn unknown_method_is_reported() {
        let mut h = Harness::spawn(false);
        h.send(json!({"jsonrpc": "2.0", "id": 8, "method": "resources/list"}))
            .await;
        let response = h.recv().await;
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn malformed_line_is_a_parse_error() {
        let mut h = Harness::spawn(false);
        h.send_raw("{ this is not json\n").await;
        let response = h.recv().await;
        assert_eq!(response["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn bus_tools_updated_is_forwarded_upstream() {
        let mut h = Harness::spawn(false);
        // Give the notifier task a beat to subscribe before publishing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.bus
            .publish(GatewayEvent::ToolsUpdated {
                server: "myfs".to_string(),
                count: 3,
            })
            .unwrap();
        let notification = h.recv().await;
        assert_eq!(notification["method"], "notifications/tools/list_changed");
    }

    #[tokio::test]
    async fn cancelled_notification_aborts_the_handler() {
        let mut h = Harness::spawn(false);
        h.send(json!({
            "jsonrpc": "2.0", "id": 9, "method": "tools/call",
            "params": {"name": "slow.sleep"}
        }))
        .await;
        h.send(json!({
            "jsonrpc": "2.0", "method": "notifications/cancelled",
            "params": {"requestId": 9}
        }))
        .await;
        // The aborted handler never answers; the next request does.
        h.send(json!({"jsonrpc": "2.0", "id": 10, "method": "ping"}))
            .await;
        let response = h.recv().await;
        assert_eq!(response["id"], 10);
    }
}
