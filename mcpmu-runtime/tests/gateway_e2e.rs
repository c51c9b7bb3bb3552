//! End-to-end tests over the full stack: facade ⇄ aggregator ⇄ supervisor ⇄
//! stdio child. The downstream is a shell script speaking just enough MCP to
//! answer the handshake, `tools/list`, and one `tools/call`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::RwLock;

use mcpmu_auth::{AuthResult, CredentialStore, TokenRecord};
use mcpmu_cache::ToolCache;
use mcpmu_config::{ConfigStore, ServerConfig};
use mcpmu_events::EventBus;
use mcpmu_mcp::server::GatewayHandler;
use mcpmu_mcp::GatewayServer;
use mcpmu_runtime::{Aggregator, Supervisor};

struct NullStore;

#[async_trait::async_trait]
impl CredentialStore for NullStore {
    async fn get(&self, _server_url: &str) -> AuthResult<Option<TokenRecord>> {
        Ok(None)
    }
    async fn put(&self, _server_url: &str, _record: &TokenRecord) -> AuthResult<()> {
        Ok(())
    }
    async fn delete(&self, _server_url: &str) -> AuthResult<()> {
        Ok(())
    }
}

/// A minimal MCP downstream: answers initialize (id 1), tools/list (id 2),
/// and the first tools/call (id 3), advertising a tool whose own name
/// contains a dot.
const FAKE_MCP_SERVER: &str = r#"
while read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{"listChanged":false}},"serverInfo":{"name":"fake","version":"0.0.1"}}}'
      ;;
    *'"method":"tools/list"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"fs.read_file","description":"Read a file","inputSchema":{"type":"object","properties":{"path":{"type":"string"}}}}]}}'
      ;;
    *'"method":"tools/call"'*)
      printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"contents of the file"}],"isError":false}}'
      ;;
  esac
done
"#;

struct Stack {
    aggregator: Arc<Aggregator>,
    supervisor: Supervisor,
    bus: EventBus,
    _dir: TempDir,
}

async fn stack(mutate: impl FnOnce(&mut ConfigStore)) -> Stack {
    let dir = TempDir::new().unwrap();
    let mut store = ConfigStore::load(dir.path().join("config.json")).unwrap();
    mutate(&mut store);
    store.save().unwrap();

    let bus = EventBus::new();
    let cache = Arc::new(ToolCache::in_memory());
    let supervisor = Supervisor::new(bus.clone(), Arc::clone(&cache), Arc::new(NullStore));
    supervisor.sync_config(store.config()).await;

    let namespace = Aggregator::resolve_default_namespace(store.config(), None);
    let aggregator = Arc::new(Aggregator::new(
        Arc::new(RwLock::new(store)),
        supervisor.clone(),
        cache,
        namespace,
    ));
    Stack {
        aggregator,
        supervisor,
        bus,
        _dir: dir,
    }
}

fn fake_server() -> ServerConfig {
    ServerConfig::stdio("sh", vec!["-c".to_string(), FAKE_MCP_SERVER.to_string()])
}

fn broken_server() -> ServerConfig {
    // `echo` is not an MCP server; initialize times out.
    let mut config = ServerConfig::stdio("echo", vec!["hello".to_string()]);
    config.startup_timeout_secs = Some(1);
    config
}

#[tokio::test]
async fn qualified_name_preserved_end_to_end() {
    let stack = stack(|store| {
        store.add_server("myfs", fake_server()).unwrap();
    })
    .await;

    stack.supervisor.start("myfs").await.unwrap();

    // The dotted downstream name is qualified with the server prefix.
    let tools = stack.aggregator.list_tools().await;
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "myfs.fs.read_file");
    assert_eq!(tools[0].description, "[myfs] Read a file");

    // Splitting on the first dot routes to tool `fs.read_file`.
    let result = stack
        .aggregator
        .call_tool("myfs.fs.read_file", Some(json!({"path": "/etc/hosts"})))
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "contents of the file");
    assert_eq!(result["isError"], false);
}

#[tokio::test]
async fn crash_is_detected_and_restarted() {
    use mcpmu_events::{GatewayEvent, ServerState};

    let stack = stack(|store| {
        store.add_server("myfs", fake_server()).unwrap();
    })
    .await;
    let mut events = stack.bus.subscribe();

    stack.supervisor.start("myfs").await.unwrap();
    let pid = stack.supervisor.status("myfs").unwrap().pid.unwrap();

    // Kill the child out from under the supervisor.
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    // Crashed is observed, then the session-started server comes back.
    let mut saw_crashed = false;
    let deadline = Duration::from_secs(30);
    tokio::time::timeout(deadline, async {
        while let Some(event) = events.recv().await {
            if let GatewayEvent::StatusChanged { server, state } = event {
                if server != "myfs" {
                    continue;
                }
                match state {
                    ServerState::Crashed => saw_crashed = true,
                    ServerState::Running if saw_crashed => return,
                    _ => {}
                }
            }
        }
        panic!("bus closed before restart completed");
    })
    .await
    .expect("crash and restart within deadline");

    let status = stack.supervisor.status("myfs").unwrap();
    assert_eq!(status.state, ServerState::Running);
    assert_ne!(status.pid.unwrap(), pid);
    let exit = status.last_exit.expect("exit recorded");
    assert_eq!(exit.signal, Some(9));
}

#[tokio::test]
async fn crashed_server_yields_empty_tool_list_not_an_error() {
    let stack = stack(|store| {
        store.add_server("fs", broken_server()).unwrap();
    })
    .await;

    // Startup times out; the server lands in crashed.
    assert!(stack.supervisor.start("fs").await.is_err());

    // A crashed, never-observed server contributes nothing, but listing
    // still succeeds.
    let tools = stack.aggregator.list_tools().await;
    assert!(tools.is_empty());
}

struct Upstream {
    writer: DuplexStream,
    reader: BufReader<DuplexStream>,
}

impl Upstream {
    fn connect(stack: &Stack, expose_manager_tools: bool) -> Self {
        let (client_w, server_r) = tokio::io::duplex(64 * 1024);
        let (server_w, client_r) = tokio::io::duplex(64 * 1024);
        let server = GatewayServer::new(Arc::clone(&stack.aggregator), stack.bus.clone())
            .expose_manager_tools(expose_manager_tools);
        tokio::spawn(server.run(server_r, server_w));
        Self {
            writer: client_w,
            reader: BufReader::new(client_r),
        }
    }

    /// Send a request and wait for its response, skipping any notifications
    /// that interleave (tools/list_changed fires on view changes).
    async fn request(&mut self, value: Value) -> Value {
        let mut line = value.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
        loop {
            let received = self.recv().await;
            if received.get("method").is_none() {
                return received;
            }
        }
    }

    async fn recv(&mut self) -> Value {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(10), self.reader.read_line(&mut line))
            .await
            .expect("response within deadline")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }
}

#[tokio::test]
async fn facade_serves_initialize_then_empty_list_for_broken_downstream() {
    let stack = stack(|store| {
        let mut server = broken_server();
        server.autostart = true;
        store.add_server("fs", server).unwrap();
    })
    .await;
    // Autostart path: the start fails and the server stays crashed.
    let _ = stack.supervisor.start("fs").await;

    let mut upstream = Upstream::connect(&stack, false);
    let init = upstream
        .request(json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": {"protocolVersion": "2024-11-05", "capabilities": {}}
        }))
        .await;
    assert_eq!(init["result"]["serverInfo"]["name"], "mcpmu");

    let list = upstream
        .request(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
        .await;
    assert_eq!(list["result"]["tools"], json!([]));
}

#[tokio::test]
async fn manager_tool_starts_server_through_the_facade() {
    let stack = stack(|store| {
        store.add_server("myfs", fake_server()).unwrap();
    })
    .await;

    let mut upstream = Upstream::connect(&stack, false);
    let started = upstream
        .request(json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/call",
            "params": {"name": "mcpmu.server_start", "arguments": {"name": "myfs"}}
        }))
        .await;
    assert_eq!(started["result"]["state"], "running");

    let listed = upstream
        .request(json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": "mcpmu.servers_list"}
        }))
        .await;
    let servers = listed["result"].as_array().unwrap();
    assert_eq!(servers[0]["name"], "myfs");
    assert_eq!(servers[0]["state"], "running");
}
