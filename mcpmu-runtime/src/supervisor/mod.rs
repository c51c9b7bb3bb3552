//! Downstream server supervision
//!
//! The [`Supervisor`] owns one [`actor`](self::actor) task per configured
//! server and a snapshot map of statuses served without blocking. Commands
//! go through per-actor channels; status reads come from the shared
//! snapshot.

mod actor;
mod backoff;

pub use backoff::{RestartBackoff, MAX_START_ATTEMPTS};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use mcpmu_auth::CredentialStore;
use mcpmu_cache::ToolCache;
use mcpmu_config::{GatewayConfig, ServerConfig};
use mcpmu_events::{EventBus, ServerState};
use mcpmu_mcp::Tool;

use crate::error::{RuntimeError, RuntimeResult};
use actor::{Command, ServerActor};

/// Command-channel depth per actor
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// How long a removed actor gets to wind down before being aborted
const REMOVE_GRACE: Duration = Duration::from_secs(10);

/// Exit details of the last terminated process or session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,

    pub at: DateTime<Utc>,
}

/// In-memory status snapshot for one server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,

    pub state: ServerState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    #[serde(rename = "startedAt", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(rename = "lastExit", skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<ExitInfo>,

    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(rename = "toolCount")]
    pub tool_count: usize,

    /// Auth posture: `n/a`, `bearer`, `oauth-ok`, `oauth-needs-login`,
    /// `oauth-expired`
    pub auth: String,
}

impl ServerStatus {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: ServerState::Stopped,
            pid: None,
            started_at: None,
            last_exit: None,
            last_error: None,
            tool_count: 0,
            auth: "n/a".to_string(),
        }
    }
}

struct ServerHandle {
    cmd_tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

struct SupervisorInner {
    bus: EventBus,
    cache: Arc<ToolCache>,
    credentials: Arc<dyn CredentialStore>,
    handles: Mutex<HashMap<String, ServerHandle>>,
    statuses: Arc<RwLock<HashMap<String, ServerStatus>>>,
}

/// Owns all running servers. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(
        bus: EventBus,
        cache: Arc<ToolCache>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                bus,
                cache,
                credentials,
                handles: Mutex::new(HashMap::new()),
                statuses: Arc::new(RwLock::new(HashMap::new())),
            }),
        }
    }

    /// Bring the actor set in line with a configuration snapshot: spawn
    /// actors for new servers, shut down actors for removed ones, push the
    /// fresh definition to survivors.
    pub async fn sync_config(&self, config: &GatewayConfig) {
        let current: Vec<String> = {
            let handles = self.inner.handles.lock().unwrap_or_else(|e| e.into_inner());
            handles.keys().cloned().collect()
        };

        for name in &current {
            if !config.servers.contains_key(name) {
                self.remove_server(name).await;
            }
        }
        for (name, server) in &config.servers {
            if current.iter().any(|n| n == name) {
                self.update_server(name, server.clone()).await;
            } else {
                self.add_server(name, server.clone());
            }
        }
    }

    /// Spawn an actor for a new server definition.
    pub fn add_server(&self, name: &str, config: ServerConfig) {
        let mut handles = self.inner.handles.lock().unwrap_or_else(|e| e.into_inner());
        if handles.contains_key(name) {
            return;
        }
        debug!(server = name, "spawning actor");
        self.inner
            .statuses
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), ServerStatus::new(name));

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = ServerActor::new(
            name.to_string(),
            config,
            self.inner.bus.clone(),
            Arc::clone(&self.inner.cache),
            Arc::clone(&self.inner.credentials),
            Arc::clone(&self.inner.statuses),
            cmd_rx,
        );
        let task = tokio::spawn(actor.run());
        handles.insert(name.to_string(), ServerHandle { cmd_tx, task });
    }

    /// Push a new definition to an existing actor.
    pub async fn update_server(&self, name: &str, config: ServerConfig) {
        if let Some(tx) = self.command_channel(name) {
            let _ = tx.send(Command::UpdateConfig(config)).await;
        }
    }

    /// Stop and remove a server's actor.
    pub async fn remove_server(&self, name: &str) {
        let handle = {
            let mut handles = self.inner.handles.lock().unwrap_or_else(|e| e.into_inner());
            handles.remove(name)
        };
        let Some(handle) = handle else {
            return;
        };
        debug!(server = name, "removing actor");
        let (reply, done) = oneshot::channel();
        if handle.cmd_tx.send(Command::Shutdown { reply }).await.is_ok() {
            if tokio::time::timeout(REMOVE_GRACE, done).await.is_err() {
                warn!(server = name, "actor did not shut down in time, aborting");
                handle.task.abort();
            }
        } else {
            handle.task.abort();
        }
        self.inner
            .statuses
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    /// Migrate an actor and its status to a new name without touching the
    /// running process. Used by the hot-reload rename path.
    pub async fn rename_server(&self, old: &str, new: &str) {
        let moved = {
            let mut handles = self.inner.handles.lock().unwrap_or_else(|e| e.into_inner());
            handles.remove(old).map(|handle| {
                handles.insert(new.to_string(), handle);
            })
        };
        if moved.is_some() {
            if let Some(tx) = self.command_channel(new) {
                let _ = tx.send(Command::Rename(new.to_string())).await;
            }
        }
    }

    /// Start a server and wait for `running` (or the startup failure).
    pub async fn start(&self, name: &str) -> RuntimeResult<()> {
        let tx = self
            .command_channel(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        let (reply, rx) = oneshot::channel();
        tx.send(Command::Start { reply })
            .await
            .map_err(|_| RuntimeError::ShuttingDown(name.to_string()))?;
        rx.await
            .map_err(|_| RuntimeError::ShuttingDown(name.to_string()))?
    }

    /// Stop a server gracefully.
    pub async fn stop(&self, name: &str) -> RuntimeResult<()> {
        let tx = self
            .command_channel(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        let (reply, rx) = oneshot::channel();
        tx.send(Command::Stop { reply })
            .await
            .map_err(|_| RuntimeError::ShuttingDown(name.to_string()))?;
        rx.await
            .map_err(|_| RuntimeError::ShuttingDown(name.to_string()))?
    }

    /// Dispatch a tool call, lazily starting the server when needed.
    pub async fn call_tool(
        &self,
        name: &str,
        tool: &str,
        arguments: Option<Value>,
        deadline: Duration,
    ) -> RuntimeResult<Value> {
        let tx = self
            .command_channel(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        let (reply, rx) = oneshot::channel();
        tx.send(Command::Call {
            tool: tool.to_string(),
            arguments,
            deadline,
            reply,
        })
        .await
        .map_err(|_| RuntimeError::ShuttingDown(name.to_string()))?;
        rx.await
            .map_err(|_| RuntimeError::ShuttingDown(name.to_string()))?
    }

    /// Live tool list of a running server, `None` otherwise.
    pub async fn tools(&self, name: &str) -> Option<Vec<Tool>> {
        let tx = self.command_channel(name)?;
        let (reply, rx) = oneshot::channel();
        tx.send(Command::Tools { reply }).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Status snapshot for one server.
    pub fn status(&self, name: &str) -> Option<ServerStatus> {
        self.inner
            .statuses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Status snapshots for every server, sorted by name.
    pub fn statuses(&self) -> Vec<ServerStatus> {
        let mut all: Vec<ServerStatus> = self
            .inner
            .statuses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Current lifecycle state for one server.
    pub fn state(&self, name: &str) -> Option<ServerState> {
        self.status(name).map(|s| s.state)
    }

    /// Fan out `Stop` to every server and wait, bounded by `deadline`.
    pub async fn stop_all(&self, deadline: Duration) {
        let names: Vec<String> = {
            let handles = self.inner.handles.lock().unwrap_or_else(|e| e.into_inner());
            handles.keys().cloned().collect()
        };
        let stops = names.iter().map(|name| {
            let supervisor = self.clone();
            let name = name.clone();
            async move {
                if let Err(err) = supervisor.stop(&name).await {
                    warn!(server = %name, error = %err, "stop during shutdown failed");
                }
            }
        });
        let all = futures_util::future::join_all(stops);
        if tokio::time::timeout(deadline, all).await.is_err() {
            warn!("shutdown deadline elapsed with servers still stopping");
        }
    }

    fn command_channel(&self, name: &str) -> Option<mpsc::Sender<Command>> {
        self.inner
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|h| h.cmd_tx.clone())
    }
}
