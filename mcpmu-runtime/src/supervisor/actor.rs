//! Per-server lifecycle actor
//!
//! Every configured server is owned by exactly one actor task; callers
//! interact only through its command channel, so all lifecycle transitions
//! are serialized. Tool calls are the one exception: once a client handle
//! exists the actual RPC runs on its own task so a slow downstream never
//! blocks the actor.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::Signal;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use mcpmu_auth::CredentialStore;
use mcpmu_cache::{ToolCache, ToolInfo};
use mcpmu_config::{ServerConfig, TransportConfig};
use mcpmu_events::{EventBus, GatewayEvent, ServerState};
use mcpmu_mcp::client::CloseReason;
use mcpmu_mcp::transport::{HttpTransport, StdioTransport};
use mcpmu_mcp::{McpClient, Tool, Transport};

use crate::error::{RuntimeError, RuntimeResult};
use crate::supervisor::backoff::{RestartBackoff, MAX_START_ATTEMPTS};
use crate::supervisor::{ExitInfo, ServerStatus};

/// Grace period after closing stdin before SIGTERM
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Grace period after SIGTERM before SIGKILL
const TERM_GRACE: Duration = Duration::from_secs(3);

/// Commands accepted by a server actor.
pub(crate) enum Command {
    Start {
        reply: oneshot::Sender<RuntimeResult<()>>,
    },
    Stop {
        reply: oneshot::Sender<RuntimeResult<()>>,
    },
    Call {
        tool: String,
        arguments: Option<Value>,
        deadline: Duration,
        reply: oneshot::Sender<RuntimeResult<Value>>,
    },
    Tools {
        reply: oneshot::Sender<Option<Vec<Tool>>>,
    },
    UpdateConfig(ServerConfig),
    Rename(String),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) struct ServerActor {
    name: String,
    config: ServerConfig,
    bus: EventBus,
    cache: Arc<ToolCache>,
    credentials: Arc<dyn CredentialStore>,
    statuses: Arc<RwLock<HashMap<String, ServerStatus>>>,
    cmd_rx: mpsc::Receiver<Command>,

    client: Option<Arc<McpClient>>,
    stdio: Option<Arc<StdioTransport>>,
    http: Option<Arc<HttpTransport>>,
    state: ServerState,
    retries: u32,
    retry_at: Option<Instant>,
    started_this_session: bool,
    backoff: RestartBackoff,
}

impl ServerActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        config: ServerConfig,
        bus: EventBus,
        cache: Arc<ToolCache>,
        credentials: Arc<dyn CredentialStore>,
        statuses: Arc<RwLock<HashMap<String, ServerStatus>>>,
        cmd_rx: mpsc::Receiver<Command>,
    ) -> Self {
        Self {
            name,
            config,
            bus,
            cache,
            credentials,
            statuses,
            cmd_rx,
            client: None,
            stdio: None,
            http: None,
            state: ServerState::Stopped,
            retries: 0,
            retry_at: None,
            started_this_session: false,
            backoff: RestartBackoff::default(),
        }
    }

    pub(crate) async fn run(mut self) {
        let initial = if self.config.is_enabled() {
            ServerState::Stopped
        } else {
            ServerState::Disabled
        };
        self.set_state(initial);

        let mut bus_events = Some(self.bus.subscribe());
        loop {
            let mut closed_rx = self.client.as_ref().map(|c| c.closed_watch());
            let retry_at = self.retry_at;
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    None => {
                        let _ = self.stop_server().await;
                        break;
                    }
                    Some(Command::Shutdown { reply }) => {
                        let _ = self.stop_server().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                },

                reason = watch_closed(&mut closed_rx), if closed_rx.is_some() => {
                    self.on_transport_closed(reason).await;
                }

                _ = async { tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)).await },
                    if retry_at.is_some() =>
                {
                    self.retry_at = None;
                    debug!(server = %self.name, attempt = self.retries, "restart timer fired");
                    let _ = self.start_once().await;
                }

                event = async { bus_events.as_mut().unwrap().recv().await }, if bus_events.is_some() => {
                    match event {
                        Some(GatewayEvent::ToolsUpdated { server, .. }) if server == self.name => {
                            self.sync_tools_to_cache().await;
                        }
                        Some(_) => {}
                        None => bus_events = None,
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { reply } => {
                let result = self.ensure_running().await;
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.started_this_session = false;
                self.retry_at = None;
                self.retries = 0;
                let result = self.stop_server().await;
                let _ = reply.send(result);
            }
            Command::Call {
                tool,
                arguments,
                deadline,
                reply,
            } => {
                if self.state != ServerState::Running {
                    if let Err(err) = self.ensure_running().await {
                        let _ = reply.send(Err(err));
                        return;
                    }
                }
                match &self.client {
                    Some(client) => {
                        let client = Arc::clone(client);
                        tokio::spawn(async move {
                            let result = client
                                .call_tool(&tool, arguments, deadline)
                                .await
                                .map_err(RuntimeError::from);
                            let _ = reply.send(result);
                        });
                    }
                    None => {
                        let _ = reply.send(Err(RuntimeError::internal(
                            "running server has no client",
                        )));
                    }
                }
            }
            Command::Tools { reply } => {
                let tools = match (&self.client, self.state) {
                    (Some(client), ServerState::Running) => Some(client.tools()),
                    _ => None,
                };
                let _ = reply.send(tools);
            }
            Command::UpdateConfig(config) => self.apply_config(config).await,
            Command::Rename(new_name) => self.rename(new_name),
            Command::Shutdown { .. } => unreachable!("handled in run loop"),
        }
    }

    /// Idempotent start: already-running servers answer success immediately;
    /// concurrent starts serialize through the command channel.
    async fn ensure_running(&mut self) -> RuntimeResult<()> {
        match self.state {
            ServerState::Running => Ok(()),
            ServerState::Disabled => Err(RuntimeError::Disabled(self.name.clone())),
            ServerState::Stopped | ServerState::Crashed => self.start_once().await,
            // Unreachable while commands are serialized, but harmless.
            ServerState::Starting | ServerState::Stopping => Err(RuntimeError::internal(
                format!("start raced a {} transition", self.state),
            )),
        }
    }

    async fn start_once(&mut self) -> RuntimeResult<()> {
        if !self.config.is_enabled() {
            return Err(RuntimeError::Disabled(self.name.clone()));
        }
        info!(server = %self.name, "starting");
        self.set_state(ServerState::Starting);
        let startup_timeout = self.config.startup_timeout();

        let client_result = match self.config.transport.clone() {
            TransportConfig::Stdio(cfg) => match StdioTransport::spawn(&cfg) {
                Ok((transport, events)) => {
                    let transport = Arc::new(transport);
                    let pid = transport.pid();
                    self.stdio = Some(Arc::clone(&transport));
                    self.update_status(|s| s.pid = Some(pid));
                    McpClient::start(
                        self.name.clone(),
                        transport as Arc<dyn Transport>,
                        events,
                        self.bus.clone(),
                        startup_timeout,
                    )
                    .await
                }
                Err(err) => Err(err),
            },
            TransportConfig::StreamableHttp(cfg) => {
                match HttpTransport::connect(&cfg, Some(Arc::clone(&self.credentials))).await {
                    Ok((transport, events)) => {
                        let transport = Arc::new(transport);
                        self.http = Some(Arc::clone(&transport));
                        McpClient::start(
                            self.name.clone(),
                            transport as Arc<dyn Transport>,
                            events,
                            self.bus.clone(),
                            startup_timeout,
                        )
                        .await
                    }
                    Err(err) => Err(err),
                }
            }
        };

        match client_result {
            Ok(client) => {
                let client = Arc::new(client);
                self.client = Some(Arc::clone(&client));
                self.retries = 0;
                self.retry_at = None;
                self.started_this_session = true;
                self.sync_tools_to_cache().await;
                let auth = self.auth_string();
                self.update_status(|s| {
                    s.started_at = Some(Utc::now());
                    s.last_error = None;
                    s.auth = auth;
                });
                self.set_state(ServerState::Running);
                info!(server = %self.name, tools = client.tools().len(), "running");
                Ok(())
            }
            Err(err) => {
                warn!(server = %self.name, error = %err, "start failed");
                self.teardown_failed_start().await;
                let message = err.to_string();
                let auth = self.auth_string();
                self.update_status(|s| {
                    s.last_error = Some(message.clone());
                    s.pid = None;
                    s.auth = auth;
                });
                self.set_state(ServerState::Crashed);
                self.schedule_retry();
                Err(err.into())
            }
        }
    }

    /// Kill whatever a failed start left behind.
    async fn teardown_failed_start(&mut self) {
        if let Some(stdio) = self.stdio.take() {
            let _ = stdio.signal(Signal::SIGKILL);
        }
        if let Some(http) = self.http.take() {
            let _ = http.close().await;
        }
        self.client = None;
    }

    async fn stop_server(&mut self) -> RuntimeResult<()> {
        if !matches!(self.state, ServerState::Running | ServerState::Starting) {
            self.client = None;
            self.stdio = None;
            self.http = None;
            return Ok(());
        }
        info!(server = %self.name, "stopping");
        self.set_state(ServerState::Stopping);

        if let Some(client) = self.client.take() {
            // Cancels in-flight calls; for stdio this closes the child's
            // stdin, for HTTP it terminates the session.
            client.close().await;

            if let Some(stdio) = self.stdio.take() {
                if !client.is_closed()
                    && tokio::time::timeout(STOP_GRACE, client.wait_closed())
                        .await
                        .is_err()
                {
                    debug!(server = %self.name, "grace elapsed, sending SIGTERM");
                    let _ = stdio.signal(Signal::SIGTERM);
                    if tokio::time::timeout(TERM_GRACE, client.wait_closed())
                        .await
                        .is_err()
                    {
                        warn!(server = %self.name, "SIGTERM ignored, sending SIGKILL");
                        let _ = stdio.signal(Signal::SIGKILL);
                        let _ =
                            tokio::time::timeout(Duration::from_secs(1), client.wait_closed())
                                .await;
                    }
                }
            }
        }
        self.http = None;
        self.update_status(|s| {
            s.pid = None;
            s.started_at = None;
        });
        self.set_state(ServerState::Stopped);
        Ok(())
    }

    /// Unexpected transport termination while running or starting.
    async fn on_transport_closed(&mut self, reason: CloseReason) {
        warn!(
            server = %self.name,
            code = ?reason.code,
            signal = ?reason.signal,
            "transport terminated unexpectedly"
        );
        self.client = None;
        self.stdio = None;
        self.http = None;
        self.update_status(|s| {
            s.pid = None;
            s.last_exit = Some(ExitInfo {
                code: reason.code,
                signal: reason.signal,
                at: Utc::now(),
            });
            if let Some(message) = &reason.message {
                s.last_error = Some(message.clone());
            }
        });
        self.set_state(ServerState::Crashed);

        if self.config.autostart || self.started_this_session {
            self.schedule_retry();
        }
    }

    fn schedule_retry(&mut self) {
        self.retries += 1;
        if self.retries > MAX_START_ATTEMPTS {
            warn!(server = %self.name, attempts = self.retries - 1, "giving up on restarts");
            let _ = self.bus.publish(GatewayEvent::Error {
                server: Some(self.name.clone()),
                message: format!(
                    "gave up after {} failed start attempts",
                    self.retries - 1
                ),
            });
            self.retry_at = None;
            return;
        }
        let delay = self.backoff.delay(self.retries);
        debug!(server = %self.name, attempt = self.retries, ?delay, "scheduling restart");
        self.retry_at = Some(Instant::now() + delay);
    }

    async fn apply_config(&mut self, config: ServerConfig) {
        let previous = std::mem::replace(&mut self.config, config);

        if !self.config.is_enabled() {
            if matches!(self.state, ServerState::Running | ServerState::Starting) {
                let _ = self.stop_server().await;
            }
            self.retry_at = None;
            self.set_state(ServerState::Disabled);
            return;
        }

        if self.state == ServerState::Disabled {
            self.set_state(ServerState::Stopped);
            if self.config.autostart {
                let _ = self.start_once().await;
            }
            return;
        }

        // Only effective start-parameter changes force a restart.
        if !previous.runtime_params_eq(&self.config) && self.state == ServerState::Running {
            info!(server = %self.name, "start parameters changed, restarting");
            let _ = self.stop_server().await;
            let _ = self.start_once().await;
        }
    }

    fn rename(&mut self, new_name: String) {
        let mut statuses = self.statuses.write().unwrap_or_else(|e| e.into_inner());
        if let Some(mut status) = statuses.remove(&self.name) {
            status.name = new_name.clone();
            statuses.insert(new_name.clone(), status);
        }
        drop(statuses);
        info!(old = %self.name, new = %new_name, "actor renamed");
        self.name = new_name;
    }

    async fn sync_tools_to_cache(&mut self) {
        let Some(client) = &self.client else {
            return;
        };
        let tools: Vec<ToolInfo> = client
            .tools()
            .into_iter()
            .map(|t| ToolInfo {
                name: t.name,
                description: t.description,
                input_schema: t.input_schema,
            })
            .collect();
        let count = tools.len();
        self.cache.update(&self.name, &tools).await;
        self.cache.save().await;
        self.update_status(|s| s.tool_count = count);
    }

    fn auth_string(&self) -> String {
        match &self.http {
            Some(http) => http.auth_status().to_string(),
            None => "n/a".to_string(),
        }
    }

    fn set_state(&mut self, state: ServerState) {
        self.state = state;
        self.update_status(|s| s.state = state);
        let _ = self.bus.publish(GatewayEvent::StatusChanged {
            server: self.name.clone(),
            state,
        });
    }

    fn update_status(&self, f: impl FnOnce(&mut ServerStatus)) {
        let mut statuses = self.statuses.write().unwrap_or_else(|e| e.into_inner());
        let entry = statuses
            .entry(self.name.clone())
            .or_insert_with(|| ServerStatus::new(&self.name));
        f(entry);
    }
}

async fn watch_closed(rx: &mut Option<watch::Receiver<Option<CloseReason>>>) -> CloseReason {
    match rx {
        Some(rx) => loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return CloseReason::default();
            }
        },
        None => std::future::pending().await,
    }
}
