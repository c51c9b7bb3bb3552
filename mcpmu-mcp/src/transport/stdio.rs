//! Stdio child-process transport
//!
//! Spawns the configured command with the gateway's environment plus the
//! per-server additions, pipes all three stdio streams, and frames JSON-RPC
//! as one JSON object per line. Stdout lines that are not complete JSON
//! objects are a framing violation and close the transport; stderr lines are
//! forwarded as events for the log stream.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use mcpmu_config::StdioServerConfig;

use crate::error::{McpError, McpResult};
use crate::transport::{Transport, TransportEvent};

/// Buffered transport events before the client falls behind
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A running child process speaking line-delimited JSON-RPC.
pub struct StdioTransport {
    /// Single-writer gate: interleaved messages must never corrupt framing
    stdin: Mutex<Option<ChildStdin>>,
    pid: u32,
    closed: AtomicBool,
}

impl StdioTransport {
    /// Spawn the child and start its reader tasks. Returns the transport and
    /// the inbound event stream.
    pub fn spawn(
        config: &StdioServerConfig,
    ) -> McpResult<(StdioTransport, mpsc::Receiver<TransportEvent>)> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| McpError::transport_closed("child exited before startup"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::transport_closed("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::transport_closed("child stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::transport_closed("child stderr unavailable"))?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        // stdout: one JSON object per line, anything else is a framing error
        let stdout_tx = events_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(trimmed) {
                            Ok(value) if value.is_object() => {
                                if stdout_tx.send(TransportEvent::Message(value)).await.is_err() {
                                    break;
                                }
                            }
                            _ => {
                                warn!(pid, "downstream emitted a non-JSON stdout line, closing");
                                let _ = stdout_tx
                                    .send(TransportEvent::Closed {
                                        code: None,
                                        signal: None,
                                        message: Some(format!(
                                            "framing error: stdout line is not a JSON object: {}",
                                            truncate(trimmed, 120)
                                        )),
                                    })
                                    .await;
                                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                                break;
                            }
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        });

        // stderr: forwarded line by line for the log stream
        let stderr_tx = events_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stderr_tx.send(TransportEvent::Stderr(line)).await.is_err() {
                    break;
                }
            }
        });

        // Reaper: the authoritative Closed event carries the exit status
        tokio::spawn(reap(child, events_tx));

        debug!(pid, command = %config.command, "stdio transport spawned");
        Ok((
            StdioTransport {
                stdin: Mutex::new(Some(stdin)),
                pid,
                closed: AtomicBool::new(false),
            },
            events_rx,
        ))
    }

    /// OS process id of the child.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Close the child's stdin, signalling end of input. Idempotent.
    pub async fn close_stdin(&self) {
        let _ = self.stdin.lock().await.take();
    }

    /// Send a signal to the child. Used by the supervisor's stop escalation.
    pub fn signal(&self, signal: Signal) -> McpResult<()> {
        kill(Pid::from_raw(self.pid as i32), signal)
            .map_err(|e| McpError::transport_closed(format!("kill failed: {e}")))
    }
}

async fn reap(mut child: Child, events_tx: mpsc::Sender<TransportEvent>) {
    let (code, signal) = match child.wait().await {
        Ok(status) => {
            #[cfg(unix)]
            let signal = {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            };
            #[cfg(not(unix))]
            let signal = None;
            (status.code(), signal)
        }
        Err(err) => {
            warn!(error = %err, "failed to reap child");
            (None, None)
        }
    };
    debug!(?code, ?signal, "child exited");
    let _ = events_tx
        .send(TransportEvent::Closed {
            code,
            signal,
            message: None,
        })
        .await;
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: Value) -> McpResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(McpError::transport_closed("transport closed"));
        }
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| McpError::transport_closed("stdin closed"))?;
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.closed.store(true, Ordering::Release);
        self.close_stdin().await;
        Ok(())
    }
}
