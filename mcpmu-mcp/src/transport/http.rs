//! Streamable-HTTP transport
//!
//! Each JSON-RPC request is POSTed to the server URL. The response is either
//! a plain JSON body or an SSE-style `text/event-stream`; in the streaming
//! case every `data:` frame is forwarded to the event channel and the send
//! completes once the frame answering this request has been seen.
//!
//! One logical session is maintained: a `Mcp-Session-Id` header issued by
//! the server on any response is echoed on subsequent requests.
//!
//! Authentication: a configured bearer-token environment variable wins;
//! otherwise a stored OAuth record is used, with a single refresh-and-retry
//! on 401 per request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use mcpmu_auth::{refresh_token_record, CredentialStore};
use mcpmu_config::HttpServerConfig;

use crate::error::{McpError, McpResult};
use crate::transport::{Transport, TransportEvent};

/// Session-continuity header defined by the streamable-http profile
const SESSION_HEADER: &str = "Mcp-Session-Id";

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Authentication posture of an HTTP downstream, as shown in status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// No authentication configured
    NotApplicable,
    /// Static bearer token from the environment
    Bearer,
    /// Stored OAuth token in use
    OAuthOk,
    /// No stored OAuth token; `mcp login` required
    OAuthNeedsLogin,
    /// Refresh failed; `mcp login` required
    OAuthExpired,
}

impl std::fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuthStatus::NotApplicable => "n/a",
            AuthStatus::Bearer => "bearer",
            AuthStatus::OAuthOk => "oauth-ok",
            AuthStatus::OAuthNeedsLogin => "oauth-needs-login",
            AuthStatus::OAuthExpired => "oauth-expired",
        };
        f.write_str(s)
    }
}

/// HTTP transport for one downstream server.
pub struct HttpTransport {
    http: reqwest::Client,
    url: Url,
    config: HttpServerConfig,
    credentials: Option<Arc<dyn CredentialStore>>,
    session_id: RwLock<Option<String>>,
    auth_status: RwLock<AuthStatus>,
    events_tx: mpsc::Sender<TransportEvent>,
    closed: AtomicBool,
}

impl HttpTransport {
    /// Build the transport. No network traffic happens until the first send;
    /// the credential store is consulted once to seed the auth status.
    pub async fn connect(
        config: &HttpServerConfig,
        credentials: Option<Arc<dyn CredentialStore>>,
    ) -> McpResult<(HttpTransport, mpsc::Receiver<TransportEvent>)> {
        let url = Url::parse(&config.url)
            .map_err(|e| McpError::protocol(format!("invalid server URL '{}': {e}", config.url)))?;

        let initial_status = if config.bearer_token_env_var.is_some() {
            AuthStatus::Bearer
        } else if let Some(store) = &credentials {
            match store.get(url.as_str()).await {
                Ok(Some(_)) => AuthStatus::OAuthOk,
                Ok(None) if config.oauth_scopes.is_empty() => AuthStatus::NotApplicable,
                Ok(None) => AuthStatus::OAuthNeedsLogin,
                Err(err) => {
                    warn!(error = %err, "credential store unavailable");
                    AuthStatus::OAuthNeedsLogin
                }
            }
        } else {
            AuthStatus::NotApplicable
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Ok((
            HttpTransport {
                http: reqwest::Client::new(),
                url,
                config: config.clone(),
                credentials,
                session_id: RwLock::new(None),
                auth_status: RwLock::new(initial_status),
                events_tx,
                closed: AtomicBool::new(false),
            },
            events_rx,
        ))
    }

    /// Current authentication posture.
    pub fn auth_status(&self) -> AuthStatus {
        *self.auth_status.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_auth_status(&self, status: AuthStatus) {
        *self.auth_status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Static, env-sourced, session, and authorization headers for one request.
    async fn build_headers(&self) -> McpResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );

        for (name, value) in &self.config.http_headers {
            insert_header(&mut headers, name, value)?;
        }
        // Env-sourced headers are resolved per request so rotated values are
        // picked up without a restart.
        for (name, env_var) in &self.config.env_http_headers {
            if let Ok(value) = std::env::var(env_var) {
                insert_header(&mut headers, name, &value)?;
            }
        }

        if let Some(session) = self.session_id.read().unwrap_or_else(|e| e.into_inner()).clone() {
            headers.insert(
                HeaderName::from_static("mcp-session-id"),
                HeaderValue::from_str(&session)
                    .map_err(|e| McpError::protocol(format!("bad session id: {e}")))?,
            );
        }

        if let Some(env_var) = &self.config.bearer_token_env_var {
            let token = std::env::var(env_var).map_err(|_| {
                McpError::protocol(format!("bearer token env var '{env_var}' is not set"))
            })?;
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|e| McpError::protocol(format!("bad bearer token: {e}")))?,
            );
        } else if let Some(store) = &self.credentials {
            if let Some(record) = store.get(self.url.as_str()).await? {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", record.access_token))
                        .map_err(|e| McpError::protocol(format!("bad access token: {e}")))?,
                );
            }
        }

        Ok(headers)
    }

    async fn post(&self, body: &Value) -> McpResult<reqwest::Response> {
        let headers = self.build_headers().await?;
        let response = self
            .http
            .post(self.url.clone())
            .headers(headers)
            .json(body)
            .send()
            .await?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write().unwrap_or_else(|e| e.into_inner()) =
                Some(session.to_string());
        }
        Ok(response)
    }

    /// Run the 401-refresh protocol: one refresh attempt, one retry.
    async fn post_with_refresh(&self, body: &Value) -> McpResult<reqwest::Response> {
        let response = self.post(body).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(store) = &self.credentials else {
            return Err(McpError::protocol("server answered 401 Unauthorized"));
        };
        if self.config.bearer_token_env_var.is_some() {
            return Err(McpError::protocol("server rejected the bearer token (401)"));
        }
        let Some(record) = store.get(self.url.as_str()).await? else {
            self.set_auth_status(AuthStatus::OAuthNeedsLogin);
            return Err(McpError::NeedsLogin);
        };

        debug!(url = %self.url, "401 received, attempting token refresh");
        match refresh_token_record(&self.http, store.as_ref(), &self.url, &record).await {
            Ok(_) => {
                self.set_auth_status(AuthStatus::OAuthOk);
                let retry = self.post(body).await?;
                if retry.status() == StatusCode::UNAUTHORIZED {
                    self.set_auth_status(AuthStatus::OAuthExpired);
                    return Err(McpError::NeedsLogin);
                }
                Ok(retry)
            }
            Err(_) => {
                self.set_auth_status(AuthStatus::OAuthExpired);
                Err(McpError::NeedsLogin)
            }
        }
    }

    /// Forward `data:` frames until the one answering `request_id` arrives.
    async fn pump_event_stream(
        &self,
        response: reqwest::Response,
        request_id: Option<Value>,
    ) -> McpResult<()> {
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(frame_end) = find_frame_end(&buffer) {
                let frame = buffer[..frame_end.body].to_string();
                buffer.drain(..frame_end.end);
                let Some(data) = extract_data(&frame) else {
                    continue;
                };
                match serde_json::from_str::<Value>(&data) {
                    Ok(value) => {
                        let answered = request_id
                            .as_ref()
                            .is_some_and(|id| value.get("id") == Some(id));
                        if self
                            .events_tx
                            .send(TransportEvent::Message(value))
                            .await
                            .is_err()
                        {
                            return Ok(());
                        }
                        if answered {
                            return Ok(());
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "discarding malformed SSE data frame");
                    }
                }
            }
        }
        Ok(())
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> McpResult<()> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| McpError::protocol(format!("bad header name '{name}': {e}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| McpError::protocol(format!("bad header value: {e}")))?;
    headers.insert(name, value);
    Ok(())
}

struct FrameEnd {
    /// Bytes of the frame body (before the delimiter)
    body: usize,
    /// Bytes to drain including the delimiter
    end: usize,
}

/// Locate the first complete `\n\n`- or `\r\n\r\n`-delimited frame.
fn find_frame_end(buffer: &str) -> Option<FrameEnd> {
    let lf = buffer.find("\n\n");
    let crlf = buffer.find("\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) if b < a => Some(FrameEnd { body: b, end: b + 4 }),
        (Some(a), _) => Some(FrameEnd { body: a, end: a + 2 }),
        (None, Some(b)) => Some(FrameEnd { body: b, end: b + 4 }),
        (None, None) => None,
    }
}

/// Concatenate the `data:` lines of one SSE frame.
fn extract_data(frame: &str) -> Option<String> {
    let mut data = String::new();
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.trim_start());
        }
    }
    if data.is_empty() {
        None
    } else {
        Some(data)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, message: Value) -> McpResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(McpError::transport_closed("transport closed"));
        }
        let request_id = message.get("id").cloned();
        let response = self.post_with_refresh(&message).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(McpError::protocol(format!(
                "server answered {status} to {}",
                message.get("method").and_then(Value::as_str).unwrap_or("request")
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            self.pump_event_stream(response, request_id).await?;
        } else if content_type.starts_with("application/json") {
            let body: Value = response.json().await?;
            if body.is_object() {
                let _ = self.events_tx.send(TransportEvent::Message(body)).await;
            }
        }
        // Notification acknowledgements (202/204, empty bodies) need no event.
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self
                .events_tx
                .send(TransportEvent::Closed {
                    code: None,
                    signal: None,
                    message: Some("transport closed".to_string()),
                })
                .await;
        }
        Ok(())
    }
}
