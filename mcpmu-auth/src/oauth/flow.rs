//! Authorization-code + PKCE flow with a loopback callback

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::credentials::{CredentialStore, TokenRecord};
use crate::error::{AuthError, AuthResult};
use crate::oauth::metadata::{discover, AuthServerMetadata};

/// Default wall-clock limit for the whole interactive flow
pub const DEFAULT_FLOW_TIMEOUT: Duration = Duration::from_secs(600);

/// Client name sent during dynamic registration
const CLIENT_NAME: &str = "mcpmu";

/// Options for one run of the flow.
#[derive(Debug, Clone)]
pub struct FlowOptions {
    /// Scopes to request; empty requests the server's defaults
    pub scopes: Vec<String>,

    /// Fixed loopback port; `None` binds an ephemeral one
    pub callback_port: Option<u16>,

    /// Deadline for the whole flow
    pub timeout: Duration,

    /// Open the system browser; disable for tests that drive the callback
    /// themselves
    pub open_browser: bool,
}

impl Default for FlowOptions {
    fn default() -> Self {
        Self {
            scopes: Vec::new(),
            callback_port: None,
            timeout: DEFAULT_FLOW_TIMEOUT,
            open_browser: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
}

/// The interactive OAuth flow.
///
/// Dropping the returned future releases the loopback listener; the whole
/// flow runs under [`FlowOptions::timeout`].
pub struct OAuthFlow {
    http: reqwest::Client,
}

impl OAuthFlow {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Run the full flow for `server_url` and persist the resulting record.
    pub async fn run(
        &self,
        store: &dyn CredentialStore,
        server_url: &Url,
        opts: FlowOptions,
    ) -> AuthResult<TokenRecord> {
        match tokio::time::timeout(opts.timeout, self.run_inner(store, server_url, &opts)).await {
            Ok(result) => result,
            Err(_) => Err(AuthError::Timeout),
        }
    }

    async fn run_inner(
        &self,
        store: &dyn CredentialStore,
        server_url: &Url,
        opts: &FlowOptions,
    ) -> AuthResult<TokenRecord> {
        let metadata = discover(&self.http, server_url).await?;
        debug!(
            authorization_endpoint = %metadata.authorization_endpoint,
            token_endpoint = %metadata.token_endpoint,
            "authorization server discovered"
        );

        // Bind before registering so the exact redirect URI is known.
        let listener =
            TcpListener::bind(("127.0.0.1", opts.callback_port.unwrap_or(0))).await?;
        let port = listener.local_addr()?.port();
        let redirect_uri = format!("http://127.0.0.1:{port}/callback");

        let existing = store.get(server_url.as_str()).await?;
        let (client_id, client_secret) = match existing
            .as_ref()
            .and_then(|r| r.client_id.clone())
        {
            Some(id) => (id, existing.as_ref().and_then(|r| r.client_secret.clone())),
            None => {
                let registered = self.register(&metadata, &redirect_uri).await?;
                (registered.client_id, registered.client_secret)
            }
        };

        let verifier = pkce_verifier();
        let challenge = pkce_challenge(&verifier);
        let state = random_state();

        let mut auth_url = Url::parse(&metadata.authorization_endpoint)
            .map_err(|e| AuthError::Discovery(format!("bad authorization endpoint: {e}")))?;
        {
            let mut query = auth_url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &client_id)
                .append_pair("redirect_uri", &redirect_uri)
                .append_pair("state", &state)
                .append_pair("code_challenge", &challenge)
                .append_pair("code_challenge_method", "S256");
            if !opts.scopes.is_empty() {
                query.append_pair("scope", &opts.scopes.join(" "));
            }
        }

        info!(url = %auth_url, "opening browser for authorization");
        if opts.open_browser {
            if let Err(err) = webbrowser::open(auth_url.as_str()) {
                warn!(error = %err, "could not open browser; visit the URL manually");
            }
        }

        let code = accept_callback(&listener, &state).await?;
        drop(listener);

        let mut form: Vec<(&str, String)> = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", client_id.clone()),
            ("code_verifier", verifier),
        ];
        if let Some(secret) = &client_secret {
            form.push(("client_secret", secret.clone()));
        }
        let token = self.exchange(&metadata, &form).await?;

        let record = TokenRecord {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: token
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64)),
            scopes: token
                .scope
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_else(|| opts.scopes.clone()),
            client_id: Some(client_id),
            client_secret,
        };
        store.put(server_url.as_str(), &record).await?;
        info!(server = %server_url, "authorization complete, token stored");
        Ok(record)
    }

    async fn register(
        &self,
        metadata: &AuthServerMetadata,
        redirect_uri: &str,
    ) -> AuthResult<RegistrationResponse> {
        let endpoint = metadata.registration_endpoint.as_ref().ok_or_else(|| {
            AuthError::Registration(
                "server offers no dynamic registration endpoint".to_string(),
            )
        })?;
        let response = self
            .http
            .post(endpoint)
            .json(&serde_json::json!({
                "client_name": CLIENT_NAME,
                "redirect_uris": [redirect_uri],
                "grant_types": ["authorization_code", "refresh_token"],
                "response_types": ["code"],
                "token_endpoint_auth_method": "none",
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AuthError::Registration(format!(
                "registration endpoint answered {}",
                response.status()
            )));
        }
        response
            .json::<RegistrationResponse>()
            .await
            .map_err(|e| AuthError::Registration(format!("malformed registration response: {e}")))
    }

    async fn exchange(
        &self,
        metadata: &AuthServerMetadata,
        form: &[(&str, String)],
    ) -> AuthResult<TokenResponse> {
        let response = self
            .http
            .post(&metadata.token_endpoint)
            .form(form)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenExchange(format!("{status}: {body}")));
        }
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| AuthError::TokenExchange(format!("malformed token response: {e}")))
    }
}

/// Refresh an expired record. Any failure surfaces as [`AuthError::NeedsLogin`]
/// so the caller can direct the user back to `mcp login`.
pub async fn refresh_token_record(
    http: &reqwest::Client,
    store: &dyn CredentialStore,
    server_url: &Url,
    record: &TokenRecord,
) -> AuthResult<TokenRecord> {
    let refresh_token = record
        .refresh_token
        .as_ref()
        .ok_or(AuthError::NeedsLogin)?;
    let client_id = record.client_id.as_ref().ok_or(AuthError::NeedsLogin)?;

    let metadata = discover(http, server_url).await?;
    let mut form: Vec<(&str, String)> = vec![
        ("grant_type", "refresh_token".to_string()),
        ("refresh_token", refresh_token.clone()),
        ("client_id", client_id.clone()),
    ];
    if let Some(secret) = &record.client_secret {
        form.push(("client_secret", secret.clone()));
    }

    let response = http.post(&metadata.token_endpoint).form(&form).send().await;
    let token: TokenResponse = match response {
        Ok(resp) if resp.status().is_success() => {
            resp.json().await.map_err(|_| AuthError::NeedsLogin)?
        }
        Ok(resp) => {
            warn!(status = %resp.status(), server = %server_url, "token refresh rejected");
            return Err(AuthError::NeedsLogin);
        }
        Err(err) => {
            warn!(error = %err, server = %server_url, "token refresh failed");
            return Err(AuthError::NeedsLogin);
        }
    };

    let refreshed = TokenRecord {
        access_token: token.access_token,
        // Servers may rotate the refresh token; keep the old one otherwise.
        refresh_token: token.refresh_token.or_else(|| record.refresh_token.clone()),
        expires_at: token
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64)),
        scopes: record.scopes.clone(),
        client_id: record.client_id.clone(),
        client_secret: record.client_secret.clone(),
    };
    store.put(server_url.as_str(), &refreshed).await?;
    Ok(refreshed)
}

/// 43-character URL-safe verifier from 32 random bytes.
fn pkce_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// S256 challenge for a verifier.
fn pkce_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// 16 random bytes, hex-encoded.
fn random_state() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Serve loopback connections until one request hits `/callback`, then
/// validate `state` and extract the code. Non-callback requests (favicon
/// probes) get a 404 and the wait continues.
async fn accept_callback(listener: &TcpListener, expected_state: &str) -> AuthResult<String> {
    loop {
        let (mut stream, peer) = listener.accept().await?;
        debug!(%peer, "callback connection accepted");

        let path = match read_request_path(&mut stream).await {
            Ok(path) => path,
            Err(err) => {
                warn!(error = %err, "unreadable callback request");
                continue;
            }
        };
        if !path.starts_with("/callback") {
            let _ = respond(&mut stream, 404, "Not Found", "No such page.").await;
            continue;
        }

        let full = Url::parse(&format!("http://127.0.0.1{path}"))
            .map_err(|e| AuthError::OAuthDenied(format!("malformed callback: {e}")))?;
        let mut code = None;
        let mut state = None;
        let mut error = None;
        for (key, value) in full.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => error = Some(value.into_owned()),
                _ => {}
            }
        }

        if let Some(error) = error {
            let _ = respond(
                &mut stream,
                400,
                "Authorization failed",
                &format!("The authorization server reported: {error}. You can close this tab."),
            )
            .await;
            return Err(AuthError::OAuthDenied(error));
        }
        if state.as_deref() != Some(expected_state) {
            let _ = respond(
                &mut stream,
                400,
                "Authorization failed",
                "State mismatch; please retry the login.",
            )
            .await;
            return Err(AuthError::OAuthDenied("state mismatch".to_string()));
        }
        let Some(code) = code else {
            let _ = respond(
                &mut stream,
                400,
                "Authorization failed",
                "The callback carried no authorization code.",
            )
            .await;
            return Err(AuthError::OAuthDenied("missing code".to_string()));
        };

        let _ = respond(
            &mut stream,
            200,
            "Authorization complete",
            "You are signed in. You can close this tab and return to the terminal.",
        )
        .await;
        return Ok(code);
    }
}

/// Read the request head and return the path of the request line.
async fn read_request_path(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() > 16 * 1024 {
            break;
        }
    }
    let head = String::from_utf8_lossy(&buf);
    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let _method = parts.next();
    parts
        .next()
        .map(str::to_string)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "empty request line"))
}

async fn respond(
    stream: &mut TcpStream,
    status: u16,
    title: &str,
    message: &str,
) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        _ => "Bad Request",
    };
    let body = format!(
        "<!DOCTYPE html><html><head><title>mcpmu: {title}</title></head>\
         <body><h1>{title}</h1><p>{message}</p></body></html>"
    );
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
