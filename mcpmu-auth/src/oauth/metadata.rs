//! Authorization-server metadata discovery

use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::error::{AuthError, AuthResult};

/// RFC 8414 well-known path, resolved against the MCP server's origin
const WELL_KNOWN_PATH: &str = "/.well-known/oauth-authorization-server";

/// The subset of RFC 8414 metadata the flow uses.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuthServerMetadata {
    pub authorization_endpoint: String,

    pub token_endpoint: String,

    #[serde(default)]
    pub registration_endpoint: Option<String>,

    #[serde(default)]
    pub scopes_supported: Vec<String>,
}

/// Resource metadata (RFC 9728) pointed at by a 401 `WWW-Authenticate`
/// hint; only the authorization-server list matters here.
#[derive(Debug, Deserialize)]
struct ResourceMetadata {
    #[serde(default)]
    authorization_servers: Vec<String>,
}

/// Discover the authorization server for an MCP endpoint.
///
/// First tries `<origin>/.well-known/oauth-authorization-server`. When that
/// is absent, probes the MCP URL itself and follows OAuth hints embedded in
/// a 401 response's `WWW-Authenticate` header.
pub async fn discover(http: &reqwest::Client, server_url: &Url) -> AuthResult<AuthServerMetadata> {
    let well_known = origin_well_known(server_url)?;
    let response = http.get(well_known.clone()).send().await?;
    if response.status().is_success() {
        return response
            .json::<AuthServerMetadata>()
            .await
            .map_err(|e| AuthError::Discovery(format!("malformed metadata: {e}")));
    }
    tracing::debug!(url = %well_known, status = %response.status(), "well-known lookup missed, probing 401 hints");

    // Some servers only reveal their authorization server through the
    // challenge on an unauthenticated request.
    let probe = http.get(server_url.clone()).send().await?;
    if probe.status() != StatusCode::UNAUTHORIZED {
        return Err(AuthError::Discovery(format!(
            "no OAuth metadata at {well_known} and no challenge from {server_url}"
        )));
    }
    let challenge = probe
        .headers()
        .get(reqwest::header::WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            AuthError::Discovery("401 response carried no WWW-Authenticate header".to_string())
        })?
        .to_string();

    if let Some(resource_url) = challenge_param(&challenge, "resource_metadata") {
        let resource: ResourceMetadata = http
            .get(&resource_url)
            .send()
            .await?
            .json()
            .await
            .map_err(|e| AuthError::Discovery(format!("malformed resource metadata: {e}")))?;
        let auth_server = resource.authorization_servers.first().ok_or_else(|| {
            AuthError::Discovery("resource metadata listed no authorization servers".to_string())
        })?;
        let auth_url = Url::parse(auth_server)?;
        let response = http.get(origin_well_known(&auth_url)?).send().await?;
        return response
            .json::<AuthServerMetadata>()
            .await
            .map_err(|e| AuthError::Discovery(format!("malformed metadata: {e}")));
    }

    if let Some(auth_uri) = challenge_param(&challenge, "authorization_uri") {
        let auth_url = Url::parse(&auth_uri)?;
        let response = http.get(origin_well_known(&auth_url)?).send().await?;
        if response.status().is_success() {
            return response
                .json::<AuthServerMetadata>()
                .await
                .map_err(|e| AuthError::Discovery(format!("malformed metadata: {e}")));
        }
    }

    Err(AuthError::Discovery(format!(
        "could not locate authorization server metadata for {server_url}"
    )))
}

/// `<origin>/.well-known/oauth-authorization-server` for a URL.
fn origin_well_known(url: &Url) -> AuthResult<Url> {
    let mut origin = url.clone();
    origin.set_path(WELL_KNOWN_PATH);
    origin.set_query(None);
    origin.set_fragment(None);
    Ok(origin)
}

/// Extract a quoted `key="value"` parameter from a WWW-Authenticate value.
fn challenge_param(header: &str, key: &str) -> Option<String> {
    let marker = format!("{key}=");
    let start = header.find(&marker)? + marker.len();
    let rest = &header[start..];
    if let Some(stripped) = rest.strip_prefix('"') {
        let end = stripped.find('"')?;
        Some(stripped[..end].to_string())
    } else {
        let end = rest.find([',', ' ']).unwrap_or(rest.len());
        Some(rest[..end].to_string())
    }
}
