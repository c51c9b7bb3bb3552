//! OAuth login/logout

use std::path::Path;

use anyhow::{bail, Context, Result};
use url::Url;

use mcpmu_auth::{open_store as open_credential_store, FlowOptions, OAuthFlow};
use mcpmu_config::TransportConfig;

use crate::commands::open_store;

pub async fn login(config_path: Option<&Path>, server: &str) -> Result<()> {
    let store = open_store(config_path)?;
    let config = store.config();
    let Some(server_config) = config.servers.get(server) else {
        bail!("unknown server '{server}'");
    };
    let TransportConfig::StreamableHttp(http) = &server_config.transport else {
        bail!("server '{server}' is a stdio server; OAuth applies to streamable-http servers");
    };
    let url = Url::parse(&http.url).with_context(|| format!("invalid URL '{}'", http.url))?;

    let data_dir = store
        .path()
        .parent()
        .context("config path has no parent directory")?;
    let credentials = open_credential_store(config.credentials_store, data_dir)?;

    eprintln!("starting authorization for {url} ...");
    let flow = OAuthFlow::new(reqwest::Client::new());
    let record = flow
        .run(
            credentials.as_ref(),
            &url,
            FlowOptions {
                scopes: http.oauth_scopes.clone(),
                callback_port: config.oauth_callback_port,
                ..Default::default()
            },
        )
        .await?;

    match record.expires_at {
        Some(at) => println!("logged in to '{server}' (token expires {at})"),
        None => println!("logged in to '{server}'"),
    }
    Ok(())
}

pub async fn logout(config_path: Option<&Path>, server: &str) -> Result<()> {
    let store = open_store(config_path)?;
    let config = store.config();
    let Some(server_config) = config.servers.get(server) else {
        bail!("unknown server '{server}'");
    };
    let TransportConfig::StreamableHttp(http) = &server_config.transport else {
        bail!("server '{server}' is a stdio server; nothing to log out of");
    };
    let url = Url::parse(&http.url).with_context(|| format!("invalid URL '{}'", http.url))?;

    let data_dir = store
        .path()
        .parent()
        .context("config path has no parent directory")?;
    let credentials = open_credential_store(config.credentials_store, data_dir)?;
    credentials.delete(url.as_str()).await?;
    println!("logged out of '{server}'");
    Ok(())
}
