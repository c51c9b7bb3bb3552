//! OAuth token persistence
//!
//! Token records are keyed by the downstream server URL. The keyring backend
//! delegates to the OS keychain; the file backend keeps an AES-256-GCM
//! encrypted JSON map beside the config file, with the key derived from a
//! stable per-machine secret. Auto mode prefers the keychain and falls back
//! to the file when the keychain is unavailable.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use mcpmu_config::CredentialStoreMode;

use crate::error::{AuthError, AuthResult};

/// Keychain service name under which records are filed
const KEYRING_SERVICE: &str = "mcpmu";

/// Encrypted credential file, co-located with the config
const CREDENTIAL_FILE_NAME: &str = "credentials.enc";

/// Fallback machine-secret file when `/etc/machine-id` is unavailable
const MACHINE_KEY_FILE_NAME: &str = "machine.key";

/// AES-GCM nonce length in bytes
const NONCE_LEN: usize = 12;

/// A stored OAuth credential for one server URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Bearer token presented to the MCP server
    #[serde(rename = "accessToken")]
    pub access_token: String,

    /// Refresh token, when the authorization server issued one
    #[serde(rename = "refreshToken", skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Access-token expiry instant
    #[serde(rename = "expiresAt", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Scopes granted
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Client id issued during dynamic registration
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Client secret issued during dynamic registration
    #[serde(rename = "clientSecret", skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

impl TokenRecord {
    /// Whether the access token has passed its expiry instant.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

/// Persistence interface for token records.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fetch the record for a server URL, or `None` on a miss.
    async fn get(&self, server_url: &str) -> AuthResult<Option<TokenRecord>>;

    /// Store or replace the record for a server URL.
    async fn put(&self, server_url: &str, record: &TokenRecord) -> AuthResult<()>;

    /// Remove the record for a server URL. Removing a missing record is not
    /// an error.
    async fn delete(&self, server_url: &str) -> AuthResult<()>;
}

/// Open the store selected by configuration.
pub fn open_store(
    mode: CredentialStoreMode,
    config_dir: &Path,
) -> AuthResult<Box<dyn CredentialStore>> {
    match mode {
        CredentialStoreMode::Keyring => Ok(Box::new(KeyringStore::new())),
        CredentialStoreMode::File => Ok(Box::new(FileStore::open(config_dir)?)),
        CredentialStoreMode::Auto => Ok(Box::new(AutoStore::open(config_dir)?)),
    }
}

// === Keyring backend ===

/// OS keychain backend. Records are serialized to JSON and filed under the
/// `mcpmu` service with the server URL as the account.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self {
            service: KEYRING_SERVICE.to_string(),
        }
    }

    fn entry(&self, server_url: &str) -> AuthResult<keyring::Entry> {
        keyring::Entry::new(&self.service, server_url)
            .map_err(|e| AuthError::keyring(e.to_string()))
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for KeyringStore {
    async fn get(&self, server_url: &str) -> AuthResult<Option<TokenRecord>> {
        let entry = self.entry(server_url)?;
        // The keyring crate does blocking IPC under the hood.
        let result = tokio::task::spawn_blocking(move || entry.get_password())
            .await
            .map_err(|e| AuthError::keyring(e.to_string()))?;
        match result {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(AuthError::keyring(err.to_string())),
        }
    }

    async fn put(&self, server_url: &str, record: &TokenRecord) -> AuthResult<()> {
        let entry = self.entry(server_url)?;
        let json = serde_json::to_string(record)?;
        tokio::task::spawn_blocking(move || entry.set_password(&json))
            .await
            .map_err(|e| AuthError::keyring(e.to_string()))?
            .map_err(|e| AuthError::keyring(e.to_string()))
    }

    async fn delete(&self, server_url: &str) -> AuthResult<()> {
        let entry = self.entry(server_url)?;
        let result = tokio::task::spawn_blocking(move || entry.delete_credential())
            .await
            .map_err(|e| AuthError::keyring(e.to_string()))?;
        match result {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(AuthError::keyring(err.to_string())),
        }
    }
}

// === Encrypted file backend ===

/// AEAD-encrypted JSON file backend.
///
/// The file holds a map from server URL to [`TokenRecord`], serialized and
/// sealed with AES-256-GCM. The key is the SHA-256 of a stable machine
/// secret, so the file is useless when copied to another machine.
pub struct FileStore {
    path: PathBuf,
    key: [u8; 32],
}

impl FileStore {
    /// Open (or prepare to create) the store under `config_dir`.
    pub fn open(config_dir: &Path) -> AuthResult<Self> {
        let key = derive_file_key(config_dir)?;
        Ok(Self {
            path: config_dir.join(CREDENTIAL_FILE_NAME),
            key,
        })
    }

    fn read_records(&self) -> AuthResult<BTreeMap<String, TokenRecord>> {
        let blob = match fs::read(&self.path) {
            Ok(blob) => blob,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new())
            }
            Err(err) => return Err(err.into()),
        };
        if blob.len() < NONCE_LEN {
            return Err(AuthError::crypto("credential file truncated"));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| AuthError::crypto("credential file failed to decrypt"))?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn write_records(&self, records: &BTreeMap<String, TokenRecord>) -> AuthResult<()> {
        let plaintext = serde_json::to_vec(records)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| AuthError::crypto("failed to encrypt credential file"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        write_private_atomic(&self.path, &blob)?;
        debug!(path = %self.path.display(), "credential file written");
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    async fn get(&self, server_url: &str) -> AuthResult<Option<TokenRecord>> {
        Ok(self.read_records()?.remove(server_url))
    }

    async fn put(&self, server_url: &str, record: &TokenRecord) -> AuthResult<()> {
        let mut records = self.read_records()?;
        records.insert(server_url.to_string(), record.clone());
        self.write_records(&records)
    }

    async fn delete(&self, server_url: &str) -> AuthResult<()> {
        let mut records = self.read_records()?;
        if records.remove(server_url).is_some() {
            self.write_records(&records)?;
        }
        Ok(())
    }
}

// === Auto backend ===

/// Keyring-preferred backend. Each operation tries the keychain first and
/// falls back to the encrypted file on keychain failure (a missing record is
/// not a failure).
pub struct AutoStore {
    keyring: KeyringStore,
    file: FileStore,
}

impl AutoStore {
    pub fn open(config_dir: &Path) -> AuthResult<Self> {
        Ok(Self {
            keyring: KeyringStore::new(),
            file: FileStore::open(config_dir)?,
        })
    }
}

#[async_trait]
impl CredentialStore for AutoStore {
    async fn get(&self, server_url: &str) -> AuthResult<Option<TokenRecord>> {
        match self.keyring.get(server_url).await {
            Ok(Some(record)) => Ok(Some(record)),
            Ok(None) => self.file.get(server_url).await,
            Err(err) => {
                warn!(error = %err, "keyring unavailable, using credential file");
                self.file.get(server_url).await
            }
        }
    }

    async fn put(&self, server_url: &str, record: &TokenRecord) -> AuthResult<()> {
        match self.keyring.put(server_url, record).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(error = %err, "keyring unavailable, using credential file");
                self.file.put(server_url, record).await
            }
        }
    }

    async fn delete(&self, server_url: &str) -> AuthResult<()> {
        let keyring_result = self.keyring.delete(server_url).await;
        let file_result = self.file.delete(server_url).await;
        // Removing from either backend is enough to log out.
        match (keyring_result, file_result) {
            (Err(a), Err(_)) => Err(a),
            _ => Ok(()),
        }
    }
}

/// Derive the file-store key from stable machine material: `/etc/machine-id`
/// when present, else a random per-user secret persisted with mode 0600.
fn derive_file_key(config_dir: &Path) -> AuthResult<[u8; 32]> {
    let secret = match fs::read("/etc/machine-id") {
        Ok(id) if !id.is_empty() => id,
        _ => {
            let key_path = config_dir.join(MACHINE_KEY_FILE_NAME);
            match fs::read(&key_path) {
                Ok(secret) if !secret.is_empty() => secret,
                _ => {
                    let mut fresh = vec![0u8; 32];
                    rand::rng().fill_bytes(&mut fresh);
                    fs::create_dir_all(config_dir)?;
                    write_private_atomic(&key_path, &fresh)?;
                    fresh
                }
            }
        }
    };

    let mut hasher = Sha256::new();
    hasher.update(b"mcpmu-credential-store");
    hasher.update(&secret);
    Ok(hasher.finalize().into())
}

fn write_private_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
