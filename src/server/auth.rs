//! Shared-key authentication and the key-value store it is persisted in.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::error::{FloodgateError, Result};

/// Record id the token is stored under.
pub const AUTH_TOKEN_RECORD: &str = "ratelimit_auth_token";

const TOKEN_LEN: usize = 48;

/// Persistent key-value collaborator.
///
/// Only the auth token goes through it, so values are plain strings.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Value stored under `record_id`, if any.
    async fn load(&self, record_id: &str) -> Result<Option<String>>;

    async fn save(&self, record_id: &str, value: &str) -> Result<()>;
}

/// Process-local store, mostly for tests and single-process setups.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    records: Mutex<HashMap<String, String>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyStore {
    async fn load(&self, record_id: &str) -> Result<Option<String>> {
        Ok(self.records.lock().get(record_id).cloned())
    }

    async fn save(&self, record_id: &str, value: &str) -> Result<()> {
        self.records
            .lock()
            .insert(record_id.to_string(), value.to_string());
        Ok(())
    }
}

/// Store keeping one JSON document per record in a directory.
///
/// Server and clients on the same host share the token by pointing at the
/// same directory.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, record_id: &str) -> Result<PathBuf> {
        let valid = !record_id.is_empty()
            && record_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(FloodgateError::Configuration(format!(
                "invalid record id '{}'",
                record_id
            )));
        }
        Ok(self.dir.join(format!("{}.json", record_id)))
    }
}

#[async_trait]
impl KeyValueStore for FileKeyStore {
    async fn load(&self, record_id: &str) -> Result<Option<String>> {
        let path = self.record_path(record_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, record_id: &str, value: &str) -> Result<()> {
        let path = self.record_path(record_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        // Write then rename so readers never see a torn record.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(value)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), "Record saved");
        Ok(())
    }
}

/// The opaque key every connection must present.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// A fresh random token.
    pub fn generate() -> Self {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        Self(token)
    }

    /// Wrap a token obtained out of band.
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.is_empty() {
            return Err(FloodgateError::Authentication(
                "auth token must not be empty".to_string(),
            ));
        }
        Ok(Self(token))
    }

    /// Load the persisted token, creating and persisting one if none exists.
    pub async fn load_or_create(store: &dyn KeyValueStore) -> Result<Self> {
        if let Some(token) = store.load(AUTH_TOKEN_RECORD).await? {
            debug!("Loaded persisted auth token");
            return Self::new(token);
        }

        let token = Self::generate();
        store.save(AUTH_TOKEN_RECORD, &token.0).await?;
        info!("Generated new auth token");
        Ok(token)
    }

    /// Load the persisted token; clients never create one.
    pub async fn load(store: &dyn KeyValueStore) -> Result<Self> {
        match store.load(AUTH_TOKEN_RECORD).await? {
            Some(token) => Self::new(token),
            None => Err(FloodgateError::Authentication(
                "no auth token has been persisted; start the server first".to_string(),
            )),
        }
    }

    /// Compare a presented key in constant time.
    ///
    /// Both sides are hashed first so the comparison length does not depend
    /// on the presented key.
    pub fn verify(&self, presented: &str) -> bool {
        let expected = Sha256::digest(self.0.as_bytes());
        let presented = Sha256::digest(presented.as_bytes());
        expected.ct_eq(&presented).into()
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken(**redacted**)")
    }
}
