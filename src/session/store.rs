//! Persisted copy of the last-used login credential.
//!
//! The credential lives under one fixed key of a [`KeyValueStore`]. Saving
//! always goes through [`Credential::redacted`], so a stored record never
//! holds an MFA code. A missing or unreadable record simply means "no saved
//! credential".

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use crate::session::credential::Credential;

/// Key under which the login credential is stored.
pub const CREDENTIAL_KEY: &str = "slurm-login-config";

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("store I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("stored record is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid store key: {0}")]
    InvalidKey(String),
}

/// Minimal string key/value persistence.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError>;

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError>;
}

/// One `<key>.json` file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, PersistenceError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(PersistenceError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        match fs::read_to_string(self.path_for(key)?) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.dir)?;
        fs::write(path, value)?;
        Ok(())
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Persist `credential` with its MFA code cleared.
pub fn save_credential(
    store: &dyn KeyValueStore,
    credential: &Credential,
) -> Result<(), PersistenceError> {
    let json = serde_json::to_string(&credential.redacted())?;
    store.set(CREDENTIAL_KEY, &json)?;
    tracing::debug!(username = %credential.username, "Saved login credential");
    Ok(())
}

/// Read the saved credential. Failures are logged and treated as "nothing saved".
pub fn load_credential(store: &dyn KeyValueStore) -> Option<Credential> {
    let raw = match store.get(CREDENTIAL_KEY) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!(error = %e, "Could not read saved login credential");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(credential) => Some(credential),
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed saved login credential");
            None
        }
    }
}
