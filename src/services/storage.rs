use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::services::encryption::{EncryptionError, EncryptionService};

/// Key holding the bearer token.
pub const TOKEN_KEY: &str = "token";

/// Key holding a completed result waiting to be picked up by the results view.
pub const PENDING_RESULT_KEY: &str = "pendingAnalysisResult";

/// Persistent string key-value storage for client state.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-process store. Contents are lost on exit.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(lock(&self.entries)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        lock(&self.entries)?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        lock(&self.entries)?.remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON file, optionally sealed with AES-256-GCM.
///
/// The whole map is rewritten on every change.
pub struct FileStore {
    path: PathBuf,
    encryption: Option<EncryptionService>,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open `path`, loading existing entries. A missing file starts empty.
    pub fn open(
        path: impl Into<PathBuf>,
        encryption: Option<EncryptionService>,
    ) -> Result<Self, StorageError> {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(raw) => decode_entries(&raw, encryption.as_ref())?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StorageError::Io(e)),
        };

        tracing::debug!(path = %path.display(), keys = entries.len(), "Opened session store");

        Ok(Self {
            path,
            encryption,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_vec(entries)?;
        let bytes = match &self.encryption {
            Some(encryption) => encryption.seal(&json)?,
            None => json,
        };

        // Atomic replace.
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(lock(&self.entries)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = lock(&self.entries)?;
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = lock(&self.entries)?;
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }
}

fn decode_entries(
    raw: &[u8],
    encryption: Option<&EncryptionService>,
) -> Result<BTreeMap<String, String>, StorageError> {
    if raw.is_empty() {
        return Ok(BTreeMap::new());
    }
    let json = match encryption {
        Some(encryption) => encryption.open(raw)?,
        None => raw.to_vec(),
    };
    Ok(serde_json::from_slice(&json)?)
}

fn lock(
    entries: &Mutex<BTreeMap<String, String>>,
) -> Result<MutexGuard<'_, BTreeMap<String, String>>, StorageError> {
    entries.lock().map_err(|_| StorageError::Poisoned)
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Session file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session file is not valid JSON: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Session file encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("Session store lock poisoned")]
    Poisoned,
}
