use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::models::analysis::AnalysisResult;
use crate::services::storage::{KeyValueStore, StorageError, PENDING_RESULT_KEY, TOKEN_KEY};

/// Sole owner of the persisted bearer token.
///
/// Every token read and write in the crate goes through this type.
#[derive(Clone)]
pub struct AuthSession {
    store: Arc<dyn KeyValueStore>,
    refresh_lock: Arc<Mutex<()>>,
}

impl AuthSession {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            refresh_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Current token, if logged in.
    pub fn token(&self) -> Result<Option<String>, StorageError> {
        Ok(self.store.get(TOKEN_KEY)?.filter(|t| !t.is_empty()))
    }

    pub fn store_token(&self, token: &str) -> Result<(), StorageError> {
        self.store.set(TOKEN_KEY, token)?;
        tracing::debug!("Session token stored");
        Ok(())
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.store.remove(TOKEN_KEY)?;
        tracing::info!("Session token cleared");
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.token(), Ok(Some(_)))
    }

    /// Held while a token refresh is in flight.
    pub(crate) async fn refresh_guard(&self) -> MutexGuard<'_, ()> {
        self.refresh_lock.lock().await
    }
}

/// One-shot slot carrying a completed result to the results view.
#[derive(Clone)]
pub struct ResultHandoff {
    store: Arc<dyn KeyValueStore>,
}

impl ResultHandoff {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Replace whatever is in the slot with `result`.
    pub fn stash(&self, result: &AnalysisResult) -> Result<(), StorageError> {
        let payload = serde_json::to_string(result)?;
        self.store.set(PENDING_RESULT_KEY, &payload)
    }

    /// Read and clear the slot. A second call returns `None`.
    pub fn take(&self) -> Result<Option<AnalysisResult>, StorageError> {
        let Some(payload) = self.store.get(PENDING_RESULT_KEY)? else {
            return Ok(None);
        };
        self.store.remove(PENDING_RESULT_KEY)?;

        match serde_json::from_str(&payload) {
            Ok(result) => Ok(Some(result)),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable pending analysis result");
                Ok(None)
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.store.get(PENDING_RESULT_KEY), Ok(Some(_)))
    }
}
