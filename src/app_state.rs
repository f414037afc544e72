use std::sync::Arc;

use crate::config::ClientConfig;
use crate::services::{
    api::{ApiClient, ApiError},
    encryption::{EncryptionError, EncryptionService},
    jobs::AnalysisClient,
    notify::Notifier,
    quota::QuotaTracker,
    session::{AuthSession, ResultHandoff},
    storage::{FileStore, KeyValueStore, StorageError},
};

/// Everything a front-end needs, wired over one shared store.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn KeyValueStore>,
    pub session: AuthSession,
    pub api: Arc<ApiClient>,
    pub quota: QuotaTracker,
    pub handoff: ResultHandoff,
    pub analysis: AnalysisClient,
}

impl AppState {
    pub fn new(
        config: &ClientConfig,
        store: Arc<dyn KeyValueStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, AppStateError> {
        let session = AuthSession::new(store.clone());
        let api = Arc::new(ApiClient::new(config, session.clone())?);
        let quota = QuotaTracker::new(api.clone());
        let handoff = ResultHandoff::new(store.clone());
        let analysis = AnalysisClient::new(
            api.clone(),
            notifier,
            handoff.clone(),
            quota.clone(),
            config.poll_policy(),
        );

        Ok(Self {
            store,
            session,
            api,
            quota,
            handoff,
            analysis,
        })
    }

    /// Build state backed by the session file named in `config`.
    pub fn from_config(
        config: &ClientConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, AppStateError> {
        let encryption = config
            .session_key
            .as_deref()
            .map(EncryptionService::new)
            .transpose()?;
        let store = FileStore::open(&config.session_file, encryption)?;
        Self::new(config, Arc::new(store), notifier)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppStateError {
    #[error("Invalid session key: {0}")]
    SessionKey(#[from] EncryptionError),

    #[error("Failed to open session store: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to build API client: {0}")]
    Api(#[from] ApiError),
}
