use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::user::UploadLimit;
use crate::services::api::{ApiClient, ApiError};

/// Cached view of the caller's weekly upload allowance.
#[derive(Clone)]
pub struct QuotaTracker {
    api: Arc<ApiClient>,
    latest: Arc<RwLock<Option<UploadLimit>>>,
}

impl QuotaTracker {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self {
            api,
            latest: Arc::new(RwLock::new(None)),
        }
    }

    /// Fetch the allowance from the backend and cache it.
    pub async fn refresh(&self) -> Result<UploadLimit, ApiError> {
        let limit = self.api.upload_limit().await?;
        tracing::debug!(
            can_upload = limit.can_upload,
            uploads_used = limit.uploads_used,
            uploads_limit = limit.uploads_limit,
            "Upload quota refreshed"
        );
        *self.latest.write().await = Some(limit.clone());
        Ok(limit)
    }

    /// Last fetched allowance, if any.
    pub async fn current(&self) -> Option<UploadLimit> {
        self.latest.read().await.clone()
    }
}
