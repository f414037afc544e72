use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Credentials for `POST /auth/login`.
#[derive(Debug, Clone, Serialize, Validate)]
pub struct LoginRequest {
    #[garde(email)]
    pub email: String,

    #[garde(length(min = 1, max = 128))]
    pub password: String,
}

/// New account for `POST /auth/register`.
#[derive(Debug, Clone, Serialize, Validate)]
pub struct RegisterRequest {
    #[garde(email)]
    pub email: String,

    #[garde(length(min = 8, max = 128))]
    pub password: String,

    #[garde(length(min = 3, max = 30))]
    pub username: String,
}

/// Token issued by login, register and refresh.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub needs_quiz: bool,
    #[serde(default)]
    pub is_new_user: bool,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionTier {
    Free,
    Premium,
}

/// Account as returned by `GET /auth/me`.
#[derive(Debug, Clone, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub subscription_status: Option<String>,
    #[serde(default)]
    pub weekly_uploads_used: u32,
    #[serde(default)]
    pub weekly_uploads_reset_date: Option<String>,
    #[serde(default)]
    pub pending_cancellation: bool,
}

impl UserProfile {
    /// Unknown or missing statuses count as free.
    pub fn tier(&self) -> SubscriptionTier {
        self.subscription_status
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(SubscriptionTier::Free)
    }

    pub fn is_premium(&self) -> bool {
        self.tier() == SubscriptionTier::Premium
    }
}

/// Body of `GET /subscription/upload-limit`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UploadLimit {
    pub can_upload: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub uploads_used: Option<u32>,
    #[serde(default)]
    pub uploads_limit: Option<u32>,
}

impl UploadLimit {
    /// Uploads left this week, or `None` when the account is unlimited.
    pub fn remaining(&self) -> Option<u32> {
        let limit = self.uploads_limit?;
        Some(limit.saturating_sub(self.uploads_used.unwrap_or(0)))
    }
}
