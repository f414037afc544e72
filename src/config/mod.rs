use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::jobs::PollPolicy;

/// Versioned prefix every backend route lives under.
pub const API_PREFIX: &str = "/api";

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Backend base URL
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Payment provider publishable key. Loaded for parity with the web app, not used here.
    #[serde(default)]
    pub stripe_publishable_key: Option<String>,

    /// Where the session token and the pending result are persisted
    #[serde(default = "default_session_file")]
    pub session_file: PathBuf,

    /// AES-256-GCM key (base64-encoded, 32 bytes). Encrypts the session file when set.
    #[serde(default)]
    pub session_key: Option<String>,

    /// Seconds between job status polls
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Give up after this many polls. Unset polls until a terminal status.
    #[serde(default)]
    pub poll_max_attempts: Option<u32>,

    /// Give up after this many seconds. Unset polls until a terminal status.
    #[serde(default)]
    pub poll_timeout_secs: Option<u64>,

    /// Per-request HTTP timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_session_file() -> PathBuf {
    PathBuf::from(".outfit-scan/session.json")
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Config pointing at `base_url` with every other field defaulted.
    pub fn for_base_url(base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: base_url.into(),
            stripe_publishable_key: None,
            session_file: default_session_file(),
            session_key: None,
            poll_interval_secs: default_poll_interval_secs(),
            poll_max_attempts: None,
            poll_timeout_secs: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    /// Base URL with the API prefix applied, without a trailing slash.
    pub fn api_root(&self) -> String {
        format!("{}{}", self.api_base_url.trim_end_matches('/'), API_PREFIX)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            max_attempts: self.poll_max_attempts,
            timeout: self.poll_timeout_secs.map(Duration::from_secs),
        }
    }
}
