use garde::Validate;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::path::Path;

use crate::config::ClientConfig;
use crate::models::job::{JobId, JobList, JobSnapshot, SubmitResponse};
use crate::models::user::{LoginRequest, RegisterRequest, TokenResponse, UploadLimit, UserProfile};
use crate::services::session::AuthSession;
use crate::services::storage::StorageError;

/// Largest page the history endpoint will serve.
pub const MAX_JOB_LIST_LIMIT: u32 = 100;

/// An image queued for upload.
///
/// The MIME type is sniffed from the bytes. Nothing is rejected here; the
/// backend decides what it accepts.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    bytes: Vec<u8>,
    file_name: String,
    is_owner: bool,
}

impl ImageUpload {
    pub fn new(bytes: Vec<u8>, file_name: impl Into<String>) -> Self {
        Self {
            bytes,
            file_name: file_name.into(),
            is_owner: false,
        }
    }

    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload")
            .to_string();
        Ok(Self::new(bytes, file_name))
    }

    /// Mark the photo as showing the uploader themselves.
    pub fn with_owner(mut self, is_owner: bool) -> Self {
        self.is_owner = is_owner;
        self
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn mime_type(&self) -> &'static str {
        image::guess_format(&self.bytes)
            .map(|format| format.to_mime_type())
            .unwrap_or("application/octet-stream")
    }

    fn form(&self) -> Result<Form, ApiError> {
        let part = Part::bytes(self.bytes.clone())
            .file_name(self.file_name.clone())
            .mime_str(self.mime_type())?;
        Ok(Form::new()
            .part("image", part)
            .text("is_owner", self.is_owner.to_string()))
    }
}

/// HTTP client for the outfit analysis backend.
///
/// Authenticated calls share one policy: on a 401 the token is refreshed
/// once and the request is replayed once with the new token.
pub struct ApiClient {
    http: Client,
    api_root: Url,
    session: AuthSession,
}

impl ApiClient {
    pub fn new(config: &ClientConfig, session: AuthSession) -> Result<Self, ApiError> {
        let api_root = Url::parse(&format!("{}/", config.api_root()))
            .map_err(|e| ApiError::Config(format!("invalid API_BASE_URL: {e}")))?;
        if api_root.cannot_be_a_base() {
            return Err(ApiError::Config(format!(
                "API_BASE_URL cannot be used as a base: {}",
                config.api_base_url
            )));
        }

        let http = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("outfit-scan/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            api_root,
            session,
        })
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    // --- auth ---------------------------------------------------------------

    /// POST /auth/login and persist the issued token.
    pub async fn login(&self, request: &LoginRequest) -> Result<TokenResponse, ApiError> {
        request.validate()?;
        let url = self.endpoint(&["auth", "login"]);
        let response = self.dispatch("login", self.http.post(url).json(request)).await?;
        let token: TokenResponse = decode(check_status(response).await?).await?;
        self.session.store_token(&token.access_token)?;
        tracing::info!(email = %request.email, "Logged in");
        Ok(token)
    }

    /// POST /auth/register and persist the issued token.
    pub async fn register(&self, request: &RegisterRequest) -> Result<TokenResponse, ApiError> {
        request.validate()?;
        let url = self.endpoint(&["auth", "register"]);
        let response = self
            .dispatch("register", self.http.post(url).json(request))
            .await?;
        let token: TokenResponse = decode(check_status(response).await?).await?;
        self.session.store_token(&token.access_token)?;
        tracing::info!(username = %request.username, "Registered account");
        Ok(token)
    }

    /// Forget the local session. The backend keeps no session state to revoke.
    pub fn logout(&self) -> Result<(), ApiError> {
        self.session.clear()?;
        Ok(())
    }

    /// GET /auth/me
    pub async fn me(&self) -> Result<UserProfile, ApiError> {
        let url = self.endpoint(&["auth", "me"]);
        let response = self
            .send_authorized("me", |http, token| Ok(http.get(url.clone()).bearer_auth(token)))
            .await?;
        decode(response).await
    }

    // --- upload jobs --------------------------------------------------------

    /// POST /upload/ with the image as multipart field `image`.
    pub async fn submit_image(&self, upload: &ImageUpload) -> Result<JobId, ApiError> {
        let url = self.endpoint(&["upload", ""]);
        let response = self
            .send_authorized("submit_image", |http, token| {
                Ok(http
                    .post(url.clone())
                    .bearer_auth(token)
                    .multipart(upload.form()?))
            })
            .await?;
        let accepted: SubmitResponse = decode(response).await?;
        tracing::info!(
            job_id = %accepted.job_id,
            file_name = %upload.file_name(),
            bytes = upload.len(),
            "Image accepted for analysis"
        );
        Ok(accepted.job_id)
    }

    /// GET /upload/job/{job_id}
    pub async fn job_status(&self, job_id: &JobId) -> Result<JobSnapshot, ApiError> {
        let url = self.endpoint(&["upload", "job", job_id.as_str()]);
        let response = self
            .send_authorized("job_status", |http, token| {
                Ok(http.get(url.clone()).bearer_auth(token))
            })
            .await?;
        decode(response).await
    }

    /// GET /upload/jobs?limit=N, most recent first.
    pub async fn list_jobs(&self, limit: u32) -> Result<Vec<JobSnapshot>, ApiError> {
        if limit == 0 || limit > MAX_JOB_LIST_LIMIT {
            return Err(ApiError::InvalidRequest(format!(
                "limit must be between 1 and {MAX_JOB_LIST_LIMIT}, got {limit}"
            )));
        }
        let url = self.endpoint(&["upload", "jobs"]);
        let response = self
            .send_authorized("list_jobs", |http, token| {
                Ok(http
                    .get(url.clone())
                    .query(&[("limit", limit)])
                    .bearer_auth(token))
            })
            .await?;
        let list: JobList = decode(response).await?;
        Ok(list.jobs)
    }

    /// DELETE /upload/job/{job_id}
    pub async fn delete_job(&self, job_id: &JobId) -> Result<(), ApiError> {
        let url = self.endpoint(&["upload", "job", job_id.as_str()]);
        self.send_authorized("delete_job", |http, token| {
            Ok(http.delete(url.clone()).bearer_auth(token))
        })
        .await?;
        tracing::info!(job_id = %job_id, "Job removed from history");
        Ok(())
    }

    // --- subscription -------------------------------------------------------

    /// GET /subscription/upload-limit
    pub async fn upload_limit(&self) -> Result<UploadLimit, ApiError> {
        let url = self.endpoint(&["subscription", "upload-limit"]);
        let response = self
            .send_authorized("upload_limit", |http, token| {
                Ok(http.get(url.clone()).bearer_auth(token))
            })
            .await?;
        decode(response).await
    }

    // --- plumbing -----------------------------------------------------------

    /// Send an authenticated request, refreshing the token at most once.
    ///
    /// `build` is called once per attempt with the token to use.
    async fn send_authorized<F>(
        &self,
        operation: &'static str,
        build: F,
    ) -> Result<Response, ApiError>
    where
        F: Fn(&Client, &str) -> Result<RequestBuilder, ApiError>,
    {
        let token = self.session.token()?.ok_or(ApiError::NotAuthenticated)?;

        let response = self.dispatch(operation, build(&self.http, &token)?).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        tracing::info!(operation, "Request unauthorized, refreshing session token");
        let fresh = match self.refresh_after_unauthorized(&token).await {
            Ok(fresh) => fresh,
            Err(e) => {
                tracing::warn!(operation, error = %e, "Token refresh failed, clearing session");
                metrics::counter!("auth_refresh_failed_total").increment(1);
                self.session.clear()?;
                return Err(ApiError::AuthExpired);
            }
        };

        let retry = self.dispatch(operation, build(&self.http, &fresh)?).await?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!(operation, "Retry after refresh still unauthorized, clearing session");
            self.session.clear()?;
            return Err(ApiError::AuthExpired);
        }
        check_status(retry).await
    }

    /// Exchange `stale` for a new token.
    ///
    /// If another request already replaced `stale` while this one waited for
    /// the refresh lock, that token is reused and no refresh call is made.
    async fn refresh_after_unauthorized(&self, stale: &str) -> Result<String, ApiError> {
        let _guard = self.session.refresh_guard().await;

        match self.session.token()? {
            Some(current) if current != stale => {
                tracing::debug!("Token already refreshed by a concurrent request");
                return Ok(current);
            }
            Some(_) => {}
            None => return Err(ApiError::NotAuthenticated),
        }

        metrics::counter!("auth_refresh_total").increment(1);
        let url = self.endpoint(&["auth", "refresh"]);
        let response = self
            .dispatch("refresh", self.http.post(url).bearer_auth(stale))
            .await?;
        let token: TokenResponse = decode(check_status(response).await?).await?;
        self.session.store_token(&token.access_token)?;
        tracing::info!("Session token refreshed");
        Ok(token.access_token)
    }

    async fn dispatch(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<Response, ApiError> {
        let start = std::time::Instant::now();
        let response = request.send().await.map_err(|e| {
            tracing::warn!(operation, error = %e, "Request failed before a response");
            ApiError::Http(e)
        })?;

        let elapsed = start.elapsed();
        metrics::counter!("api_requests_total", "operation" => operation).increment(1);
        metrics::histogram!("api_request_seconds", "operation" => operation)
            .record(elapsed.as_secs_f64());
        tracing::debug!(
            operation,
            status = response.status().as_u16(),
            latency_ms = elapsed.as_millis() as u64,
            "Backend responded"
        );
        Ok(response)
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.api_root.clone();
        // Checked in `new`.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

/// Pass 2xx through, turn anything else into an [`ApiError`].
async fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = extract_detail(&body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    });

    Err(match status {
        StatusCode::UNAUTHORIZED => ApiError::Unauthorized { detail },
        StatusCode::FORBIDDEN => ApiError::QuotaExceeded { detail },
        StatusCode::NOT_FOUND => ApiError::NotFound { detail },
        _ => ApiError::Status { status, detail },
    })
}

/// Pull a message out of a FastAPI error body (`{"detail": ...}`).
///
/// String details are returned as is. Structured details are flattened to
/// their `message` field when present, else rendered as JSON. Non-JSON bodies
/// come back verbatim.
pub(crate) fn extract_detail(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }

    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return Some(body.to_string());
    };

    match value.get("detail") {
        Some(serde_json::Value::String(detail)) => Some(detail.clone()),
        Some(serde_json::Value::Null) | None => Some(body.to_string()),
        Some(structured) => Some(
            structured
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| structured.to_string()),
        ),
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not logged in")]
    NotAuthenticated,

    #[error("Session expired, please log in again")]
    AuthExpired,

    #[error("Unauthorized: {detail}")]
    Unauthorized { detail: String },

    #[error("Upload limit reached: {detail}")]
    QuotaExceeded { detail: String },

    #[error("Not found: {detail}")]
    NotFound { detail: String },

    #[error("Backend returned {status}: {detail}")]
    Status { status: StatusCode, detail: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Validation failed: {0}")]
    Validation(#[from] garde::Report),

    #[error("Client configuration error: {0}")]
    Config(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to decode backend response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Session storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ApiError {
    /// The user has to log in again before anything else will work.
    pub fn requires_login(&self) -> bool {
        matches!(self, ApiError::NotAuthenticated | ApiError::AuthExpired)
    }

    /// Repeating the same request will not change the answer.
    ///
    /// Network failures, 5xx, 408 and 429 are worth another try. Other 4xx
    /// answers and local request errors are not.
    pub fn is_permanent(&self) -> bool {
        match self {
            ApiError::Unauthorized { .. }
            | ApiError::QuotaExceeded { .. }
            | ApiError::NotFound { .. }
            | ApiError::InvalidRequest(_)
            | ApiError::Validation(_)
            | ApiError::Config(_) => true,
            ApiError::Status { status, .. } => {
                status.is_client_error()
                    && *status != StatusCode::REQUEST_TIMEOUT
                    && *status != StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    /// Message suitable for a toast. Backend details are surfaced verbatim.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::NotAuthenticated => "You must be logged in.".to_string(),
            ApiError::AuthExpired => "Your session has expired. Please log in again.".to_string(),
            ApiError::Unauthorized { detail }
            | ApiError::QuotaExceeded { detail }
            | ApiError::NotFound { detail }
            | ApiError::Status { detail, .. } => detail.clone(),
            ApiError::InvalidRequest(msg) | ApiError::Config(msg) => msg.clone(),
            ApiError::Validation(report) => report.to_string(),
            ApiError::Http(_) => "Could not reach the server. Please try again.".to_string(),
            ApiError::Decode(_) => "The server sent an unexpected response.".to_string(),
            ApiError::Storage(e) => e.to_string(),
        }
    }
}
