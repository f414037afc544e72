//! Test helpers: an in-process fake of the analysis backend and a wired client
#![allow(dead_code)]

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use outfit_scan::config::ClientConfig;
use outfit_scan::models::notification::{Notification, NotificationAction, NotificationLevel};
use outfit_scan::services::api::ApiClient;
use outfit_scan::services::jobs::{AnalysisClient, PollPolicy};
use outfit_scan::services::notify::Notifier;
use outfit_scan::services::quota::QuotaTracker;
use outfit_scan::services::session::{AuthSession, ResultHandoff};
use outfit_scan::services::storage::MemoryStore;

use crate::fixtures;

/// Password the fake accepts on login.
pub const GOOD_PASSWORD: &str = "correct-horse-battery";

/// How the fake answers `POST /upload/`.
#[derive(Debug, Clone)]
pub enum SubmitBehavior {
    Accept(String),
    Reject(StatusCode, Value),
}

/// One scripted answer to `GET /upload/job/{id}`.
#[derive(Debug, Clone)]
pub enum Scripted {
    Snapshot(Value),
    Status(StatusCode),
    /// Revoke the presented token and answer 401.
    Expire,
}

#[derive(Debug)]
pub struct FakeState {
    pub valid_tokens: HashSet<String>,
    /// Token handed out by `/auth/refresh`. `None` makes refresh fail.
    pub refresh_issues: Option<String>,
    pub submit: SubmitBehavior,
    pub scripts: HashMap<String, VecDeque<Scripted>>,
    pub history: Vec<Value>,
    pub upload_limit: Value,

    pub refresh_tokens: Vec<String>,
    pub submit_tokens: Vec<String>,
    pub submit_fields: Vec<(String, String)>,
    pub poll_tokens: Vec<String>,
    pub list_limits: Vec<u32>,
    pub deleted: Vec<String>,
    pub upload_limit_calls: u32,
    pub me_calls: u32,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            valid_tokens: HashSet::new(),
            refresh_issues: None,
            submit: SubmitBehavior::Accept("job-1".to_string()),
            scripts: HashMap::new(),
            history: Vec::new(),
            upload_limit: fixtures::free_tier_limit(1),
            refresh_tokens: Vec::new(),
            submit_tokens: Vec::new(),
            submit_fields: Vec::new(),
            poll_tokens: Vec::new(),
            list_limits: Vec::new(),
            deleted: Vec::new(),
            upload_limit_calls: 0,
            me_calls: 0,
        }
    }
}

/// Shared handle to the fake's state, for setup and for assertions.
#[derive(Clone, Default)]
pub struct FakeBackend {
    inner: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.inner.lock().expect("fake backend lock");
        f(&mut state)
    }

    pub fn accept_token(self, token: &str) -> Self {
        self.with(|s| s.valid_tokens.insert(token.to_string()));
        self
    }

    pub fn refresh_to(self, token: Option<&str>) -> Self {
        self.with(|s| s.refresh_issues = token.map(str::to_string));
        self
    }

    pub fn on_submit(self, behavior: SubmitBehavior) -> Self {
        self.with(|s| s.submit = behavior);
        self
    }

    pub fn script(self, job_id: &str, steps: Vec<Scripted>) -> Self {
        self.with(|s| s.scripts.insert(job_id.to_string(), steps.into()));
        self
    }

    pub fn history(self, jobs: Vec<Value>) -> Self {
        self.with(|s| s.history = jobs);
        self
    }

    pub fn poll_count(&self) -> usize {
        self.with(|s| s.poll_tokens.len())
    }

    pub fn submit_count(&self) -> usize {
        self.with(|s| s.submit_tokens.len())
    }

    pub fn refresh_count(&self) -> usize {
        self.with(|s| s.refresh_tokens.len())
    }

    /// Serve on an ephemeral localhost port and return the base URL.
    pub async fn spawn(&self) -> String {
        let app = Router::new()
            .route("/api/auth/login", post(login))
            .route("/api/auth/register", post(register))
            .route("/api/auth/refresh", post(refresh))
            .route("/api/auth/me", get(me))
            .route("/api/upload/", post(submit))
            .route("/api/upload/jobs", get(list_jobs))
            .route("/api/upload/job/{job_id}", get(job_status).delete(delete_job))
            .route("/api/subscription/upload-limit", get(upload_limit))
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake backend");
        let addr = listener.local_addr().expect("fake backend addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("fake backend crashed");
        });
        format!("http://{addr}")
    }
}

fn bearer(headers: &HeaderMap) -> String {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string()
}

fn detail(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "detail": message }))).into_response()
}

fn unauthorized() -> Response {
    detail(StatusCode::UNAUTHORIZED, "Could not validate credentials")
}

fn token_body(token: &str) -> Response {
    Json(json!({ "access_token": token, "token_type": "bearer" })).into_response()
}

async fn login(State(fake): State<FakeBackend>, Json(body): Json<Value>) -> Response {
    if body["password"] != GOOD_PASSWORD {
        return detail(StatusCode::UNAUTHORIZED, "Incorrect email or password");
    }
    fake.with(|s| s.valid_tokens.insert("login-token".to_string()));
    token_body("login-token")
}

async fn register(State(fake): State<FakeBackend>, Json(body): Json<Value>) -> Response {
    if body["username"] == "taken" {
        return detail(StatusCode::BAD_REQUEST, "Username already registered");
    }
    fake.with(|s| s.valid_tokens.insert("register-token".to_string()));
    Json(json!({
        "access_token": "register-token",
        "token_type": "bearer",
        "needs_quiz": true,
        "is_new_user": true
    }))
    .into_response()
}

async fn refresh(State(fake): State<FakeBackend>, headers: HeaderMap) -> Response {
    let presented = bearer(&headers);
    fake.with(|s| {
        s.refresh_tokens.push(presented);
        match s.refresh_issues.clone() {
            Some(fresh) => {
                s.valid_tokens.insert(fresh.clone());
                token_body(&fresh)
            }
            None => detail(StatusCode::UNAUTHORIZED, "Token can no longer be refreshed"),
        }
    })
}

async fn me(State(fake): State<FakeBackend>, headers: HeaderMap) -> Response {
    let token = bearer(&headers);
    fake.with(|s| {
        s.me_calls += 1;
        if !s.valid_tokens.contains(&token) {
            return unauthorized();
        }
        Json(json!({
            "id": "u1",
            "email": "ana@example.com",
            "username": "ana",
            "subscription_status": "free",
            "weekly_uploads_used": 1,
            "followers": [],
            "following": []
        }))
        .into_response()
    })
}

async fn submit(State(fake): State<FakeBackend>, headers: HeaderMap, mut form: Multipart) -> Response {
    let mut fields = Vec::new();
    while let Ok(Some(field)) = form.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        if name == "image" {
            let described = format!(
                "{}|{}",
                field.file_name().unwrap_or_default(),
                field.content_type().unwrap_or_default()
            );
            let _ = field.bytes().await;
            fields.push((name, described));
        } else {
            fields.push((name, field.text().await.unwrap_or_default()));
        }
    }

    let token = bearer(&headers);
    fake.with(|s| {
        s.submit_tokens.push(token.clone());
        s.submit_fields = fields;
        if !s.valid_tokens.contains(&token) {
            return unauthorized();
        }
        match &s.submit {
            SubmitBehavior::Accept(job_id) => (
                StatusCode::ACCEPTED,
                Json(json!({
                    "job_id": job_id,
                    "status": "pending",
                    "message": "Image submitted for analysis"
                })),
            )
                .into_response(),
            SubmitBehavior::Reject(status, body) => (*status, Json(body.clone())).into_response(),
        }
    })
}

async fn job_status(
    State(fake): State<FakeBackend>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Response {
    let token = bearer(&headers);
    fake.with(|s| {
        s.poll_tokens.push(token.clone());
        if !s.valid_tokens.contains(&token) {
            return unauthorized();
        }
        let Some(steps) = s.scripts.get_mut(&job_id) else {
            return detail(StatusCode::NOT_FOUND, "Job not found");
        };
        let step = if steps.len() > 1 {
            steps.pop_front()
        } else {
            steps.front().cloned()
        };
        match step {
            Some(Scripted::Snapshot(body)) => Json(body).into_response(),
            Some(Scripted::Status(status)) => detail(status, "scripted failure"),
            Some(Scripted::Expire) => {
                s.valid_tokens.remove(&token);
                unauthorized()
            }
            None => detail(StatusCode::NOT_FOUND, "Job not found"),
        }
    })
}

async fn list_jobs(
    State(fake): State<FakeBackend>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let token = bearer(&headers);
    let limit: u32 = params
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(10);
    fake.with(|s| {
        if !s.valid_tokens.contains(&token) {
            return unauthorized();
        }
        s.list_limits.push(limit);
        let jobs: Vec<Value> = s.history.iter().take(limit as usize).cloned().collect();
        Json(json!({ "jobs": jobs })).into_response()
    })
}

async fn delete_job(
    State(fake): State<FakeBackend>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Response {
    let token = bearer(&headers);
    fake.with(|s| {
        if !s.valid_tokens.contains(&token) {
            return unauthorized();
        }
        let before = s.history.len();
        s.history.retain(|job| job["job_id"] != job_id.as_str());
        if s.history.len() == before {
            return detail(StatusCode::NOT_FOUND, "Job not found or not owned by user");
        }
        s.deleted.push(job_id);
        Json(json!({ "message": "Job deleted" })).into_response()
    })
}

async fn upload_limit(State(fake): State<FakeBackend>, headers: HeaderMap) -> Response {
    let token = bearer(&headers);
    fake.with(|s| {
        s.upload_limit_calls += 1;
        if !s.valid_tokens.contains(&token) {
            return unauthorized();
        }
        Json(s.upload_limit.clone()).into_response()
    })
}

/// Notifier that keeps everything it is sent.
#[derive(Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn all(&self) -> Vec<Notification> {
        self.seen.lock().expect("notifier lock").clone()
    }

    pub fn errors(&self) -> Vec<Notification> {
        self.all()
            .into_iter()
            .filter(|n| n.level == NotificationLevel::Error)
            .collect()
    }

    pub fn with_action(&self, action: NotificationAction) -> Option<Notification> {
        self.all().into_iter().find(|n| n.action == Some(action))
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.seen.lock().expect("notifier lock").push(notification);
    }
}

/// Poll fast enough that workflow tests finish in well under a second.
pub fn fast_policy() -> PollPolicy {
    PollPolicy::every(Duration::from_millis(20))
}

/// A client wired against a running fake backend.
pub struct Harness {
    pub backend: FakeBackend,
    pub base_url: String,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub session: AuthSession,
    pub api: Arc<ApiClient>,
    pub quota: QuotaTracker,
    pub handoff: ResultHandoff,
    pub analysis: AnalysisClient,
}

impl Harness {
    pub async fn start(backend: FakeBackend, policy: PollPolicy) -> Self {
        let base_url = backend.spawn().await;
        let config = ClientConfig::for_base_url(base_url.clone());

        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let session = AuthSession::new(store.clone());
        let api = Arc::new(ApiClient::new(&config, session.clone()).expect("api client"));
        let quota = QuotaTracker::new(api.clone());
        let handoff = ResultHandoff::new(store.clone());
        let analysis = AnalysisClient::new(
            api.clone(),
            notifier.clone(),
            handoff.clone(),
            quota.clone(),
            policy,
        );

        Self {
            backend,
            base_url,
            store,
            notifier,
            session,
            api,
            quota,
            handoff,
            analysis,
        }
    }

    /// Start with `token` already stored, as if the user had logged in earlier.
    pub async fn logged_in(backend: FakeBackend, policy: PollPolicy, token: &str) -> Self {
        let harness = Self::start(backend, policy).await;
        harness.session.store_token(token).expect("store token");
        harness
    }
}
