use anyhow::{anyhow, Context, Result};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, MethodRouter};
use axum::{Json, Router};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use super::guard::{self, append_cookie, append_csrf_cookies, cookie_value, ClientIp, CookieOpts, CurrentUser};
use crate::config::{Config, PROFILE_API, PROFILE_AUTH, PROFILE_TRANSLATION, PROFILE_UPLOAD};
use crate::error::ApiError;
use crate::progress::{ProgressHub, ReconnectPolicy};
use crate::resilience::circuit_breaker::{BreakerRegistry, BreakerSettings};
use crate::resilience::pool::ConnectionPool;
use crate::security::audit_log::AuditLogger;
use crate::security::auth::{build_provider, AuthProvider, AuthUser, SessionStore};
use crate::security::csrf::{CsrfManager, IssuedToken};
use crate::security::rate_limit::RateLimiterRegistry;
use crate::security::rotation::{spawn_rotation, RotationSettings};
use crate::translation::jobs::{JobStatus, SIDECAR_RESOURCE};
use crate::utils::task::{spawn_periodic, TaskHandle};
use crate::translation::{
    AnthropicTranslator, JobRunner, TranslateError, TranslationService, Translator, UploadStore,
};

pub type SharedState = Arc<AppState>;

const PPTX_MIME: &str = "application/vnd.openxmlformats-officedocument.presentationml.presentation";
const MAX_TEXTS_PER_REQUEST: usize = 500;
const ROTATION_JITTER: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct AppState {
    pub config: Arc<Config>,
    pub csrf: CsrfManager,
    pub limiters: RateLimiterRegistry,
    pub sessions: SessionStore,
    pub auth: Arc<dyn AuthProvider>,
    pub audit: AuditLogger,
    pub breakers: BreakerRegistry,
    pub pool: ConnectionPool,
    pub translation: Arc<TranslationService>,
    pub uploads: UploadStore,
    pub jobs: JobRunner,
    pub progress: ProgressHub,
    pub reconnect: ReconnectPolicy,
}

impl AppState {
    /// Must be called inside a tokio runtime; the translation batcher spawns
    /// its worker here.
    pub fn new(config: Config, auth: Arc<dyn AuthProvider>, translator: Arc<dyn Translator>) -> Self {
        let pool = ConnectionPool::new(&config.pool.limits);
        let breakers = BreakerRegistry::new(BreakerSettings::from(&config.breaker));
        let translation = Arc::new(TranslationService::new(
            &config,
            translator,
            pool.clone(),
            &breakers,
        ));
        let progress = ProgressHub::new();
        let jobs = JobRunner::new(
            &config.sidecar,
            translation.clone(),
            progress.clone(),
            pool.clone(),
            breakers.get(SIDECAR_RESOURCE),
        );

        Self {
            csrf: CsrfManager::new(config.csrf.clone()),
            limiters: RateLimiterRegistry::new(&config.rate_limits),
            sessions: SessionStore::new(),
            auth,
            audit: AuditLogger::new(),
            breakers,
            pool,
            translation,
            uploads: UploadStore::new(&config.sidecar),
            jobs,
            progress,
            reconnect: ReconnectPolicy::default(),
            config: Arc::new(config),
        }
    }

    pub fn from_config(config: Config) -> Result<Self> {
        let auth = build_provider(&config.auth)?;
        let translator = AnthropicTranslator::new(&config.translation)?;
        Ok(Self::new(config, auth, Arc::new(translator)))
    }

    fn session_cookie(&self, value: &str, max_age: Option<u64>, headers: &mut HeaderMap) -> Result<(), ApiError> {
        append_cookie(
            headers,
            &self.config.auth.session_cookie,
            value,
            CookieOpts {
                http_only: true,
                secure: self.config.csrf.secure_cookies,
                max_age,
            },
        )
    }
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub user: AuthUser,
    pub csrf: IssuedToken,
}

#[derive(Deserialize)]
pub struct TranslateRequest {
    pub texts: Vec<String>,
    #[serde(default)]
    pub target_language: Option<String>,
}

#[derive(Deserialize)]
pub struct JobRequest {
    pub file_id: String,
    #[serde(default)]
    pub target_language: Option<String>,
}

fn translate_error(err: TranslateError) -> ApiError {
    match err {
        TranslateError::Unavailable(_) => ApiError::ServiceUnavailable("Translation service".to_string()),
        TranslateError::Failed(msg) => ApiError::Internal(anyhow!(msg)),
    }
}

// Login accepts JSON or a urlencoded form.
fn parse_login(content_type: Option<&str>, body: &[u8]) -> Option<LoginRequest> {
    if content_type.is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded")) {
        let mut username = None;
        let mut password = None;
        for (k, v) in url::form_urlencoded::parse(body) {
            match k.as_ref() {
                "username" => username = Some(v.into_owned()),
                "password" => password = Some(v.into_owned()),
                _ => {}
            }
        }
        return Some(LoginRequest {
            username: username?,
            password: password?,
        });
    }
    serde_json::from_slice(body).ok()
}

// Health check
async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "translation": state.translation.stats(),
        "breakers": state.breakers.statuses(),
        "csrf_sessions": state.csrf.active_sessions().await,
    }))
}

/// Issues (or re-issues) the CSRF token for the caller's session, creating
/// an anonymous session when there is none.
async fn issue_csrf(State(state): State<SharedState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let mut out = HeaderMap::new();
    let existing = match cookie_value(&headers, &state.config.auth.session_cookie) {
        Some(sid) if state.sessions.get_session(sid).await.is_some() => Some(sid.to_string()),
        _ => None,
    };
    let sid = match existing {
        Some(sid) => sid,
        None => {
            let sid = state.sessions.create_session(None).await;
            state.session_cookie(&sid, None, &mut out)?;
            sid
        }
    };

    let token = state.csrf.token_for(&sid).await;
    append_csrf_cookies(&mut out, &state, &token)?;
    Ok((out, Json(IssuedToken::from(&token))).into_response())
}

async fn login(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let req = parse_login(content_type, &body)
        .ok_or_else(|| ApiError::BadRequest("username and password are required".to_string()))?;

    let Some(user) = state.auth.authenticate(&req.username, &req.password).await else {
        state.audit.login_failure(&req.username, &ip);
        return Err(ApiError::Unauthorized);
    };

    // fresh session on login; the pre-login session and its token are dropped
    if let Some(old) = cookie_value(&headers, &state.config.auth.session_cookie) {
        state.sessions.delete_session(old).await;
        state.csrf.revoke(old).await;
    }
    let sid = state.sessions.create_session(Some(user.clone())).await;
    let token = state.csrf.issue(&sid).await;
    state.audit.login_success(&user.id, &sid);

    let mut out = HeaderMap::new();
    state.session_cookie(&sid, None, &mut out)?;
    append_csrf_cookies(&mut out, &state, &token)?;
    let body = LoginResponse {
        user,
        csrf: IssuedToken::from(&token),
    };
    Ok((out, Json(body)).into_response())
}

async fn logout(State(state): State<SharedState>, headers: HeaderMap) -> Result<Response, ApiError> {
    if let Some(sid) = cookie_value(&headers, &state.config.auth.session_cookie) {
        state.sessions.delete_session(sid).await;
        state.csrf.revoke(sid).await;
        state.audit.logout(sid);
    }

    let mut out = HeaderMap::new();
    state.session_cookie("", Some(0), &mut out)?;
    let cfg = state.csrf.config();
    for (name, http_only) in [(&cfg.cookie_name, false), (&cfg.meta_cookie_name, true)] {
        append_cookie(
            &mut out,
            name,
            "",
            CookieOpts {
                http_only,
                secure: cfg.secure_cookies,
                max_age: Some(0),
            },
        )?;
    }
    Ok((out, Json(json!({"status": "logged out"}))).into_response())
}

async fn upload(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    state
        .uploads
        .validate(&body)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let file_name = headers
        .get("x-file-name")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("presentation.pptx");
    let file = state.uploads.save(&user.id, file_name, &body).await?;
    Ok((StatusCode::CREATED, Json(file)).into_response())
}

async fn translate_texts(
    State(state): State<SharedState>,
    CurrentUser(_user): CurrentUser,
    Json(req): Json<TranslateRequest>,
) -> Result<Response, ApiError> {
    if req.texts.len() > MAX_TEXTS_PER_REQUEST {
        return Err(ApiError::BadRequest(format!(
            "at most {MAX_TEXTS_PER_REQUEST} texts per request"
        )));
    }
    let lang = req
        .target_language
        .unwrap_or_else(|| state.config.translation.default_language.clone());
    let translations = state
        .translation
        .translate_all(&req.texts, &lang)
        .await
        .map_err(translate_error)?;
    Ok(Json(json!({"target_language": lang, "translations": translations})).into_response())
}

async fn create_job(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<JobRequest>,
) -> Result<Response, ApiError> {
    let file = state
        .uploads
        .get(&req.file_id, &user.id)
        .await
        .ok_or_else(|| ApiError::NotFound("File".to_string()))?;
    let lang = req
        .target_language
        .unwrap_or_else(|| state.config.translation.default_language.clone());
    let job = state.jobs.start(file, &lang).await;
    debug!(job_id = %job.job_id, user = %user.id, "job queued");
    let events_url = format!("/api/jobs/{}/events", job.job_id);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "job": job,
            "events_url": events_url,
            "reconnect_delays_ms": state.reconnect.schedule_ms(),
        })),
    )
        .into_response())
}

async fn job_events(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    state
        .jobs
        .get(&job_id, &user.id)
        .await
        .ok_or_else(|| ApiError::NotFound("Job".to_string()))?;
    let events = state
        .progress
        .subscribe(&job_id)
        .ok_or_else(|| ApiError::NotFound("Job".to_string()))?;

    let hello = Event::default().retry(state.reconnect.base).comment("connected");
    let stream = stream::once(async move { Ok::<_, axum::Error>(hello) })
        .chain(events.map(|ev| Event::default().event(ev.name()).json_data(&ev)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
}

async fn download(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job = state
        .jobs
        .get(&job_id, &user.id)
        .await
        .ok_or_else(|| ApiError::NotFound("Job".to_string()))?;
    let path = match (job.status, job.output) {
        (JobStatus::Completed, Some(path)) => path,
        (JobStatus::Running, _) => {
            return Err(ApiError::BadRequest("job is still running".to_string()));
        }
        _ => return Err(ApiError::NotFound("Translated document".to_string())),
    };

    let content = tokio::fs::read(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(PPTX_MIME));
    let disposition = format!("attachment; filename=\"translated_{}\"", job.file_name);
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition).map_err(anyhow::Error::from)?,
    );
    info!(job_id = %job_id, bytes = content.len(), "translated document downloaded");
    Ok((headers, content).into_response())
}

// Rate limiting runs first (outermost), then CSRF, then the handler.
fn guarded(route: MethodRouter<SharedState>, state: &SharedState, profile: &'static str) -> MethodRouter<SharedState> {
    route
        .layer(middleware::from_fn_with_state(state.clone(), guard::csrf_protect))
        .layer(middleware::from_fn_with_state((state.clone(), profile), guard::rate_limit))
}

pub fn create_router(state: SharedState) -> Router {
    let upload_limit = state.config.sidecar.max_upload_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/api/csrf", guarded(get(issue_csrf), &state, PROFILE_API))
        .route("/api/auth/login", guarded(post(login), &state, PROFILE_AUTH))
        .route("/api/auth/logout", guarded(post(logout), &state, PROFILE_API))
        .route(
            "/api/upload",
            guarded(
                post(upload).layer(DefaultBodyLimit::max(upload_limit)),
                &state,
                PROFILE_UPLOAD,
            ),
        )
        .route("/api/translate", guarded(post(translate_texts), &state, PROFILE_TRANSLATION))
        .route("/api/jobs", guarded(post(create_job), &state, PROFILE_TRANSLATION))
        .route("/api/jobs/{id}/events", guarded(get(job_events), &state, PROFILE_API))
        .route("/api/jobs/{id}/download", guarded(get(download), &state, PROFILE_API))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("shutdown signal received");
}

// Deletes finished jobs and old uploads once they pass the retention period.
fn spawn_job_sweeper(state: &SharedState) -> TaskHandle {
    let jobs = state.jobs.clone();
    let uploads = state.uploads.clone();
    let retention = state.config.sidecar.retention();
    spawn_periodic("job sweeper", state.config.sidecar.sweep_interval(), Duration::ZERO, move || {
        let jobs = jobs.clone();
        let uploads = uploads.clone();
        async move {
            let jobs_removed = jobs.purge_finished(retention).await;
            let uploads_removed = uploads.purge_older_than(retention).await;
            if jobs_removed + uploads_removed > 0 {
                info!(jobs = jobs_removed, uploads = uploads_removed, "expired job data removed");
            }
        }
    })
}

pub async fn serve(config: Config, port: u16) -> Result<()> {
    let state = Arc::new(AppState::from_config(config)?);
    let rotation = spawn_rotation(
        state.csrf.clone(),
        state.sessions.clone(),
        RotationSettings {
            interval: state.config.csrf.rotation_interval(),
            max_jitter: ROTATION_JITTER,
            session_idle: state.config.auth.session_idle(),
        },
        state.audit.clone(),
    );
    let sweeper = spawn_job_sweeper(&state);

    let app = create_router(state.clone()).into_make_service_with_connect_info::<SocketAddr>();
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    rotation.dispose().await;
    sweeper.dispose().await;
    state.translation.dispose().await;
    state.pool.close();
    info!("HTTP server stopped");
    Ok(())
}
