//! HTTP Control Surface (§4.7): Axum router over the Session Registry. Handlers are thin —
//! validate, call the registry, serialize the response — and every fallible path resolves
//! through `VtError` (§7) into `{error, code}` rather than constructing ad hoc error bodies.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower::ServiceExt;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeFile;
use tracing::info;

use common::auth::AuthState;
use common::config::{AuthMode, Config};
use common::error::VtError;
use common::hub::Hub;
use common::keymap;
use common::registry::Registry;
use common::session::{SessionId, SessionMetadata, SessionSpec, SessionStatus};

use crate::rate_limit::{RateLimiter, OTHER_API_CAP_PER_MINUTE, SESSION_CREATE_CAP_PER_MINUTE};

const SHUTDOWN_FLUSH_BUDGET: Duration = Duration::from_secs(5);

/// Shared state threaded through every handler via `State<AppState>`.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub auth: Arc<AuthState>,
    pub config: Arc<Config>,
    pub limiter: Arc<RateLimiter>,
    pub started_at: Instant,
}

/// Error returned to `main` when the server fails to start or run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed to bind: {0}")]
    Bind(std::io::Error),
    #[error("fatal runtime error: {0}")]
    Runtime(Box<dyn std::error::Error + Send + Sync>),
}

/// Binds, builds the router, serves, and drives graceful shutdown (§5) on SIGINT/ctrl-c.
pub async fn run_server(config: Arc<Config>) -> Result<(), RunError> {
    if config.auth_mode == AuthMode::Password && config.auth_password_hash.is_none() {
        return Err(RunError::Config(
            "AUTH_MODE=password requires AUTH_PASSWORD_HASH to be set".into(),
        ));
    }
    std::fs::create_dir_all(&config.recordings_dir)
        .map_err(|e| RunError::Config(format!("failed to create recordings dir: {e}")))?;

    let registry = Arc::new(Registry::new(config.clone()));
    registry.recover();

    let state = AppState {
        registry: registry.clone(),
        auth: Arc::new(AuthState::new()),
        config: config.clone(),
        limiter: Arc::new(RateLimiter::new()),
        started_at: Instant::now(),
    };

    spawn_token_sweeper(state.auth.clone());

    let app = build_router(state);
    let addr: SocketAddr = format!("{}:{}", config.bind_addr, config.port)
        .parse()
        .map_err(|e| RunError::Config(format!("invalid bind address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(RunError::Bind)?;
    info!(addr = %addr, "vt-server listening");

    let hub = registry.hub();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub, registry, config))
        .await
        .map_err(|e| RunError::Runtime(Box::new(e)))?;
    Ok(())
}

fn spawn_token_sweeper(auth: Arc<AuthState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(300));
        loop {
            ticker.tick().await;
            auth.sweep_expired();
        }
    });
}

async fn shutdown_signal(hub: Arc<Hub>, registry: Arc<Registry>, config: Arc<Config>) {
    let _ = tokio::signal::ctrl_c().await;
    let _ = &config;
    info!("shutdown requested: notifying subscribers and draining sessions");
    hub.publish_global_event(serde_json::json!({"kind": "going-away"}));
    tokio::time::sleep(SHUTDOWN_FLUSH_BUDGET).await;
    for meta in registry.list().await {
        if meta.status == SessionStatus::Running {
            let _ = registry.kill(meta.id).await;
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/sessions", get(list_sessions_handler).post(create_session_handler))
        .route("/api/sessions/{id}", get(get_session_handler).delete(delete_session_handler))
        .route("/api/sessions/{id}/input", post(input_handler))
        .route("/api/sessions/{id}/resize", post(resize_handler))
        .route("/api/sessions/{id}/text", get(text_handler))
        .route("/api/sessions/{id}/recording", get(recording_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit_layer))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/auth/token", post(auth_token_handler))
        .route("/api/auth/config", get(auth_config_handler))
        .route("/api/auth/verify", get(auth_verify_handler))
        .route("/api/auth/logout", post(auth_logout_handler))
        .route("/ws", get(crate::ws::ws_handler))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

type ApiError = (StatusCode, Json<Value>);

fn err_response(e: VtError) -> ApiError {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(e.to_body()))
}

fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse::<SessionId>().map_err(|_| err_response(VtError::NotFound(raw.to_string())))
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::AUTHORIZATION)?.to_str().ok()?.strip_prefix("Bearer ")
}

fn identity_of(headers: &HeaderMap) -> String {
    bearer_token(headers).unwrap_or("anon").to_string()
}

async fn require_auth(State(state): State<AppState>, headers: HeaderMap, req: Request, next: Next) -> Response {
    if state.auth.verify(&state.config, bearer_token(&headers)) {
        next.run(req).await
    } else {
        err_response(VtError::Unauthenticated).into_response()
    }
}

async fn rate_limit_layer(State(state): State<AppState>, headers: HeaderMap, req: Request, next: Next) -> Response {
    let identity = identity_of(&headers);
    if state.limiter.check(&identity, "api", OTHER_API_CAP_PER_MINUTE) {
        next.run(req).await
    } else {
        err_response(VtError::ResourceExhausted("rate limit exceeded".into())).into_response()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthBody {
    status: &'static str,
    uptime: u64,
    version: &'static str,
    sessions: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        uptime: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.registry.active_sessions(),
    })
}

#[derive(Deserialize)]
struct TokenRequestBody {
    password: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponseBody {
    token: String,
    expires_in: u64,
}

async fn auth_token_handler(
    State(state): State<AppState>,
    Json(body): Json<TokenRequestBody>,
) -> Result<Json<TokenResponseBody>, ApiError> {
    let (token, expires_in) = state
        .auth
        .issue_token(&state.config, body.password.as_deref())
        .map_err(err_response)?;
    Ok(Json(TokenResponseBody { token, expires_in }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthConfigBody {
    no_auth: bool,
    enable_ssh_keys: bool,
    disallow_user_password: bool,
}

async fn auth_config_handler(State(state): State<AppState>) -> Json<AuthConfigBody> {
    Json(AuthConfigBody {
        no_auth: state.config.auth_mode == AuthMode::None,
        enable_ssh_keys: state.config.auth_mode == AuthMode::SshKey,
        disallow_user_password: state.config.auth_mode == AuthMode::SshKey,
    })
}

async fn auth_verify_handler(State(state): State<AppState>, headers: HeaderMap) -> StatusCode {
    if state.auth.verify(&state.config, bearer_token(&headers)) {
        StatusCode::OK
    } else {
        StatusCode::UNAUTHORIZED
    }
}

async fn auth_logout_handler(State(state): State<AppState>, headers: HeaderMap) -> StatusCode {
    if let Some(token) = bearer_token(&headers) {
        state.auth.logout(token);
    }
    StatusCode::NO_CONTENT
}

async fn list_sessions_handler(State(state): State<AppState>) -> Json<Vec<SessionMetadata>> {
    Json(state.registry.list().await)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandField {
    Single(String),
    Multiple(Vec<String>),
}

#[derive(Deserialize)]
struct CreateSessionBody {
    command: CommandField,
    #[serde(default)]
    args: Option<Vec<String>>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: Option<HashMap<String, String>>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    cols: Option<u16>,
    #[serde(default)]
    rows: Option<u16>,
}

async fn create_session_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateSessionBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let identity = identity_of(&headers);
    if !state.limiter.check(&identity, "session_create", SESSION_CREATE_CAP_PER_MINUTE) {
        return Err(err_response(VtError::ResourceExhausted("session creation rate limit exceeded".into())));
    }
    let command = match body.command {
        CommandField::Single(program) => {
            let mut argv = vec![program];
            if let Some(extra) = body.args {
                argv.extend(extra);
            }
            argv
        }
        CommandField::Multiple(argv) => argv,
    };
    let spec = SessionSpec {
        command,
        cwd: body.cwd.map(PathBuf::from),
        env: body.env.unwrap_or_default(),
        name: body.name,
        cols: body.cols.unwrap_or(SessionSpec::DEFAULT_COLS),
        rows: body.rows.unwrap_or(SessionSpec::DEFAULT_ROWS),
    };
    let meta = state.registry.create(spec).map_err(err_response)?;
    Ok((StatusCode::OK, Json(serde_json::json!({ "sessionId": meta.id }))))
}

async fn get_session_handler(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<SessionMetadata>, ApiError> {
    let id = parse_session_id(&id)?;
    let meta = state.registry.get(id).await.map_err(err_response)?;
    Ok(Json(meta))
}

async fn delete_session_handler(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let id = parse_session_id(&id)?;
    let _ = state.registry.kill(id).await;
    state.registry.remove(id).await.map_err(err_response)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct InputBody {
    text: Option<String>,
    key: Option<String>,
}

async fn input_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<InputBody>,
) -> Result<StatusCode, ApiError> {
    let id = parse_session_id(&id)?;
    let bytes = if let Some(key) = body.key {
        let mapped = keymap::resolve(&key)
            .ok_or_else(|| err_response(VtError::InvalidSpec(format!("unknown key: {key}"))))?;
        bytes::Bytes::from_static(mapped)
    } else if let Some(text) = body.text {
        bytes::Bytes::from(text.into_bytes())
    } else {
        return Err(err_response(VtError::InvalidSpec("neither text nor key present".into())));
    };
    state.registry.input(id, bytes).await.map_err(err_response)?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct ResizeBody {
    cols: u16,
    rows: u16,
}

async fn resize_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResizeBody>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_session_id(&id)?;
    let (cols, rows) = state.registry.resize(id, body.cols, body.rows).await.map_err(err_response)?;
    Ok(Json(serde_json::json!({ "cols": cols, "rows": rows })))
}

#[derive(Deserialize)]
struct TextQuery {
    #[serde(default)]
    styles: bool,
}

async fn text_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TextQuery>,
) -> Result<Response, ApiError> {
    let id = parse_session_id(&id)?;
    let text = state.registry.text(id, query.styles).map_err(err_response)?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response())
}

async fn recording_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let id = parse_session_id(&id)?;
    // Confirms the session is known before touching the filesystem; recovered sessions
    // keep their transcript path even without a live PTY.
    state.registry.get(id).await.map_err(err_response)?;
    let path = state
        .registry
        .transcript_path(id)
        .ok_or_else(|| err_response(VtError::NotFound(id.to_string())))?;

    let mut req = Request::builder().method("GET").uri("/");
    if let Some(range) = headers.get(header::RANGE) {
        req = req.header(header::RANGE, range);
    }
    let req = req.body(Body::empty()).expect("well-formed synthetic request");

    let mut response = ServeFile::new(&path)
        .oneshot(req)
        .await
        .map_err(|e: std::io::Error| err_response(VtError::IoError(e.to_string())))?
        .into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, "application/x-asciicast".parse().unwrap());
    Ok(response)
}
