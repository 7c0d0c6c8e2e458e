use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use blockwright_engine::{BuildConfig, BuildError, Builder, CheckpointStore, SandboxWorld};
use blockwright_protocol::{
    routes, BuildReport, BuildRequest, ErrorBody, Progress, ResumableCheckpoint, UndoReport,
};
use serde::Serialize;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub builder: Builder,
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub db_path: PathBuf,
    pub config: BuildConfig,
    /// Whether the dry-run world advertises bulk commands.
    pub bulk: bool,
}

impl ServerOptions {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            config: BuildConfig::default(),
            bulk: true,
        }
    }

    pub fn builder(&self) -> Builder {
        let world = SandboxWorld::new();
        world.set_bulk_enabled(self.bulk);
        Builder::new(
            Arc::new(world),
            CheckpointStore::new(self.db_path.clone()),
            self.config.clone(),
        )
    }
}

/// Reads a YAML build config. Missing keys keep their defaults.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<BuildConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(BuildConfig::default());
    }
    serde_yaml::from_str(&raw).with_context(|| format!("parse config: {}", path.display()))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(routes::HEALTH, get(health))
        .route(routes::BUILDS, post(api_build))
        .route(routes::CANCEL, post(api_cancel))
        .route(routes::UNDO, post(api_undo))
        .route(routes::PROGRESS, get(api_progress))
        .route(routes::RESUMABLE, get(api_resumable))
        .route(routes::RESUME, post(api_resume))
        .with_state(Arc::new(state))
        // Local security: allow only loopback + Tailscale by default.
        .layer(middleware::from_fn(ip_allowlist))
        // Builds write into a live world; never answer with `Access-Control-Allow-Origin: *`.
        .layer(local_only_cors())
}

type ApiError = (StatusCode, Json<ErrorBody>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn api_error(err: BuildError) -> ApiError {
    let status = match &err {
        BuildError::ConcurrencyConflict | BuildError::NotResumable(_) => StatusCode::CONFLICT,
        BuildError::NoUndoAvailable | BuildError::UnknownRun(_) => StatusCode::NOT_FOUND,
        BuildError::ResourceLimit { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
            kind: err.kind().to_string(),
        }),
    )
}

async fn health() -> &'static str {
    "ok"
}

async fn api_build(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BuildRequest>,
) -> ApiResult<BuildReport> {
    state
        .builder
        .run(req.blueprint, req.origin)
        .await
        .map(Json)
        .map_err(api_error)
}

#[derive(Debug, Serialize)]
struct CancelAck {
    was_active: bool,
}

async fn api_cancel(State(state): State<Arc<AppState>>) -> Json<CancelAck> {
    let was_active = state.builder.is_active();
    state.builder.cancel();
    Json(CancelAck { was_active })
}

async fn api_undo(State(state): State<Arc<AppState>>) -> ApiResult<UndoReport> {
    state.builder.undo().await.map(Json).map_err(api_error)
}

async fn api_progress(State(state): State<Arc<AppState>>) -> Json<Progress> {
    Json(state.builder.progress())
}

async fn api_resumable(State(state): State<Arc<AppState>>) -> ApiResult<Vec<ResumableCheckpoint>> {
    state.builder.list_resumable().map(Json).map_err(api_error)
}

async fn api_resume(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<BuildReport> {
    state
        .builder
        .resume(&run_id)
        .await
        .map(Json)
        .map_err(api_error)
}

pub async fn serve(addr: SocketAddr, options: ServerOptions) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    serve_listener(listener, options, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    Ok(())
}

pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    options: ServerOptions,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<SocketAddr> {
    let state = AppState {
        builder: options.builder(),
    };
    let app = build_router(state);
    let addr = listener.local_addr()?;
    info!(%addr, db = %options.db_path.display(), bulk = options.bulk, "server listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(addr)
}

async fn ip_allowlist(
    axum::extract::ConnectInfo(peer): axum::extract::ConnectInfo<SocketAddr>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let ip = peer.ip();
    if is_allowed_peer_ip(ip) {
        return next.run(req).await;
    }
    (StatusCode::FORBIDDEN, "forbidden").into_response()
}

fn is_allowed_peer_ip(ip: IpAddr) -> bool {
    if ip.is_loopback() {
        return true;
    }

    // Tailscale CGNAT range (100.64.0.0/10).
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 100 && (64..=127).contains(&o[1])
        }
        IpAddr::V6(_) => false,
    }
}

fn local_only_cors() -> CorsLayer {
    use axum::http::header;
    use axum::http::HeaderValue;
    use axum::http::Method;

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _req| {
            is_allowed_local_origin(origin)
        }))
}

fn is_allowed_local_origin(origin: &axum::http::HeaderValue) -> bool {
    let Ok(s) = origin.to_str() else {
        return false;
    };
    is_http_origin_for_host(s, "localhost") || is_http_origin_for_host(s, "127.0.0.1")
}

fn is_http_origin_for_host(origin: &str, host: &str) -> bool {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = origin.strip_prefix(scheme) {
            if let Some(after) = rest.strip_prefix(host) {
                // scheme://host[:port] only
                return after.is_empty() || after.starts_with(':');
            }
        }
    }
    false
}
