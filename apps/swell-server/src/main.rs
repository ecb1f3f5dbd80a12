use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use clap::Parser;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use swell_runtime::{
    canonical_path, is_internal_path, perform_handshake, ExpiryCheck, ManagerConfig, ManagerError,
    MemorySessionStore, PrefetchPool, PresentedPrincipal, Principal, SessionConfig, SessionManager,
    SessionStore,
};
use tokio::signal;
use tracing::{info, warn};

mod pages;
mod store;
mod telemetry;
mod ws;

const USER_HEADER: &str = "x-swell-user";

#[derive(Debug, Clone)]
struct ServerConfig {
    listen_addr: SocketAddr,
    redis_url: Option<String>,
    snapshot_ttl: Duration,
    handshake_timeout: Duration,
    trust_user_header: bool,
    prefetch_concurrency: usize,
    manager: ManagerConfig,
    session: SessionConfig,
}

#[derive(Debug, Parser)]
#[command(name = "swell-server", author, version, about = "Live UI session server")]
struct Cli {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "SWELL_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    listen_addr: String,

    /// Redis URI for session snapshots. Snapshots stay in process when unset.
    #[arg(long, env = "SWELL_REDIS_URL")]
    redis_url: Option<String>,

    /// Lifetime of a persisted snapshot.
    #[arg(long, env = "SWELL_SNAPSHOT_TTL_SECS", default_value_t = 3600)]
    snapshot_ttl_secs: u64,

    #[arg(long, env = "SWELL_MAX_SESSIONS", default_value_t = 10_000)]
    max_sessions: usize,

    /// How long a detached session may be resumed.
    #[arg(long, env = "SWELL_RESUME_WINDOW_SECS", default_value_t = 30)]
    resume_window_secs: u64,

    /// Attached sessions with no client activity for this long are closed.
    #[arg(long, env = "SWELL_IDLE_TIMEOUT_SECS", default_value_t = 1800)]
    idle_timeout_secs: u64,

    #[arg(long, env = "SWELL_SWEEP_INTERVAL_SECS", default_value_t = 15)]
    sweep_interval_secs: u64,

    /// Aggregate estimated session memory before LRU eviction.
    #[arg(long, env = "SWELL_MEMORY_BUDGET_MB")]
    memory_budget_mb: Option<usize>,

    #[arg(long, env = "SWELL_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,

    /// Patch frames kept per session for resync replay.
    #[arg(long, env = "SWELL_HISTORY_CAPACITY", default_value_t = 128)]
    history_capacity: usize,

    /// Prefetch renders allowed at once across all sessions.
    #[arg(long, env = "SWELL_PREFETCH_CONCURRENCY", default_value_t = 8)]
    prefetch_concurrency: usize,

    /// Maximum time clients have to send their hello frame.
    #[arg(long, env = "SWELL_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    handshake_timeout_secs: u64,

    /// Take the principal from the `x-swell-user` header (behind a trusted proxy only).
    #[arg(long, env = "SWELL_TRUST_USER_HEADER", default_value_t = false)]
    trust_user_header: bool,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.max_sessions == 0 {
            anyhow::bail!("max sessions must be at least 1");
        }
        if cli.heartbeat_secs == 0 {
            anyhow::bail!("heartbeat interval must be at least 1 second");
        }
        let manager = ManagerConfig {
            max_sessions: cli.max_sessions,
            idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
            sweep_interval: Duration::from_secs(cli.sweep_interval_secs.max(1)),
            memory_budget: cli.memory_budget_mb.map(|mb| mb * 1024 * 1024),
            ..ManagerConfig::default()
        }
        .with_resume_window(Duration::from_secs(cli.resume_window_secs));
        let heartbeat = Duration::from_secs(cli.heartbeat_secs);
        let session = SessionConfig {
            heartbeat_interval: heartbeat,
            read_deadline: heartbeat * 5 / 2,
            history_capacity: cli.history_capacity,
            ..SessionConfig::default()
        };
        Ok(ServerConfig {
            listen_addr,
            redis_url: cli.redis_url,
            snapshot_ttl: Duration::from_secs(cli.snapshot_ttl_secs),
            handshake_timeout: Duration::from_secs(cli.handshake_timeout_secs),
            trust_user_header: cli.trust_user_header,
            prefetch_concurrency: cli.prefetch_concurrency.max(1),
            manager,
            session,
        })
    }
}

struct AppState {
    manager: SessionManager,
    metrics: PrometheusHandle,
    handshake_timeout: Duration,
    trust_user_header: bool,
}

impl AppState {
    fn principal(&self, headers: &HeaderMap) -> Option<Principal> {
        if !self.trust_user_header {
            return None;
        }
        headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|user| !user.is_empty())
            .map(Principal::new)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        redis = config.redis_url.is_some(),
        max_sessions = config.manager.max_sessions,
        resume_window_secs = config.manager.resume_window.as_secs(),
        "starting swell server"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let store: Arc<dyn SessionStore> = match &config.redis_url {
        Some(url) => {
            let redis = store::RedisSessionStore::connect(url, config.snapshot_ttl.as_secs())
                .await
                .context("failed to connect to redis")?;
            Arc::new(redis)
        }
        None => MemorySessionStore::new() as Arc<dyn SessionStore>,
    };
    let manager = SessionManager::builder(pages::routes())
        .config(config.manager.clone())
        .session_config(config.session.clone())
        .store(store)
        .auth_check(Arc::new(ExpiryCheck))
        .rehydrator(Arc::new(PresentedPrincipal))
        .prefetch_pool(PrefetchPool::new(config.prefetch_concurrency))
        .build();
    let sweeper = manager.spawn_sweeper();

    let state = Arc::new(AppState {
        manager: manager.clone(),
        metrics,
        handshake_timeout: config.handshake_timeout,
        trust_user_header: config.trust_user_header,
    });

    let router = Router::new()
        .route("/_swell/ws", get(ws_handler))
        .route("/_swell/healthz", get(health_handler))
        .route("/_swell/stats", get(stats_handler))
        .route("/_swell/metrics", get(metrics_handler))
        .fallback(page_handler)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("swell listening on {}", config.listen_addr);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server shutdown with error")?;

    info!("shutdown signal received; closing sessions");
    sweeper.abort();
    manager.shutdown().await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let principal = state.principal(&headers);
    ws.on_upgrade(move |socket| async move {
        let conn = Arc::new(ws::WsConnection::new(socket, peer));
        match perform_handshake(&state.manager, conn, principal, state.handshake_timeout).await {
            Ok(session) => info!(session_id = %session.id(), %peer, "websocket attached"),
            Err(err) => warn!(%peer, error = %err, "websocket handshake failed"),
        }
    })
}

async fn page_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let path = uri.path();
    if is_internal_path(path) {
        return StatusCode::NOT_FOUND.into_response();
    }
    if let Some(location) = canonical_redirect(&uri) {
        counter!("swell_http_redirects_total", 1);
        return Redirect::permanent(&location).into_response();
    }
    match state.manager.render_page(path, state.principal(&headers)) {
        Ok((session, body)) => Html(pages::document(session.id(), &body)).into_response(),
        Err(ManagerError::RouteNotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(ManagerError::TooManySessions(_)) => {
            (StatusCode::SERVICE_UNAVAILABLE, "server busy").into_response()
        }
        Err(err) => {
            warn!(path, error = %err, "page render failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Location to redirect to when `uri` is not in canonical form; the query
/// string is kept.
fn canonical_redirect(uri: &Uri) -> Option<String> {
    let canonical = canonical_path(uri.path());
    if canonical == uri.path() {
        return None;
    }
    Some(match uri.query() {
        Some(query) => format!("{canonical}?{query}"),
        None => canonical,
    })
}
