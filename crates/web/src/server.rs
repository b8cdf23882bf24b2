//! Web server implementation

use crate::activity::{actions, ActivityLog, DEFAULT_ENDPOINT_LIMIT, DEFAULT_RECENT_LIMIT};
use crate::config::ServerConfig;
use crate::installer;
use crate::registry::ConnectionRegistry;
use crate::sessions::LiveSessions;
use crate::vnc_proxy::SessionProxy;
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};
use vncdesk_common::{
    now_epoch_secs, Database, EndpointStatus, Error, MachineRegistration, NewEndpoint,
};

/// Web server handle
#[derive(Clone)]
pub struct WebServer {
    state: Arc<AppState>,
}

pub struct AppState {
    registry: ConnectionRegistry,
    activity: ActivityLog,
    proxy: SessionProxy,
    config: ServerConfig,
}

impl WebServer {
    /// Create a new web server over an opened state DB
    pub fn new(config: ServerConfig, db: Database) -> Self {
        let registry = ConnectionRegistry::new(db.clone());
        let activity = ActivityLog::new(db);
        let proxy = SessionProxy::new(
            registry.clone(),
            activity.clone(),
            LiveSessions::new(),
            config.proxy(),
        );

        Self {
            state: Arc::new(AppState {
                registry,
                activity,
                proxy,
                config,
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.state.registry
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.state.activity
    }

    pub fn sessions(&self) -> &LiveSessions {
        self.state.proxy.sessions()
    }

    /// Create router
    pub fn router(&self) -> Router {
        let auth_layer = middleware::from_fn_with_state(self.state.clone(), require_api_token);

        // Management routes (bearer token when configured)
        let protected_routes = Router::new()
            .route(
                "/api/connections",
                get(list_connections_handler).post(create_connection_handler),
            )
            .route(
                "/api/connections/:connection_id",
                get(get_connection_handler).delete(delete_connection_handler),
            )
            .route(
                "/api/connections/:connection_id/status",
                put(update_status_handler),
            )
            .route(
                "/api/generate-installer/:connection_id",
                get(generate_installer_handler),
            )
            .route("/api/connect/:connection_id", post(connect_handler))
            .route("/api/logs", get(list_logs_handler))
            .route("/api/logs/:connection_id", get(connection_logs_handler))
            .route("/api/stats", get(stats_handler))
            .route("/api/system/info", get(system_info_handler))
            .route_layer(auth_layer);

        // Public routes: machines hold an installation key, viewers hold a token
        Router::new()
            .route("/api/", get(root_handler))
            .route("/api/health", get(health_handler))
            .route("/api/register-machine", post(register_machine_handler))
            .route("/ws/vnc/:token", get(vnc_websocket_handler))
            .merge(protected_routes)
            .fallback(not_found_handler)
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves, then end every live session
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Web server listening on http://{}", listener.local_addr()?);

        let sessions = self.sessions().clone();
        let app = self.router();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutting down {} live session(s)", sessions.len());
            sessions.shutdown();
        })
        .await?;

        Ok(())
    }
}

/// Wait for `signal` or for the server task to stop on its own, whichever
/// comes first, then cancel the rest and wait for it. A server that died
/// early is reported as the process result.
pub async fn supervise<S>(
    serve: JoinHandle<anyhow::Result<()>>,
    prober: JoinHandle<()>,
    cancel: CancellationToken,
    signal: S,
) -> anyhow::Result<()>
where
    S: Future<Output = ()>,
{
    let mut serve = serve;
    let early = tokio::select! {
        _ = signal => {
            info!("Received shutdown signal");
            None
        }
        result = &mut serve => Some(result),
    };
    cancel.cancel();

    let served = match early {
        Some(result) => {
            error!("Web server stopped unexpectedly");
            result
        }
        None => serve.await,
    };
    if let Err(e) = prober.await {
        error!("Prober task failed: {}", e);
    }

    match served {
        Ok(result) => result,
        Err(e) => Err(anyhow::anyhow!("web server task failed: {}", e)),
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error response with a stable `detail` message
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self.0 {
            Error::NotFound { kind, .. } if kind == "endpoint" => {
                (StatusCode::NOT_FOUND, "Connection not found".to_string())
            }
            Error::NotFound { kind, .. } if kind == "installation key" => {
                (StatusCode::NOT_FOUND, "Invalid installation key".to_string())
            }
            Error::NotFound { .. } => (StatusCode::NOT_FOUND, self.0.to_string()),
            Error::KeyAlreadyUsed => (StatusCode::BAD_REQUEST, self.0.to_string()),
            Error::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Error::InvalidState { reason, .. } => (StatusCode::BAD_REQUEST, reason.clone()),
            Error::Unreachable { .. } => (StatusCode::BAD_GATEWAY, self.0.to_string()),
            _ => {
                error!("Request failed: {}", self.0);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn require_api_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.api_token.as_deref() else {
        return next.run(request).await;
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    if provided == Some(expected) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"detail": "Missing or invalid authorization header"})),
        )
            .into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    status: Option<String>,
}

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "message": "VNC Management System API",
        "version": vncdesk_common::VERSION,
    }))
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now(),
    }))
}

async fn create_connection_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewEndpoint>,
) -> ApiResult<Response> {
    if req.name.trim().is_empty() {
        return Err(Error::InvalidInput("name required".to_string()).into());
    }

    let key = installer::generate_installation_key();
    let port = state.config.vnc.port;
    let secret = state.config.vnc.secret.clone();
    let endpoint = state
        .registry
        .blocking(move |registry| registry.create(req, &key, port, &secret))
        .await?;
    Ok(Json(endpoint).into_response())
}

async fn list_connections_handler(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let endpoints = state.registry.blocking(|registry| registry.list()).await?;
    Ok(Json(endpoints).into_response())
}

async fn get_connection_handler(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
) -> ApiResult<Response> {
    let endpoint = state
        .registry
        .blocking(move |registry| registry.lookup(&connection_id))
        .await?;
    Ok(Json(endpoint).into_response())
}

async fn update_status_handler(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Response> {
    let status: EndpointStatus = query
        .status
        .ok_or_else(|| Error::InvalidInput("status query parameter required".to_string()))?
        .parse()
        .map_err(Error::InvalidInput)?;

    let id = connection_id.clone();
    state
        .registry
        .blocking(move |registry| registry.set_status(&id, status, now_epoch_secs()))
        .await?;
    state
        .activity
        .record(
            &connection_id,
            actions::STATUS_UPDATE,
            &format!("Status changed to {}", status),
            None,
        )
        .await;

    Ok(Json(serde_json::json!({"message": "Status updated successfully"})).into_response())
}

async fn delete_connection_handler(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
) -> ApiResult<Response> {
    let id = connection_id.clone();
    state
        .registry
        .blocking(move |registry| registry.delete(&id))
        .await?;
    state
        .activity
        .record(
            &connection_id,
            actions::CONNECTION_DELETED,
            "Connection removed from system",
            None,
        )
        .await;
    Ok(Json(serde_json::json!({"message": "Connection deleted successfully"})).into_response())
}

async fn generate_installer_handler(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
) -> ApiResult<Response> {
    let id = connection_id.clone();
    let endpoint = state
        .registry
        .blocking(move |registry| registry.lookup(&id))
        .await?;
    let script = installer::powershell_script(
        &endpoint.installation_key,
        &endpoint.secret,
        &state.config.public_url,
    );
    let filename = installer::script_filename(&endpoint.id);

    state
        .activity
        .record(
            &endpoint.id,
            actions::INSTALLER_GENERATED,
            &format!("PowerShell installer generated: {}", filename),
            None,
        )
        .await;

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        script,
    )
        .into_response())
}

async fn register_machine_handler(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Json(registration): Json<MachineRegistration>,
) -> ApiResult<Response> {
    let origin = connect_info.map(|ConnectInfo(addr)| addr.ip().to_string());
    let reg = registration.clone();
    let endpoint = state
        .registry
        .blocking(move |registry| registry.register_machine(&reg))
        .await?;

    state
        .activity
        .record(
            &endpoint.id,
            actions::MACHINE_REGISTERED,
            &format!(
                "Machine {} registered with IP {}",
                registration.machine_name.as_deref().unwrap_or("unknown"),
                endpoint.address.as_deref().unwrap_or("-")
            ),
            origin.as_deref(),
        )
        .await;

    Ok(Json(serde_json::json!({
        "message": "Machine registered successfully",
        "connection_id": endpoint.id,
    }))
    .into_response())
}

async fn connect_handler(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
) -> ApiResult<Response> {
    let id = connection_id.clone();
    let endpoint = state
        .registry
        .blocking(move |registry| registry.lookup(&id))
        .await?;
    let address = match (endpoint.status, endpoint.dial_address()) {
        (EndpointStatus::Active, Some(address)) => address.to_string(),
        _ => {
            return Err(Error::invalid_state(
                "endpoint",
                &connection_id,
                "Connection is not active",
            )
            .into())
        }
    };

    state
        .activity
        .record(
            &endpoint.id,
            actions::VNC_CONNECT,
            &format!("VNC session started to {}", address),
            None,
        )
        .await;

    let ws_base = state.config.public_url.trim_end_matches('/').replacen("http", "ws", 1);
    Ok(Json(serde_json::json!({
        "connection_id": endpoint.id,
        "ip_address": address,
        "port": endpoint.port,
        "password": endpoint.secret,
        "websocket_url": format!("{}/ws/vnc/{}", ws_base, endpoint.id),
    }))
    .into_response())
}

async fn list_logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Response> {
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_LIMIT);
    let entries = state.activity.blocking(move |log| log.recent(limit)).await?;
    Ok(Json(entries).into_response())
}

async fn connection_logs_handler(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Response> {
    let limit = query.limit.unwrap_or(DEFAULT_ENDPOINT_LIMIT);
    let entries = state
        .activity
        .blocking(move |log| log.for_endpoint(&connection_id, limit))
        .await?;
    Ok(Json(entries).into_response())
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let counts = state
        .registry
        .blocking(|registry| registry.count_by_status())
        .await?;
    let since = now_epoch_secs() - 24 * 60 * 60;
    let recent = state.activity.blocking(move |log| log.count_since(since)).await?;

    Ok(Json(serde_json::json!({
        "total_connections": counts.total,
        "active_connections": counts.active,
        "inactive_connections": counts.inactive,
        "installing_connections": counts.installing,
        "error_connections": counts.error,
        "recent_activity_24h": recent,
        "timestamp": Utc::now(),
    }))
    .into_response())
}

async fn system_info_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions = state.proxy.sessions();
    Json(serde_json::json!({
        "vnc_management_version": vncdesk_common::VERSION,
        "total_websocket_connections": sessions.len(),
        "active_websockets": sessions.tokens(),
        "sessions": sessions.snapshot(),
        "system_time": Utc::now(),
        "features": {
            "websocket_proxy": true,
            "liveness_probe": true,
            "installer": true,
        },
    }))
}

/// Session-open entry point. The token is the endpoint id.
async fn vnc_websocket_handler(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = connect_info.map(|ConnectInfo(addr)| addr.ip().to_string());
    let proxy = state.proxy.clone();

    ws.on_upgrade(move |socket| async move {
        let outcome = proxy.bridge(&token, socket, origin.as_deref()).await;
        debug!("VNC WebSocket for {} closed: {:?}", token, outcome.close);
    })
}

async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"detail": "Not found"})),
    )
}
