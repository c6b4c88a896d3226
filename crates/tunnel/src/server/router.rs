//! HTTP routes: tunnel endpoints, landing page and subscription

use super::admin::{AdminSessions, create_admin_router};
use super::config::{AdminConfig, EdgeTunnelConfig};
use super::ws::WsStream;
use crate::common::error::TunnelError;
use crate::common::types::ErrorResponse;
use crate::protocol::ProtocolKind;
use crate::registry::NodeStore;
use crate::relay::{SessionRequest, TunnelRelay};
use axum::{
    Router,
    extract::{
        ConnectInfo, Query, State,
        rejection::ExtensionRejection,
        ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, instrument, warn};

/// Shared state of every route
#[derive(Clone)]
pub struct AppState {
    pub relay: TunnelRelay,
    /// Same store the relay authenticates against
    pub store: Arc<dyn NodeStore>,
    pub admin: Arc<AdminConfig>,
    pub default_credential: Option<String>,
    pub sessions: Arc<AdminSessions>,
    /// One permit per live tunnel
    pub tunnel_slots: Arc<Semaphore>,
}

impl AppState {
    pub fn new(relay: TunnelRelay, store: Arc<dyn NodeStore>, config: &EdgeTunnelConfig) -> Self {
        Self {
            relay,
            store,
            admin: Arc::new(config.admin.clone()),
            default_credential: config.tunnel.default_credential.clone(),
            sessions: Arc::new(AdminSessions::new()),
            tunnel_slots: Arc::new(Semaphore::new(config.tunnel.max_sessions)),
        }
    }
}

/// Create the full application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(landing))
        .route("/vless", get(vless_tunnel))
        .route("/trojan", get(trojan_tunnel))
        .route("/sub", get(subscription))
        .nest("/api", create_admin_router())
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Credential override accepted on the tunnel endpoints for manual testing
#[derive(Debug, Default, Deserialize)]
struct TunnelQuery {
    uuid: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SubscriptionQuery {
    key: Option<String>,
}

type PeerInfo = Result<ConnectInfo<SocketAddr>, ExtensionRejection>;
type Upgrade = Result<WebSocketUpgrade, WebSocketUpgradeRejection>;

async fn vless_tunnel(
    State(state): State<AppState>,
    peer: PeerInfo,
    Query(query): Query<TunnelQuery>,
    headers: HeaderMap,
    upgrade: Upgrade,
) -> Response {
    let request = SessionRequest::new(ProtocolKind::Vless).with_credential_override(query.uuid);
    open_tunnel(state, peer, &headers, upgrade, request)
}

async fn trojan_tunnel(
    State(state): State<AppState>,
    peer: PeerInfo,
    Query(query): Query<TunnelQuery>,
    headers: HeaderMap,
    upgrade: Upgrade,
) -> Response {
    let request =
        SessionRequest::new(ProtocolKind::Trojan).with_credential_override(query.password);
    open_tunnel(state, peer, &headers, upgrade, request)
}

fn wants_websocket(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

fn preflight_response(e: &TunnelError) -> Response {
    let (status, code, message) = match e {
        TunnelError::UpgradeRequired => (
            StatusCode::UPGRADE_REQUIRED,
            "UPGRADE_REQUIRED",
            "Upgrade required",
        ),
        TunnelError::NoBackend => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "NO_BACKEND",
            "No backend",
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "TUNNEL_ERROR",
            "Tunnel unavailable",
        ),
    };
    (status, Json(ErrorResponse::new(code, message))).into_response()
}

fn open_tunnel(
    state: AppState,
    peer: PeerInfo,
    headers: &HeaderMap,
    upgrade: Upgrade,
    mut request: SessionRequest,
) -> Response {
    if let Err(e) = state.relay.preflight(wants_websocket(headers)) {
        debug!(protocol = %request.protocol, "Tunnel request refused: {}", e);
        return preflight_response(&e);
    }

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            debug!("WebSocket handshake rejected: {}", rejection);
            return rejection.into_response();
        }
    };

    let Ok(permit) = Arc::clone(&state.tunnel_slots).try_acquire_owned() else {
        warn!("Session limit reached, refusing tunnel");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new("TOO_MANY_SESSIONS", "Too many sessions")),
        )
            .into_response();
    };

    if let Ok(ConnectInfo(addr)) = peer {
        request = request.with_peer(addr);
    }

    let relay = state.relay;
    upgrade.on_upgrade(move |socket| async move {
        let _permit = permit;
        // Outcome is logged by the relay
        if let Ok(summary) = relay.serve(WsStream::new(socket), request).await {
            debug!(session = %summary.id, state = %summary.state, "Tunnel finished");
        }
    })
}

/// Redirect to the configured cover site, or a short landing text
async fn landing(State(state): State<AppState>) -> Response {
    match state.admin.fake_url.as_deref() {
        Some(url) => (StatusCode::FOUND, [(header::LOCATION, url.to_string())]).into_response(),
        None => (StatusCode::OK, "EdgeTunnel is running").into_response(),
    }
}

/// VLESS share link for the default node
#[instrument(name = "subscription", skip_all)]
async fn subscription(
    State(state): State<AppState>,
    Query(query): Query<SubscriptionQuery>,
    headers: HeaderMap,
) -> Response {
    let authorized = matches!(
        (state.admin.subscription_key.as_deref(), query.key.as_deref()),
        (Some(expected), Some(given)) if !expected.is_empty() && expected == given
    );
    if !authorized {
        debug!("Subscription requested with an invalid key");
        return (
            StatusCode::FORBIDDEN,
            Json(ErrorResponse::new("INVALID_KEY", "Invalid key")),
        )
            .into_response();
    }

    let Some(host) = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("MISSING_HOST", "Missing Host header")),
        )
            .into_response();
    };

    let uuid = match &state.default_credential {
        Some(credential) => credential.clone(),
        None => match state.store.list().await {
            Ok(records) => match records.into_iter().next() {
                Some(record) => record.identifier,
                None => {
                    return (
                        StatusCode::NOT_FOUND,
                        Json(ErrorResponse::new("NO_NODES", "No nodes registered")),
                    )
                        .into_response();
                }
            },
            Err(e) => {
                error!("Node registry unavailable for subscription: {}", e);
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(ErrorResponse::new("REGISTRY_UNAVAILABLE", e.to_string())),
                )
                    .into_response();
            }
        },
    };

    subscription_link(&uuid, host).into_response()
}

pub fn subscription_link(uuid: &str, host: &str) -> String {
    format!("vless://{uuid}@{host}/vless?encryption=none&security=none&type=ws#EdgeTunnel")
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new("NOT_FOUND", "Not Found")),
    )
        .into_response()
}
