//! Admin API: login and node management under `/api`

use super::router::AppState;
use crate::auth::constant_time_eq;
use crate::common::error::RegistryError;
use crate::common::types::{
    AddNodeRequest, ErrorResponse, ListNodesResponse, LoginRequest, LoginResponse,
    SubscriptionPathResponse,
};
use crate::registry::NodeRecord;
use axum::{
    Router,
    extract::{FromRequestParts, Path, State},
    http::{StatusCode, header::AUTHORIZATION, request::Parts},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// How long an issued admin token stays valid
pub const ADMIN_TOKEN_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Most tokens kept at once; the oldest is evicted beyond this
pub const MAX_ADMIN_TOKENS: usize = 64;

/// Tokens handed out by `POST /api/login`, keyed to their issue time
#[derive(Debug)]
pub struct AdminSessions {
    tokens: RwLock<HashMap<String, Instant>>,
    ttl: Duration,
    capacity: usize,
}

impl Default for AdminSessions {
    fn default() -> Self {
        Self::with_limits(ADMIN_TOKEN_TTL, MAX_ADMIN_TOKENS)
    }
}

impl AdminSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(ttl: Duration, capacity: usize) -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Issue a fresh token, dropping expired ones and the oldest past capacity
    pub async fn issue(&self) -> String {
        let token = Uuid::new_v4().to_string();
        let now = Instant::now();
        let mut tokens = self.tokens.write().await;

        tokens.retain(|_, issued| now.duration_since(*issued) < self.ttl);
        while tokens.len() >= self.capacity {
            let Some(oldest) = tokens
                .iter()
                .min_by_key(|(_, issued)| **issued)
                .map(|(token, _)| token.clone())
            else {
                break;
            };
            tokens.remove(&oldest);
            debug!("Evicted oldest admin token");
        }

        tokens.insert(token.clone(), now);
        token
    }

    pub async fn is_valid(&self, token: &str) -> bool {
        self.tokens
            .read()
            .await
            .get(token)
            .is_some_and(|issued| issued.elapsed() < self.ttl)
    }

    pub async fn count(&self) -> usize {
        self.tokens.read().await.len()
    }
}

/// Extractor for requests carrying an issued token in `Authorization`
///
/// Both a bare token and `Bearer <token>` are accepted.
#[derive(Debug)]
pub struct AdminToken;

impl FromRequestParts<AppState> for AdminToken {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Response> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.strip_prefix("Bearer ").unwrap_or(value).trim())
            .unwrap_or_default();

        if !token.is_empty() && state.sessions.is_valid(token).await {
            return Ok(Self);
        }
        debug!("Rejected admin request without a valid token");
        Err((
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse::new("UNAUTHORIZED", "Unauthorized")),
        )
            .into_response())
    }
}

/// Create the router for the admin API
pub fn create_admin_router() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/nodes", get(list_nodes).post(add_node))
        .route("/nodes/{uuid}", delete(remove_node))
        .route("/sub", get(subscription_path))
}

fn registry_error_response(e: &RegistryError) -> Response {
    let (status, code) = match e {
        RegistryError::Duplicate(_) => (StatusCode::CONFLICT, "NODE_EXISTS"),
        RegistryError::NotFound(_) => (StatusCode::NOT_FOUND, "NODE_NOT_FOUND"),
        RegistryError::Unavailable(_) | RegistryError::Serialization(_) => {
            error!("Node registry failure: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "REGISTRY_UNAVAILABLE")
        }
    };
    (status, Json(ErrorResponse::new(code, e.to_string()))).into_response()
}

/// Exchange the admin password for a session token
#[instrument(name = "admin_login", skip_all)]
async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> Response {
    let Some(password) = state.admin.password.as_deref() else {
        warn!("Login attempted but no admin password is configured");
        return (
            StatusCode::FORBIDDEN,
            Json(ErrorResponse::new("ADMIN_DISABLED", "Admin login is disabled")),
        )
            .into_response();
    };

    if !constant_time_eq(password.as_bytes(), req.pwd.as_bytes()) {
        warn!("Admin login failed");
        return (
            StatusCode::FORBIDDEN,
            Json(ErrorResponse::new("INVALID_PASSWORD", "Invalid password")),
        )
            .into_response();
    }

    let token = state.sessions.issue().await;
    info!("Admin session issued");
    Json(LoginResponse { token }).into_response()
}

#[instrument(name = "list_nodes", skip_all)]
async fn list_nodes(_: AdminToken, State(state): State<AppState>) -> Response {
    match state.store.list().await {
        Ok(nodes) => {
            let total = nodes.len();
            Json(ListNodesResponse { nodes, total }).into_response()
        }
        Err(e) => registry_error_response(&e),
    }
}

/// Register a node; a random uuid is generated when none is given
#[instrument(name = "add_node", skip_all, fields(name = %req.name))]
async fn add_node(
    _: AdminToken,
    State(state): State<AppState>,
    Json(req): Json<AddNodeRequest>,
) -> Response {
    let identifier = req
        .uuid
        .map(|uuid| uuid.trim().to_string())
        .filter(|uuid| !uuid.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let record = NodeRecord::new(identifier, req.name);

    match state.store.add(record.clone()).await {
        Ok(()) => {
            info!(node = %record.display_name, "Node added");
            (StatusCode::CREATED, Json(record)).into_response()
        }
        Err(e) => registry_error_response(&e),
    }
}

#[instrument(name = "remove_node", skip_all)]
async fn remove_node(
    _: AdminToken,
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Response {
    match state.store.remove(&uuid).await {
        Ok(record) => {
            info!(node = %record.display_name, "Node removed");
            Json(record).into_response()
        }
        Err(e) => registry_error_response(&e),
    }
}

/// Relative subscription URL including the key
async fn subscription_path(_: AdminToken, State(state): State<AppState>) -> Response {
    match state.admin.subscription_key.as_deref() {
        Some(key) => Json(SubscriptionPathResponse {
            path: format!("/sub?key={key}"),
        })
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "SUBSCRIPTION_DISABLED",
                "No subscription key is configured",
            )),
        )
            .into_response(),
    }
}
