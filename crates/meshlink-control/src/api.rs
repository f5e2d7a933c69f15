//! Management HTTP API
//!
//! REST API for administrators (bearer token) and for agents (setup key on
//! login, then the peer's public key on every call).

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ipnet::IpNet;
use meshlink_crypto::PublicKey;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::error::ControlError;
use crate::model::*;
use crate::model::Router as GatewayRouter;
use crate::registry::{AccountUpdate, LoginRequest, PeerRegistry};
use crate::routes::network_map;
use crate::store::TopologyStore;
use crate::sync::RouteSynchronizer;

/// Header carrying the agent's public key
pub const PEER_KEY_HEADER: &str = "x-peer-key";

/// Shared application state
pub struct ApiState {
    pub store: TopologyStore,
    pub registry: PeerRegistry,
    pub sync: Arc<RouteSynchronizer>,
    pub admin_token: String,
    pub long_poll_timeout: Duration,
    /// Last status report per peer
    pub statuses: DashMap<PeerId, AgentStatusRecord>,
}

/// Build the API router
pub fn router(state: Arc<ApiState>) -> Router {
    let admin = Router::new()
        .route("/api/accounts", get(list_accounts))
        .route("/api/accounts/:id", put(update_account))
        .route("/api/setup-keys", get(list_setup_keys).post(create_setup_key))
        .route("/api/peers", get(list_peers))
        .route("/api/peers/:id", get(get_peer).put(update_peer).delete(delete_peer))
        .route("/api/groups", get(list_groups).post(create_group))
        .route("/api/groups/:id", put(update_group))
        .route("/api/networks", get(list_networks).post(create_network))
        .route("/api/networks/:id/resources", post(create_resource))
        .route(
            "/api/networks/:id/resources/:rid",
            put(update_resource).delete(delete_resource),
        )
        .route("/api/networks/:id/routers", post(create_router))
        .route(
            "/api/networks/:id/routers/:rid",
            put(update_router).delete(delete_router),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    let agent = Router::new()
        .route("/api/agent/login", post(agent_login))
        .route("/api/agent/:peer_id/sync", get(agent_sync))
        .route("/api/agent/:peer_id/status", post(agent_status));

    admin
        .merge(agent)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `listener` until the future is dropped
pub async fn serve(listener: tokio::net::TcpListener, state: Arc<ApiState>) -> std::io::Result<()> {
    info!("Management API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await
}

// ============ Request/Response Types ============

#[derive(Debug, Deserialize, Serialize)]
pub struct AccountRequest {
    #[serde(default)]
    pub settings: AccountUpdate,
    #[serde(default)]
    pub onboarding: Option<Onboarding>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountResponse {
    pub account: Account,
    /// Peers whose overlay address changed
    pub reassigned: Vec<Reassigned>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Reassigned {
    pub peer_id: PeerId,
    pub ip: IpAddr,
}

/// A setup key and whether it can still enroll peers
#[derive(Debug, Serialize, Deserialize)]
pub struct SetupKeyView {
    #[serde(flatten)]
    pub key: SetupKey,
    pub valid: bool,
}

impl From<SetupKey> for SetupKeyView {
    fn from(key: SetupKey) -> Self {
        let valid = key.rejection(Utc::now()).is_none();
        Self { key, valid }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NetworkView {
    #[serde(flatten)]
    pub network: Network,
    pub routers: Vec<GatewayRouter>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub peer: PeerView,
    pub network_map: NetworkMap,
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncQuery {
    #[serde(default)]
    pub serial: u64,
}

/// What an agent reports about itself
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStatusReport {
    /// Agent is up (false on `down`)
    pub up: bool,
    /// Peers with an established session
    pub connected_peers: Vec<PeerId>,
    /// Peers the agent wants sessions with
    pub total_peers: usize,
    /// Routes applied locally
    pub networks: Vec<IpNet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusRecord {
    pub report: AgentStatusReport,
    pub received_at: DateTime<Utc>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// API failure
#[derive(Debug)]
pub enum ApiError {
    Control(ControlError),
    Unauthorized(&'static str),
}

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        ApiError::Control(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, error) = match self {
            ApiError::Unauthorized(why) => (StatusCode::UNAUTHORIZED, "unauthorized", why.to_string()),
            ApiError::Control(e) => {
                let (status, code) = match &e {
                    ControlError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
                    ControlError::DuplicateIdentity { .. } => (StatusCode::CONFLICT, "duplicate_identity"),
                    ControlError::AddressConflict { .. } => (StatusCode::CONFLICT, "address_conflict"),
                    ControlError::PoolExhausted(_) => (StatusCode::CONFLICT, "pool_exhausted"),
                    ControlError::AddressOutOfRange { .. } => (StatusCode::BAD_REQUEST, "address_out_of_range"),
                    ControlError::InvalidSetupKey => (StatusCode::UNAUTHORIZED, "invalid_setup_key"),
                    ControlError::SetupKeyRejected { .. } => (StatusCode::UNAUTHORIZED, "setup_key_rejected"),
                    ControlError::Invalid(_) => (StatusCode::BAD_REQUEST, "invalid"),
                    ControlError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config"),
                };
                (status, code, e.to_string())
            }
        };
        (status, Json(ErrorResponse { error, code: code.to_string() })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============ Auth ============

async fn require_admin(State(state): State<Arc<ApiState>>, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let authorized = matches!(
        presented,
        Some(token) if !state.admin_token.is_empty() && token == state.admin_token
    );

    if authorized {
        next.run(request).await
    } else {
        ApiError::Unauthorized("missing or invalid bearer token").into_response()
    }
}

async fn check_peer_key(state: &ApiState, peer_id: &str, headers: &HeaderMap) -> ApiResult<()> {
    let key: PublicKey = headers
        .get(PEER_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or(ApiError::Unauthorized("missing peer key"))?;

    let topology = state.store.snapshot().await;
    if topology.peer(peer_id)?.public_key != key {
        return Err(ApiError::Unauthorized("peer key mismatch"));
    }
    Ok(())
}

// ============ Admin handlers ============

async fn list_accounts(State(state): State<Arc<ApiState>>) -> Json<Vec<Account>> {
    Json(vec![state.registry.account().await])
}

async fn update_account(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<AccountRequest>,
) -> ApiResult<Json<AccountResponse>> {
    let (account, moved) = state
        .registry
        .update_account(&id, req.settings, req.onboarding)
        .await?;
    Ok(Json(AccountResponse {
        account,
        reassigned: moved.into_iter().map(|(peer_id, ip)| Reassigned { peer_id, ip }).collect(),
    }))
}

async fn list_setup_keys(State(state): State<Arc<ApiState>>) -> Json<Vec<SetupKeyView>> {
    Json(state.registry.setup_keys().await.into_iter().map(SetupKeyView::from).collect())
}

async fn create_setup_key(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<NewSetupKey>,
) -> ApiResult<(StatusCode, Json<SetupKeyView>)> {
    let key = state.registry.create_setup_key(req).await?;
    Ok((StatusCode::CREATED, Json(key.into())))
}

async fn list_peers(State(state): State<Arc<ApiState>>, Query(filter): Query<PeerFilter>) -> Json<Vec<PeerView>> {
    Json(state.registry.list(&filter).await)
}

async fn get_peer(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> ApiResult<Json<PeerView>> {
    Ok(Json(state.registry.lookup(&id).await?))
}

async fn update_peer(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<PeerUpdate>,
) -> ApiResult<Json<PeerView>> {
    Ok(Json(state.registry.update(&id, req).await?))
}

async fn delete_peer(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.registry.deregister(&id).await?;
    state.statuses.remove(&id);
    Ok(StatusCode::NO_CONTENT)
}

async fn list_groups(State(state): State<Arc<ApiState>>) -> Json<Vec<Group>> {
    Json(state.store.snapshot().await.groups.values().cloned().collect())
}

async fn create_group(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<NewGroup>,
) -> ApiResult<(StatusCode, Json<Group>)> {
    let group = state.store.mutate(|t| t.create_group(req)).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn update_group(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<GroupUpdate>,
) -> ApiResult<Json<Group>> {
    Ok(Json(state.store.mutate(|t| t.update_group(&id, req)).await?))
}

async fn list_networks(State(state): State<Arc<ApiState>>) -> Json<Vec<NetworkView>> {
    let topology = state.store.snapshot().await;
    let views = topology
        .networks
        .values()
        .map(|n| NetworkView {
            network: n.clone(),
            routers: topology.network_routers(&n.id).cloned().collect(),
        })
        .collect();
    Json(views)
}

async fn create_network(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<NewNetwork>,
) -> ApiResult<(StatusCode, Json<Network>)> {
    let network = state.store.mutate(|t| t.create_network(req)).await?;
    Ok((StatusCode::CREATED, Json(network)))
}

async fn create_resource(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<NewResource>,
) -> ApiResult<(StatusCode, Json<Resource>)> {
    let resource = state.store.mutate(|t| t.add_resource(&id, req)).await?;
    Ok((StatusCode::CREATED, Json(resource)))
}

async fn update_resource(
    State(state): State<Arc<ApiState>>,
    Path((id, rid)): Path<(String, String)>,
    Json(req): Json<ResourceUpdate>,
) -> ApiResult<Json<Resource>> {
    Ok(Json(state.store.mutate(|t| t.update_resource(&id, &rid, req)).await?))
}

async fn delete_resource(
    State(state): State<Arc<ApiState>>,
    Path((id, rid)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.store.mutate(|t| t.remove_resource(&id, &rid)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_router(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<NewRouter>,
) -> ApiResult<(StatusCode, Json<GatewayRouter>)> {
    let router = state.store.mutate(|t| t.add_router(&id, req)).await?;
    Ok((StatusCode::CREATED, Json(router)))
}

async fn update_router(
    State(state): State<Arc<ApiState>>,
    Path((id, rid)): Path<(String, String)>,
    Json(req): Json<RouterUpdate>,
) -> ApiResult<Json<GatewayRouter>> {
    Ok(Json(state.store.mutate(|t| t.update_router(&id, &rid, req)).await?))
}

async fn delete_router(
    State(state): State<Arc<ApiState>>,
    Path((id, rid)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.store.mutate(|t| t.remove_router(&id, &rid)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Agent handlers ============

async fn agent_login(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let peer = state.registry.login(req).await?;
    let topology = state.store.snapshot().await;
    let map = network_map(&topology, &peer.peer.id, state.sync.policy())?;
    info!("Agent {} logged in as {}", peer.peer.hostname, peer.peer.id);
    Ok(Json(LoginResponse { peer, network_map: map }))
}

async fn agent_sync(
    State(state): State<Arc<ApiState>>,
    Path(peer_id): Path<String>,
    Query(query): Query<SyncQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    check_peer_key(&state, &peer_id, &headers).await?;

    match state
        .sync
        .wait_for_newer(&peer_id, query.serial, state.long_poll_timeout)
        .await
    {
        Some(map) => Ok(Json(map.as_ref().clone()).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn agent_status(
    State(state): State<Arc<ApiState>>,
    Path(peer_id): Path<String>,
    headers: HeaderMap,
    Json(report): Json<AgentStatusReport>,
) -> ApiResult<StatusCode> {
    check_peer_key(&state, &peer_id, &headers).await?;

    debug!(
        "Status from {}: up={} {}/{} connected",
        peer_id,
        report.up,
        report.connected_peers.len(),
        report.total_peers
    );
    state.registry.mark_connected(&peer_id, report.up).await?;
    state.statuses.insert(
        peer_id,
        AgentStatusRecord {
            report,
            received_at: Utc::now(),
        },
    );
    Ok(StatusCode::NO_CONTENT)
}
