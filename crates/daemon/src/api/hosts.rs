//! Host endpoints

use super::{ws, ApiResult, AppState};
use crate::auth::Caller;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wgmesh_common::{
    peers::host_peer_update, Host, HostAction, HostPeerUpdate, HostUpdate, Node, RegisterResponse,
    ServerConfig, VERSION,
};

/// Admin-editable host fields
#[derive(Debug, Default, Deserialize)]
struct HostPatch {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    listen_port: Option<u16>,
    #[serde(default)]
    mtu: Option<u16>,
    #[serde(default)]
    persistent_keepalive: Option<u16>,
    #[serde(default)]
    is_default: Option<bool>,
}

#[derive(Deserialize)]
struct HostLogin {
    password: String,
}

#[derive(Serialize)]
struct Token {
    token: String,
}

/// Everything a host needs to converge in one response
#[derive(Serialize)]
struct Pull {
    host: Host,
    nodes: Vec<Node>,
    peers: HostPeerUpdate,
    server_config: ServerConfig,
    actions: Vec<HostUpdate>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/hosts", get(list_hosts))
        .route(
            "/api/hosts/:id",
            get(get_host).put(update_host).delete(delete_host),
        )
        .route("/api/hosts/:id/pull", get(pull))
        .route("/api/hosts/:id/authenticate", post(authenticate))
        .route(
            "/api/hosts/:id/networks/:network",
            post(join_network).delete(leave_network),
        )
        .route("/api/hosts/adm/register", get(ws::register))
        .route("/api/v1/host/register/:token", post(register_with_key))
        .route("/api/v1/update", get(ws::updates))
        .route("/api/v1/host/:id/actions", delete(drain_actions))
}

async fn list_hosts(caller: Caller, State(app): State<AppState>) -> ApiResult<Json<Vec<Host>>> {
    caller.require_admin()?;
    let hosts = app.state.list_hosts()?;
    Ok(Json(hosts.iter().map(Host::redacted).collect()))
}

async fn get_host(
    caller: Caller,
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Host>> {
    caller.require_host(id)?;
    Ok(Json(app.state.get_host(id)?.redacted()))
}

async fn update_host(
    caller: Caller,
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<HostPatch>,
) -> ApiResult<Json<Host>> {
    caller.require_admin()?;
    let host = app.state.update_host(id, |host| {
        if let Some(name) = patch.name {
            host.name = name;
        }
        if let Some(port) = patch.listen_port {
            host.listen_port = port;
        }
        host.mtu = patch.mtu.or(host.mtu);
        host.persistent_keepalive = patch.persistent_keepalive.or(host.persistent_keepalive);
        if let Some(is_default) = patch.is_default {
            host.is_default = is_default;
        }
        Ok(())
    })?;

    app.publisher
        .host_update(id, HostUpdate::new(HostAction::UpdateHost).with_host(host.clone()));
    for node in app.state.nodes_of_host(id)? {
        app.publisher.peer_update(&node.network);
    }
    Ok(Json(host.redacted()))
}

async fn delete_host(
    caller: Caller,
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Host>> {
    caller.require_admin()?;
    let host = app.hosts.remove_host(id).await?;
    Ok(Json(host.redacted()))
}

async fn join_network(
    caller: Caller,
    State(app): State<AppState>,
    Path((id, network)): Path<(Uuid, String)>,
) -> ApiResult<Json<Node>> {
    caller.require_admin()?;
    app.state.get_host(id)?;
    Ok(Json(app.hosts.join_network(id, &network)?))
}

async fn leave_network(
    caller: Caller,
    State(app): State<AppState>,
    Path((id, network)): Path<(Uuid, String)>,
) -> ApiResult<Json<Node>> {
    caller.require_admin()?;
    Ok(Json(app.hosts.leave_network(id, &network)?))
}

async fn pull(
    caller: Caller,
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Pull>> {
    caller.require_host(id)?;
    let host = app.state.get_host(id)?;
    let snapshot = app.state.snapshot()?;
    let peers = host_peer_update(&snapshot, id, &app.state.config().server_name, VERSION);
    Ok(Json(Pull {
        host: host.redacted(),
        nodes: app.state.nodes_of_host(id)?,
        peers,
        server_config: app.state.server_config(),
        actions: app.actions.drain(id),
    }))
}

async fn drain_actions(
    caller: Caller,
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<HostUpdate>>> {
    caller.require_host(id)?;
    Ok(Json(app.actions.drain(id)))
}

async fn authenticate(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
    Json(login): Json<HostLogin>,
) -> ApiResult<Json<Token>> {
    let token = app.enrollment.host_token(id, &login.password)?;
    Ok(Json(Token { token }))
}

async fn register_with_key(
    State(app): State<AppState>,
    Path(token): Path<String>,
    Json(host): Json<Host>,
) -> ApiResult<(StatusCode, Json<RegisterResponse>)> {
    let response = app.enrollment.register_with_key(&token, host).await?;
    Ok((StatusCode::CREATED, Json(response)))
}
