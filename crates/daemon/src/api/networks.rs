//! Networks, ACLs and enrollment keys

use super::{ApiResult, AppState};
use crate::auth::Caller;
use crate::enrollment_keys::KeyRequest;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;
use wgmesh_common::{AclPolicy, EnrollmentKey, Network, NetworkAcl};

#[derive(Debug, Default, Deserialize)]
struct NetworkPatch {
    #[serde(default)]
    default_keepalive: Option<u16>,
    #[serde(default)]
    default_dns: Option<String>,
    #[serde(default)]
    default_acl: Option<AclPolicy>,
    #[serde(default)]
    node_limit: Option<u32>,
}

/// Per-network key request; the network comes from the path
#[derive(Debug, Default, Deserialize)]
struct NetworkKeyRequest {
    #[serde(default)]
    uses_remaining: u32,
    #[serde(default)]
    expiration: Option<i64>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Deserialize)]
struct AclQuery {
    network: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/networks", get(list_networks).post(create_network))
        .route(
            "/api/networks/:id",
            get(get_network).put(update_network).delete(delete_network),
        )
        .route("/api/networks/:id/keys", get(list_network_keys).post(create_network_key))
        .route("/api/networks/:id/keys/:key_id", delete(delete_network_key))
        .route("/api/v1/acls", get(get_acl).put(put_acl))
        .route("/api/v1/enrollment-keys", get(list_keys).post(create_key))
        .route("/api/v1/enrollment-keys/:key_id", delete(delete_key))
}

async fn list_networks(
    caller: Caller,
    State(app): State<AppState>,
) -> ApiResult<Json<Vec<Network>>> {
    let networks = app.state.list_networks()?;
    Ok(Json(
        networks
            .into_iter()
            .filter(|n| caller.require_network(&n.id).is_ok())
            .collect(),
    ))
}

async fn create_network(
    caller: Caller,
    State(app): State<AppState>,
    Json(network): Json<Network>,
) -> ApiResult<(StatusCode, Json<Network>)> {
    caller.require_admin()?;
    let network = app.state.create_network(network)?;
    Ok((StatusCode::CREATED, Json(network)))
}

async fn get_network(
    caller: Caller,
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Network>> {
    caller.require_network(&id)?;
    Ok(Json(app.state.get_network(&id)?))
}

async fn update_network(
    caller: Caller,
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<NetworkPatch>,
) -> ApiResult<Json<Network>> {
    caller.require_admin()?;
    let network = app.state.update_network(&id, |network| {
        if let Some(keepalive) = patch.default_keepalive {
            network.default_keepalive = keepalive;
        }
        if patch.default_dns.is_some() {
            network.default_dns = patch.default_dns.filter(|d| !d.is_empty());
        }
        if let Some(policy) = patch.default_acl {
            network.default_acl = policy;
        }
        if let Some(limit) = patch.node_limit {
            network.node_limit = limit;
        }
        Ok(())
    })?;
    app.publisher.peer_update(&id);
    Ok(Json(network))
}

async fn delete_network(
    caller: Caller,
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    caller.require_admin()?;
    app.state.delete_network(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_network_keys(
    caller: Caller,
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<EnrollmentKey>>> {
    caller.require_admin()?;
    app.state.get_network(&id)?;
    let keys = app.keys.list(app.state.config().features.display_keys)?;
    Ok(Json(keys.into_iter().filter(|k| k.covers(&id)).collect()))
}

async fn create_network_key(
    caller: Caller,
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<NetworkKeyRequest>,
) -> ApiResult<(StatusCode, Json<EnrollmentKey>)> {
    caller.require_admin()?;
    let req = KeyRequest {
        networks: vec![id],
        uses_remaining: req.uses_remaining,
        expiration: req.expiration,
        tags: req.tags,
    };
    let key = app.keys.create(req, &app.state.config().api.base_url())?;
    Ok((StatusCode::CREATED, Json(key)))
}

async fn delete_network_key(
    caller: Caller,
    State(app): State<AppState>,
    Path((_id, key_id)): Path<(String, Uuid)>,
) -> ApiResult<StatusCode> {
    caller.require_admin()?;
    app.keys.delete(key_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_acl(
    caller: Caller,
    State(app): State<AppState>,
    Query(query): Query<AclQuery>,
) -> ApiResult<Json<NetworkAcl>> {
    caller.require_network(&query.network)?;
    Ok(Json(app.state.get_acl(&query.network)?))
}

async fn put_acl(
    caller: Caller,
    State(app): State<AppState>,
    Json(acl): Json<NetworkAcl>,
) -> ApiResult<Json<NetworkAcl>> {
    caller.require_admin()?;
    app.state.put_acl(&acl)?;
    app.publisher.peer_update(&acl.network);
    Ok(Json(acl))
}

async fn list_keys(
    caller: Caller,
    State(app): State<AppState>,
) -> ApiResult<Json<Vec<EnrollmentKey>>> {
    caller.require_admin()?;
    Ok(Json(app.keys.list(app.state.config().features.display_keys)?))
}

async fn create_key(
    caller: Caller,
    State(app): State<AppState>,
    Json(req): Json<KeyRequest>,
) -> ApiResult<(StatusCode, Json<EnrollmentKey>)> {
    caller.require_admin()?;
    let key = app.keys.create(req, &app.state.config().api.base_url())?;
    Ok((StatusCode::CREATED, Json(key)))
}

async fn delete_key(
    caller: Caller,
    State(app): State<AppState>,
    Path(key_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    caller.require_admin()?;
    app.keys.delete(key_id)?;
    Ok(StatusCode::NO_CONTENT)
}
