//! Node and gateway endpoints

use super::{ApiResult, AppState};
use crate::auth::Caller;
use crate::hosts::NodeUpdate;
use crate::topology::{EgressRequest, IngressRequest, InternetGwRequest, RelayRequest};
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wgmesh_common::{peers::compute_peers, Error, ExtClient, Node, PeerSet, Result};

#[derive(Deserialize)]
struct RelayBody {
    relayed: Vec<Uuid>,
}

#[derive(Serialize)]
struct IngressRemoval {
    node: Node,
    deleted_ext_clients: Vec<ExtClient>,
}

#[derive(Serialize)]
struct FailoverReset {
    network: String,
    cleared: usize,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/nodes", get(list_all))
        .route("/api/nodes/:network", get(list_network))
        .route(
            "/api/nodes/:network/:id",
            get(get_node).put(update_node).delete(delete_node),
        )
        .route("/api/nodes/:network/:id/peers", get(peers))
        .route("/api/nodes/:network/:id/gateway", post(create_ingress).delete(delete_ingress))
        .route("/api/nodes/:network/:id/egress", post(create_egress).delete(delete_egress))
        .route("/api/nodes/:network/:id/createrelay", post(create_relay))
        .route("/api/nodes/:network/:id/deleterelay", post(delete_relay))
        .route("/api/nodes/:network/:id/inetgw", post(set_internet_gw).delete(unset_internet_gw))
        .route("/api/v1/node/:id/failover", post(create_failover).delete(delete_failover))
        .route("/api/v1/node/:id/failover/reset", post(reset_failed_over_peer))
        .route("/api/v1/network/:network/failover/elect", post(elect_failover))
        .route("/api/v1/network/:network/failover/resetall", post(reset_failover))
}

/// The node, checked to be a member of `network`
fn node_in(app: &AppState, network: &str, id: Uuid) -> Result<Node> {
    let node = app.state.get_node(id)?;
    if node.network != network {
        return Err(Error::not_found("node", format!("{}.{}", network, id)));
    }
    Ok(node)
}

async fn list_all(caller: Caller, State(app): State<AppState>) -> ApiResult<Json<Vec<Node>>> {
    caller.require_admin()?;
    Ok(Json(app.state.list_nodes()?))
}

async fn list_network(
    caller: Caller,
    State(app): State<AppState>,
    Path(network): Path<String>,
) -> ApiResult<Json<Vec<Node>>> {
    caller.require_network(&network)?;
    app.state.get_network(&network)?;
    Ok(Json(app.state.nodes_in(&network)?))
}

async fn get_node(
    caller: Caller,
    State(app): State<AppState>,
    Path((network, id)): Path<(String, Uuid)>,
) -> ApiResult<Json<Node>> {
    let node = node_in(&app, &network, id)?;
    if caller.require_host(node.host_id).is_err() {
        caller.require_network(&network)?;
    }
    Ok(Json(node))
}

async fn update_node(
    caller: Caller,
    State(app): State<AppState>,
    Path((network, id)): Path<(String, Uuid)>,
    Json(update): Json<NodeUpdate>,
) -> ApiResult<Json<Node>> {
    let node = node_in(&app, &network, id)?;
    caller.require_host(node.host_id)?;
    Ok(Json(app.hosts.update_node(id, update)?))
}

async fn delete_node(
    caller: Caller,
    State(app): State<AppState>,
    Path((network, id)): Path<(String, Uuid)>,
) -> ApiResult<Json<Node>> {
    let node = node_in(&app, &network, id)?;
    caller.require_host(node.host_id)?;
    Ok(Json(app.hosts.leave_network(node.host_id, &network)?))
}

async fn peers(
    caller: Caller,
    State(app): State<AppState>,
    Path((network, id)): Path<(String, Uuid)>,
) -> ApiResult<Json<PeerSet>> {
    let node = node_in(&app, &network, id)?;
    caller.require_host(node.host_id)?;
    let snapshot = app.state.snapshot()?;
    Ok(Json(compute_peers(&snapshot, id)))
}

async fn create_ingress(
    caller: Caller,
    State(app): State<AppState>,
    Path((network, id)): Path<(String, Uuid)>,
    body: Option<Json<IngressRequest>>,
) -> ApiResult<Json<Node>> {
    caller.require_admin()?;
    node_in(&app, &network, id)?;
    let req = body.map(|Json(req)| req).unwrap_or_default();
    Ok(Json(app.topology.create_ingress(id, req)?))
}

async fn delete_ingress(
    caller: Caller,
    State(app): State<AppState>,
    Path((network, id)): Path<(String, Uuid)>,
) -> ApiResult<Json<IngressRemoval>> {
    caller.require_admin()?;
    node_in(&app, &network, id)?;
    let (node, deleted_ext_clients) = app.topology.delete_ingress(id)?;
    Ok(Json(IngressRemoval {
        node,
        deleted_ext_clients,
    }))
}

async fn create_egress(
    caller: Caller,
    State(app): State<AppState>,
    Path((network, id)): Path<(String, Uuid)>,
    Json(req): Json<EgressRequest>,
) -> ApiResult<Json<Node>> {
    caller.require_admin()?;
    node_in(&app, &network, id)?;
    Ok(Json(app.topology.create_egress(id, req)?))
}

async fn delete_egress(
    caller: Caller,
    State(app): State<AppState>,
    Path((network, id)): Path<(String, Uuid)>,
) -> ApiResult<Json<Node>> {
    caller.require_admin()?;
    node_in(&app, &network, id)?;
    Ok(Json(app.topology.delete_egress(id)?))
}

async fn create_relay(
    caller: Caller,
    State(app): State<AppState>,
    Path((network, id)): Path<(String, Uuid)>,
    Json(body): Json<RelayBody>,
) -> ApiResult<Json<Node>> {
    caller.require_admin()?;
    node_in(&app, &network, id)?;
    let req = RelayRequest {
        relay_id: id,
        relayed: body.relayed,
    };
    Ok(Json(app.topology.create_relay(req)?))
}

async fn delete_relay(
    caller: Caller,
    State(app): State<AppState>,
    Path((network, id)): Path<(String, Uuid)>,
) -> ApiResult<Json<Node>> {
    caller.require_admin()?;
    node_in(&app, &network, id)?;
    Ok(Json(app.topology.delete_relay(id)?))
}

async fn set_internet_gw(
    caller: Caller,
    State(app): State<AppState>,
    Path((network, id)): Path<(String, Uuid)>,
    body: Option<Json<InternetGwRequest>>,
) -> ApiResult<Json<Node>> {
    caller.require_admin()?;
    node_in(&app, &network, id)?;
    let req = body.map(|Json(req)| req).unwrap_or_default();
    Ok(Json(app.topology.set_internet_gw(id, req)?))
}

async fn unset_internet_gw(
    caller: Caller,
    State(app): State<AppState>,
    Path((network, id)): Path<(String, Uuid)>,
) -> ApiResult<Json<Node>> {
    caller.require_admin()?;
    node_in(&app, &network, id)?;
    Ok(Json(app.topology.unset_internet_gw(id)?))
}

async fn create_failover(
    caller: Caller,
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Node>> {
    caller.require_admin()?;
    Ok(Json(app.failover.create_failover(id)?))
}

async fn delete_failover(
    caller: Caller,
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Node>> {
    caller.require_admin()?;
    Ok(Json(app.failover.delete_failover(id)?))
}

async fn reset_failed_over_peer(
    caller: Caller,
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Node>> {
    let node = app.state.get_node(id)?;
    caller.require_host(node.host_id)?;
    Ok(Json(app.failover.reset_failed_over_peer(id)?))
}

async fn elect_failover(
    caller: Caller,
    State(app): State<AppState>,
    Path(network): Path<String>,
) -> ApiResult<Json<Option<Uuid>>> {
    caller.require_admin()?;
    app.state.get_network(&network)?;
    Ok(Json(app.failover.elect_failover(&network)?))
}

async fn reset_failover(
    caller: Caller,
    State(app): State<AppState>,
    Path(network): Path<String>,
) -> ApiResult<Json<FailoverReset>> {
    caller.require_admin()?;
    let cleared = app.failover.reset_failover(&network)?;
    Ok(Json(FailoverReset { network, cleared }))
}
