//! Health, server config, fleet broadcast and DNS records

use super::{ApiResult, AppState};
use crate::auth::{bearer, Caller};
use crate::dns::{self, DnsEntry};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use wgmesh_common::{crypto::constant_time_eq, HostAction, ServerConfig, ServerUpdate, VERSION};

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    broker: String,
    pending_events: usize,
    dropped_events: u64,
}

#[derive(Deserialize)]
struct Broadcast {
    action: HostAction,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/server/getconfig", get(server_config))
        .route("/api/server/broadcast", post(broadcast))
        .route("/api/dns", get(all_dns))
        .route("/api/dns/adm/:network", get(network_dns))
}

async fn health(State(app): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        version: VERSION,
        broker: format!("{:?}", app.publisher.connection_state()).to_lowercase(),
        pending_events: app.publisher.pending(),
        dropped_events: app.publisher.dropped(),
    })
}

async fn server_config(_caller: Caller, State(app): State<AppState>) -> Json<ServerConfig> {
    Json(app.state.server_config())
}

/// Send a fleet-wide action to every host
async fn broadcast(
    caller: Caller,
    State(app): State<AppState>,
    Json(req): Json<Broadcast>,
) -> ApiResult<Json<ServerUpdate>> {
    caller.require_admin()?;
    let update = ServerUpdate {
        action: req.action,
        version: VERSION.to_string(),
    };
    app.publisher.server_update(update.clone());
    Ok(Json(update))
}

async fn all_dns(caller: Caller, State(app): State<AppState>) -> ApiResult<Json<Vec<DnsEntry>>> {
    caller.require_admin()?;
    Ok(Json(dns::entries(&app.state, None)?))
}

/// Records of one network for a resolver presenting the DNS key
async fn network_dns(
    State(app): State<AppState>,
    Path(network): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<DnsEntry>>> {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(bearer)
        .unwrap_or_default();

    let by_key = app
        .state
        .config()
        .features
        .dns_key
        .as_deref()
        .filter(|k| !k.is_empty())
        .is_some_and(|key| constant_time_eq(presented, key));
    if !by_key {
        app.auth.authenticate(presented)?.require_network(&network)?;
    }
    Ok(Json(dns::entries(&app.state, Some(&network))?))
}
