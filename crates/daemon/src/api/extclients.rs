//! Ext-client endpoints

use super::{ApiResult, AppState};
use crate::auth::Caller;
use crate::extclients::{ConfigFormat, ExtClientRequest, ExtClientUpdate};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use uuid::Uuid;
use wgmesh_common::{Error, ExtClient};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/extclients", get(list_all))
        .route("/api/extclients/:network", get(list_network))
        .route(
            "/api/extclients/:network/:id",
            get(get_client)
                .post(create_client)
                .put(update_client)
                .delete(delete_client),
        )
        .route("/api/extclients/:network/:id/:format", get(client_config))
}

async fn list_all(caller: Caller, State(app): State<AppState>) -> ApiResult<Json<Vec<ExtClient>>> {
    caller.require_admin()?;
    Ok(Json(app.state.list_ext_clients(None)?))
}

async fn list_network(
    caller: Caller,
    State(app): State<AppState>,
    Path(network): Path<String>,
) -> ApiResult<Json<Vec<ExtClient>>> {
    caller.require_network(&network)?;
    Ok(Json(app.state.list_ext_clients(Some(&network))?))
}

/// `id` names the ingress node the client terminates on
async fn create_client(
    caller: Caller,
    State(app): State<AppState>,
    Path((network, id)): Path<(String, String)>,
    body: Option<Json<ExtClientRequest>>,
) -> ApiResult<(StatusCode, Json<ExtClient>)> {
    caller.require_network(&network)?;
    let ingress_id: Uuid = id
        .parse()
        .map_err(|_| Error::validation(format!("invalid ingress node id {:?}", id)))?;
    let ingress = app.state.get_node(ingress_id)?;
    if ingress.network != network {
        return Err(Error::not_found("node", format!("{}.{}", network, id)).into());
    }

    let req = body.map(|Json(req)| req).unwrap_or_default();
    let client = app.ext_clients.create(ingress_id, req)?;
    Ok((StatusCode::CREATED, Json(client)))
}

async fn get_client(
    caller: Caller,
    State(app): State<AppState>,
    Path((network, id)): Path<(String, String)>,
) -> ApiResult<Json<ExtClient>> {
    caller.require_network(&network)?;
    Ok(Json(app.state.get_ext_client(&network, &id)?))
}

async fn update_client(
    caller: Caller,
    State(app): State<AppState>,
    Path((network, id)): Path<(String, String)>,
    Json(update): Json<ExtClientUpdate>,
) -> ApiResult<Json<ExtClient>> {
    caller.require_network(&network)?;
    Ok(Json(app.ext_clients.update(&network, &id, update)?))
}

async fn delete_client(
    caller: Caller,
    State(app): State<AppState>,
    Path((network, id)): Path<(String, String)>,
) -> ApiResult<Json<ExtClient>> {
    caller.require_network(&network)?;
    Ok(Json(app.ext_clients.delete(&network, &id)?))
}

/// wg-quick file, QR PNG or JSON
async fn client_config(
    caller: Caller,
    State(app): State<AppState>,
    Path((network, id, format)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    caller.require_network(&network)?;
    let format: ConfigFormat = format.parse()?;
    let rendered = app.ext_clients.render_config(&network, &id, format)?;

    let disposition = format!("attachment; filename=\"{}\"", rendered.filename);
    Ok((
        [
            (header::CONTENT_TYPE, rendered.content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        rendered.body,
    )
        .into_response())
}
