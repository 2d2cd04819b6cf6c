//! User administration and basic login

use super::{ApiResult, AppState};
use crate::auth::{Caller, Claims, CreateUser};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use wgmesh_common::{Error, User};

#[derive(Deserialize)]
struct Credentials {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct Login {
    token: String,
    user: User,
}

#[derive(Deserialize)]
struct NetworkGrant {
    networks: Vec<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/users/adm/hassuperadmin", get(has_superadmin))
        .route("/api/users/adm/createsuperadmin", post(create_superadmin))
        .route("/api/users/adm/authenticate", post(authenticate))
        .route("/api/users", get(list_users).post(create_user))
        .route("/api/users/:username", delete(delete_user))
        .route("/api/users/:username/networks", put(set_networks))
}

async fn has_superadmin(State(app): State<AppState>) -> ApiResult<Json<bool>> {
    Ok(Json(app.users.has_superadmin()?))
}

/// Open until the first superadmin exists
async fn create_superadmin(
    State(app): State<AppState>,
    Json(creds): Json<Credentials>,
) -> ApiResult<(StatusCode, Json<User>)> {
    let user = app.users.create_superadmin(&creds.username, &creds.password)?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn authenticate(
    State(app): State<AppState>,
    Json(creds): Json<Credentials>,
) -> ApiResult<Json<Login>> {
    if !app.state.config().features.basic_auth {
        return Err(Error::Unauthorized("basic auth is disabled".into()).into());
    }
    let user = app.users.authenticate(&creds.username, &creds.password)?;
    let token = app.auth.jwt().issue(&Claims::for_user(&user))?;
    Ok(Json(Login {
        token,
        user: user.redacted(),
    }))
}

async fn list_users(caller: Caller, State(app): State<AppState>) -> ApiResult<Json<Vec<User>>> {
    caller.require_admin()?;
    Ok(Json(app.users.list()?))
}

async fn create_user(
    caller: Caller,
    State(app): State<AppState>,
    Json(req): Json<CreateUser>,
) -> ApiResult<(StatusCode, Json<User>)> {
    caller.require_admin()?;
    if req.is_admin {
        caller.require_superadmin()?;
    }
    let user = app.users.create(req)?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn delete_user(
    caller: Caller,
    State(app): State<AppState>,
    Path(username): Path<String>,
) -> ApiResult<StatusCode> {
    caller.require_admin()?;
    let target = app.users.get(&username)?;
    if target.is_admin {
        caller.require_superadmin()?;
    }
    app.users.delete(&username)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_networks(
    caller: Caller,
    State(app): State<AppState>,
    Path(username): Path<String>,
    Json(grant): Json<NetworkGrant>,
) -> ApiResult<Json<User>> {
    caller.require_admin()?;
    for network in &grant.networks {
        app.state.get_network(network)?;
    }
    Ok(Json(app.users.set_networks(&username, grant.networks)?))
}
