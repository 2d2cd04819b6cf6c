//! HTTP and WebSocket surface

mod error;
mod extclients;
mod hosts;
mod networks;
mod nodes;
mod oauth;
mod server;
mod users;
pub mod ws;

pub use error::{status_of, ApiError, ApiResult};

use crate::actions::HostActions;
use crate::auth::{Authenticator, UserStore};
use crate::enrollment::Enrollment;
use crate::enrollment_keys::EnrollmentKeyStore;
use crate::extclients::ExtClientManager;
use crate::failover::FailoverController;
use crate::hosts::HostManager;
use crate::oauth::OAuthBridge;
use crate::publish::Publisher;
use crate::state::StateManager;
use crate::topology::Topology;
use axum::extract::FromRef;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Everything handlers reach for
#[derive(Clone)]
pub struct AppState {
    pub state: StateManager,
    pub auth: Authenticator,
    pub users: UserStore,
    pub keys: EnrollmentKeyStore,
    pub oauth: OAuthBridge,
    pub enrollment: Enrollment,
    pub hosts: HostManager,
    pub actions: HostActions,
    pub topology: Topology,
    pub failover: FailoverController,
    pub ext_clients: ExtClientManager,
    pub publisher: Publisher,
}

impl FromRef<AppState> for Authenticator {
    fn from_ref(app: &AppState) -> Self {
        app.auth.clone()
    }
}

pub fn router(app: AppState) -> Router {
    Router::new()
        .merge(server::routes())
        .merge(hosts::routes())
        .merge(nodes::routes())
        .merge(networks::routes())
        .merge(extclients::routes())
        .merge(users::routes())
        .merge(oauth::routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app)
}

/// Serve the API on `listener` until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    app: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!("HTTP API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(app))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}
