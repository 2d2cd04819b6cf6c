//! wgmesh daemon
//!
//! Control plane for a WireGuard mesh: host enrollment, network topology,
//! peer computation and fan-out of peer updates over a message broker.

pub mod actions;
pub mod allocator;
pub mod api;
pub mod auth;
pub mod config;
pub mod dns;
pub mod enrollment;
pub mod enrollment_keys;
pub mod extclients;
pub mod failover;
pub mod grpc;
pub mod hosts;
pub mod oauth;
pub mod publish;
pub mod session_cache;
pub mod state;
pub mod topology;

use crate::actions::HostActions;
use crate::api::AppState;
use crate::auth::{Authenticator, JwtManager, UserStore};
use crate::enrollment::Enrollment;
use crate::enrollment_keys::EnrollmentKeyStore;
use crate::extclients::ExtClientManager;
use crate::failover::FailoverController;
use crate::grpc::NodeServiceImpl;
use crate::hosts::HostManager;
use crate::oauth::OAuthBridge;
use crate::publish::{Broker, PublishEngine};
use crate::session_cache::SessionCache;
use crate::state::StateManager;
use crate::topology::Topology;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use wgmesh_common::Result;

/// How often expired sessions and OAuth states are swept
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Every component wired together, ready to serve
pub struct ControlPlane {
    pub app: AppState,
    pub sessions: SessionCache,
    engine: PublishEngine,
}

impl ControlPlane {
    /// Wire the components over `state`, installing the configured OAuth provider
    pub async fn build(state: StateManager, broker: Arc<dyn Broker>) -> Result<Self> {
        let config = state.config().clone();
        let db = state.db().clone();

        let (engine, publisher) = PublishEngine::new(state.clone(), broker.clone());
        let failover = FailoverController::new(state.clone(), publisher.clone());
        let topology = Topology::new(state.clone(), publisher.clone(), failover.clone());
        let ext_clients = ExtClientManager::new(state.clone(), publisher.clone());
        let actions = HostActions::new();
        let hosts = HostManager::new(
            state.clone(),
            publisher.clone(),
            broker.clone(),
            actions.clone(),
            topology.clone(),
            failover.clone(),
        );

        let users = UserStore::new(db.clone());
        let keys = EnrollmentKeyStore::new(db.clone());
        let jwt = JwtManager::load(&db, config.api.jwt_secret.as_deref())?;
        let sessions = SessionCache::new(config.session_ttl());
        let oauth = OAuthBridge::new(
            sessions.clone(),
            users.clone(),
            jwt.clone(),
            &config.api.frontend_url,
        );

        let redirect = format!("{}/api/oauth/callback", config.api.base_url());
        if let Some(provider) = oauth::init_provider(&config.oauth, redirect).await? {
            oauth.install(provider)?;
        }

        let enrollment = Enrollment::new(
            state.clone(),
            sessions.clone(),
            oauth.clone(),
            users.clone(),
            jwt.clone(),
            keys.clone(),
            hosts.clone(),
            broker,
        );
        let auth = Authenticator::new(jwt, users.clone(), config.api.master_key.clone());

        let app = AppState {
            state,
            auth,
            users,
            keys,
            oauth,
            enrollment,
            hosts,
            actions,
            topology,
            failover,
            ext_clients,
            publisher,
        };
        Ok(Self { app, sessions, engine })
    }

    pub fn grpc_service(&self) -> NodeServiceImpl {
        NodeServiceImpl::new(
            self.app.state.clone(),
            self.app.auth.clone(),
            self.app.enrollment.clone(),
            self.app.hosts.clone(),
        )
    }

    /// Run every task until `shutdown` fires or one of them fails
    pub async fn run(
        self,
        http: TcpListener,
        grpc_addr: Option<SocketAddr>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let grpc = self.grpc_service();
        let Self { app, sessions, engine } = self;
        let mut tasks = JoinSet::new();

        tasks.spawn(engine.run(shutdown.clone()));
        {
            let (app, shutdown) = (app.clone(), shutdown.clone());
            tasks.spawn(async move {
                if let Err(e) = api::serve(http, app, shutdown.clone()).await {
                    error!("HTTP server failed: {}", e);
                    shutdown.cancel();
                }
            });
        }
        if let Some(addr) = grpc_addr {
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                if let Err(e) = grpc::serve(addr, grpc, shutdown.clone()).await {
                    error!("gRPC server failed: {}", e);
                    shutdown.cancel();
                }
            });
        }
        if app.state.config().features.dns_mode {
            tasks.spawn(dns::run(app.state.clone(), shutdown.clone()));
        }
        tasks.spawn(maintenance(sessions, app.oauth.clone(), shutdown.clone()));

        // startup convergence: every host gets a fresh view
        app.publisher.full_refresh();
        info!("Control plane running");

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Task panicked: {}", e);
                shutdown.cancel();
            }
        }
        info!("Control plane stopped");
        Ok(())
    }
}

/// Sweep expired enrollment sessions and login states
async fn maintenance(sessions: SessionCache, oauth: OAuthBridge, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let purged = sessions.purge_expired();
                oauth.states().purge_expired();
                if purged > 0 {
                    debug!("Purged {} expired enrollment sessions", purged);
                }
            }
        }
    }
}
