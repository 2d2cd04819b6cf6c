//! Host enrollment
//!
//! Host join, node SSO and headless login share one rendezvous: the socket handler
//! parks a [`PendingEnrollment`] in the session cache under a fresh state, hands the
//! client a login URL, and waits until the OAuth callback fills the status slot.
//! Enrollment keys skip the rendezvous and register a host in one request.

use crate::auth::{Claims, JwtManager, UserStore};
use crate::enrollment_keys::{untokenize, EnrollmentKeyStore};
use crate::hosts::HostManager;
use crate::oauth::{new_state, OAuthBridge};
use crate::publish::Broker;
use crate::session_cache::{PendingEnrollment, SessionCache, SessionKind, SessionStatus};
use crate::state::StateManager;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wgmesh_common::{Error, ErrorKind, Host, RegisterMsg, RegisterResponse, Result, User};

/// How a session socket ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Close {
    Normal,
    /// The client broke the protocol or was refused
    Policy(String),
    /// Server-side failure
    Error(String),
}

impl Close {
    fn from_result(result: &Result<()>) -> Self {
        match result {
            Ok(()) => Close::Normal,
            Err(e) if matches!(e.kind(), ErrorKind::Internal | ErrorKind::Transient) => {
                Close::Error(e.to_string())
            }
            Err(e) => Close::Policy(e.to_string()),
        }
    }
}

/// Text-frame socket an enrollment session runs over
#[async_trait]
pub trait EnrollmentTransport: Send {
    /// Next text frame, `None` once the client closed or the socket failed
    async fn recv_text(&mut self) -> Option<String>;
    async fn send_text(&mut self, text: String) -> Result<()>;
    async fn close(&mut self, close: Close);
}

/// First message of a node SSO session
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeSsoRequest {
    pub network: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Clone)]
pub struct Enrollment {
    state: StateManager,
    sessions: SessionCache,
    oauth: OAuthBridge,
    users: UserStore,
    jwt: JwtManager,
    keys: EnrollmentKeyStore,
    hosts: HostManager,
    broker: Arc<dyn Broker>,
}

impl Enrollment {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: StateManager,
        sessions: SessionCache,
        oauth: OAuthBridge,
        users: UserStore,
        jwt: JwtManager,
        keys: EnrollmentKeyStore,
        hosts: HostManager,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            state,
            sessions,
            oauth,
            users,
            jwt,
            keys,
            hosts,
            broker,
        }
    }

    // ========================================================================
    // Socket sessions
    // ========================================================================

    /// Register a host over a socket, by basic auth or SSO, then close it
    pub async fn host_join_session<T: EnrollmentTransport>(&self, ws: &mut T) -> Result<()> {
        let result = self.host_join(ws).await;
        if let Err(e) = &result {
            debug!("Host join session ended: {}", e);
        }
        ws.close(Close::from_result(&result)).await;
        result
    }

    /// Hand a CLI a network-scoped access token, then close
    pub async fn node_sso_session<T: EnrollmentTransport>(&self, ws: &mut T) -> Result<()> {
        let result = self.node_sso(ws).await;
        if let Err(e) = &result {
            debug!("Node SSO session ended: {}", e);
        }
        ws.close(Close::from_result(&result)).await;
        result
    }

    /// Hand a headless client a user JWT after a browser login, then close
    pub async fn headless_session<T: EnrollmentTransport>(&self, ws: &mut T) -> Result<()> {
        let result = self.headless(ws).await;
        if let Err(e) = &result {
            debug!("Headless login session ended: {}", e);
        }
        ws.close(Close::from_result(&result)).await;
        result
    }

    async fn host_join<T: EnrollmentTransport>(&self, ws: &mut T) -> Result<()> {
        let msg: RegisterMsg = read_json(ws).await?;
        let host_id = msg.register_host.id;
        if host_id.is_nil() {
            return Err(Error::validation("host id is required"));
        }
        if !msg.user.is_empty() && msg.password.is_empty() {
            return Err(Error::validation("a password is required with a user name"));
        }
        if !msg.join_all && !msg.network.is_empty() {
            self.state.get_network(&msg.network)?;
        }

        let state = new_state();
        let mut pending = PendingEnrollment::new(SessionKind::HostJoin);
        pending.host = Some(msg.register_host.clone());
        pending.network = Some(msg.network.clone()).filter(|n| !n.is_empty());
        pending.join_all = msg.join_all;
        pending.user = Some(msg.user.clone()).filter(|u| !u.is_empty());
        self.sessions.insert(&state, pending)?;
        let _guard = self.sessions.guard(&state);

        let user = if msg.user.is_empty() {
            ws.send_text(self.sso_url(&state)?).await?;
            let done = self.await_session(ws, &state).await?;
            let username = done
                .user
                .ok_or_else(|| Error::Internal("completed session without a user".into()))?;
            self.users.get(&username)?
        } else {
            let user = self.basic_auth(&msg.user, &msg.password)?;
            if !user.is_privileged() {
                return Err(Error::PermissionDenied(format!(
                    "user {} may not register hosts",
                    user.username
                )));
            }
            user
        };

        let networks = self.hosts.requested_networks(&msg.network, msg.join_all)?;
        let response = self.register_host(msg.register_host).await?;
        ws.send_text(serde_json::to_string(&response)?).await?;
        info!(
            "Host {} enrolled by {}, joining {:?}",
            host_id, user.username, networks
        );

        let hosts = self.hosts.clone();
        let scope = Some(user).filter(|u| !u.is_privileged());
        tokio::spawn(async move {
            hosts.join_networks(host_id, &networks, scope.as_ref());
        });
        Ok(())
    }

    async fn node_sso<T: EnrollmentTransport>(&self, ws: &mut T) -> Result<()> {
        let req: NodeSsoRequest = read_json(ws).await?;
        self.state.get_network(&req.network)?;

        if !req.user.is_empty() {
            let user = self.basic_auth(&req.user, &req.password)?;
            if !user.can_access(&req.network) {
                return Err(Error::PermissionDenied(format!(
                    "user {} may not join network {}",
                    user.username, req.network
                )));
            }
            let token = self.jwt.issue(&Claims::for_node(&user.username, &req.network))?;
            return ws.send_text(format!("AccessToken: {}", token)).await;
        }

        let state = new_state();
        let mut pending = PendingEnrollment::new(SessionKind::NodeSso);
        pending.network = Some(req.network);
        self.sessions.insert(&state, pending)?;
        let _guard = self.sessions.guard(&state);

        ws.send_text(self.sso_url(&state)?).await?;
        let slot = completed_slot(self.await_session(ws, &state).await?)?;
        ws.send_text(slot).await
    }

    async fn headless<T: EnrollmentTransport>(&self, ws: &mut T) -> Result<()> {
        let state = new_state();
        self.sessions
            .insert(&state, PendingEnrollment::new(SessionKind::Headless))?;
        let _guard = self.sessions.guard(&state);

        ws.send_text(self.sso_url(&state)?).await?;
        let slot = completed_slot(self.await_session(ws, &state).await?)?;
        ws.send_text(slot).await
    }

    fn basic_auth(&self, username: &str, password: &str) -> Result<User> {
        if !self.state.config().features.basic_auth {
            return Err(Error::Unauthorized("basic auth is disabled".into()));
        }
        self.users.authenticate(username, password)
    }

    /// Where the client sends its user to log in
    fn sso_url(&self, state: &str) -> Result<String> {
        if !self.oauth.is_configured() {
            return Err(Error::validation("OAuth is not configured"));
        }
        Ok(format!(
            "{}/api/oauth/register/{}",
            self.state.config().api.base_url(),
            state
        ))
    }

    /// Wait for the callback to fill the session, or for the client to leave
    async fn await_session<T: EnrollmentTransport>(
        &self,
        ws: &mut T,
        state: &str,
    ) -> Result<PendingEnrollment> {
        let deadline = Instant::now() + self.sessions.ttl();
        let done = loop {
            tokio::select! {
                done = self.sessions.wait_for_completion(state, deadline) => break done?,
                frame = ws.recv_text() => {
                    if frame.is_none() {
                        return Err(Error::validation("client closed the socket"));
                    }
                }
            }
        };

        match &done.status {
            SessionStatus::Completed(_) => Ok(done),
            SessionStatus::Failed(reason) => Err(Error::Unauthorized(reason.clone())),
            SessionStatus::Pending => Err(Error::Internal("session woke up still pending".into())),
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Persist a host and provision its broker login.
    ///
    /// A host that is already registered is returned as stored and keeps the
    /// broker login it was given the first time.
    pub async fn register_host(&self, host: Host) -> Result<RegisterResponse> {
        let (host, created) = self.state.insert_host(host)?;
        let mut server_conf = self.state.server_config();
        if created {
            let credentials = match self.broker.provision_host(host.id).await {
                Ok(credentials) => credentials,
                Err(e) => {
                    // a host without a broker login would never be provisioned again
                    if let Err(undo) = self.state.remove_host(host.id) {
                        warn!("Could not roll back host {}: {}", host.id, undo);
                    }
                    return Err(e);
                }
            };
            server_conf.broker_username = credentials.username;
            server_conf.broker_password = credentials.password;
        }
        Ok(RegisterResponse {
            server_conf,
            requested_host: host.redacted(),
        })
    }

    /// Register a host with an enrollment token, joining every network the key covers.
    ///
    /// One use of the key is spent before anything is written and handed back
    /// if registration fails.
    pub async fn register_with_key(&self, token: &str, host: Host) -> Result<RegisterResponse> {
        if host.id.is_nil() {
            return Err(Error::validation("host id is required"));
        }
        let token = untokenize(token)?;
        let key = self.keys.resolve(&token.value)?;
        for network in &key.networks {
            self.keys.validate(&token.value, network)?;
        }
        self.keys.consume(&key)?;

        let host_id = host.id;
        let response = match self.register_host(host).await {
            Ok(response) => response,
            Err(e) => {
                if let Err(restore) = self.keys.release(&key) {
                    warn!("Could not give back a use of key {}: {}", key.id, restore);
                }
                return Err(e);
            }
        };

        let joined = self.hosts.join_networks(host_id, &key.networks, None);
        if joined.len() < key.networks.len() {
            warn!(
                "Host {} joined {} of {} network(s) of key {}",
                host_id,
                joined.len(),
                key.networks.len(),
                key.id
            );
        }

        info!("Host {} registered with enrollment key {}", host_id, key.id);
        Ok(response)
    }

    /// Host-scoped JWT for a host that knows its password
    pub fn host_token(&self, host_id: Uuid, password: &str) -> Result<String> {
        let denied = || Error::Unauthorized("invalid host credentials".into());
        let host = self.state.get_host(host_id).map_err(|_| denied())?;
        if host.host_pass.is_empty()
            || !crate::auth::password::verify_password(password, &host.host_pass)?
        {
            return Err(denied());
        }
        self.jwt.issue(&Claims::for_host(host_id))
    }
}

async fn read_json<M: DeserializeOwned, T: EnrollmentTransport>(ws: &mut T) -> Result<M> {
    let text = ws
        .recv_text()
        .await
        .ok_or_else(|| Error::validation("client closed the socket"))?;
    serde_json::from_str(&text).map_err(|e| Error::validation(format!("malformed message: {}", e)))
}

fn completed_slot(done: PendingEnrollment) -> Result<String> {
    match done.status {
        SessionStatus::Completed(slot) => Ok(slot),
        _ => Err(Error::Internal("session is not completed".into())),
    }
}
