//! In-process server: the full control plane on an ephemeral port

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wgmesh_daemon::api::AppState;
use wgmesh_daemon::config::DaemonConfig;
use wgmesh_daemon::oauth::OAuthProvider;
use wgmesh_daemon::publish::MemoryBroker;
use wgmesh_daemon::session_cache::SessionCache;
use wgmesh_daemon::state::StateManager;
use wgmesh_daemon::ControlPlane;

use crate::error::{E2eError, E2eResult};

/// Bearer that bypasses JWT validation in every test server
pub const MASTER_KEY: &str = "e2e-master-key";

/// Server configuration
pub struct ServerConfig {
    pub basic_auth: bool,
    pub session_ttl: Duration,
    pub startup_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            basic_auth: true,
            session_ttl: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(10),
        }
    }
}

/// Handle to a running server
pub struct ServerHandle {
    pub base_url: String,
    pub ws_url: String,
    pub port: u16,
    pub app: AppState,
    pub sessions: SessionCache,
    pub broker: MemoryBroker,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Start a control plane over an in-memory store and broker
    pub async fn spawn(config: ServerConfig) -> E2eResult<Self> {
        Self::spawn_with(config, None).await
    }

    /// Same, with `provider` installed as the identity provider
    pub async fn spawn_with(
        config: ServerConfig,
        provider: Option<Arc<dyn OAuthProvider>>,
    ) -> E2eResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let base_url = format!("http://127.0.0.1:{}", port);
        let ws_url = format!("ws://127.0.0.1:{}", port);

        info!("Spawning control plane on port {}", port);

        let mut daemon = DaemonConfig::default();
        daemon.server_name = "e2e".into();
        daemon.session_ttl_secs = config.session_ttl.as_secs();
        daemon.api.host = "127.0.0.1".into();
        daemon.api.port = port;
        daemon.api.master_key = Some(MASTER_KEY.into());
        daemon.api.frontend_url = "http://dashboard.test".into();
        daemon.features.basic_auth = config.basic_auth;

        let state = StateManager::in_memory(daemon)?;
        let broker = MemoryBroker::new();
        let plane = ControlPlane::build(state, Arc::new(broker.clone())).await?;
        if let Some(provider) = provider {
            plane.app.oauth.install(provider)?;
        }

        let app = plane.app.clone();
        let sessions = plane.sessions.clone();
        let shutdown = CancellationToken::new();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = plane.run(listener, None, shutdown).await {
                    warn!("Control plane exited: {}", e);
                }
            })
        };

        let handle = ServerHandle {
            base_url: base_url.clone(),
            ws_url,
            port,
            app,
            sessions,
            broker,
            shutdown,
            task: Some(task),
        };

        handle.wait_for_healthy(config.startup_timeout).await?;

        info!("Server is healthy at {}", base_url);
        Ok(handle)
    }

    /// Wait for the server to respond to health checks
    async fn wait_for_healthy(&self, timeout_duration: Duration) -> E2eResult<()> {
        let health_url = self.url("/api/health");
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        let start = std::time::Instant::now();
        let mut attempts = 0;

        while start.elapsed() < timeout_duration {
            attempts += 1;

            match client.get(&health_url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(());
                }
                Ok(resp) => {
                    warn!("Health check returned {}", resp.status());
                }
                Err(e) => {
                    if !e.is_connect() {
                        warn!("Health check error: {}", e);
                    }
                }
            }

            sleep(Duration::from_millis(50)).await;
        }

        Err(E2eError::ServerHealthCheck(attempts))
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn ws(&self, path: &str) -> String {
        format!("{}{}", self.ws_url, path)
    }

    /// Stop the server and wait for its tasks
    pub async fn stop(mut self) -> E2eResult<()> {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| E2eError::ServerStartup(format!("server task failed: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
