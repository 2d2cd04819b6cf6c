//! wgmesh daemon
//!
//! Serves the HTTP/WebSocket API and gRPC NodeService, and fans peer updates
//! out over the message broker.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wgmesh_common::BrokerType;
use wgmesh_daemon::config::DaemonConfig;
use wgmesh_daemon::publish::MqttBroker;
use wgmesh_daemon::state::StateManager;
use wgmesh_daemon::ControlPlane;

#[derive(Parser)]
#[command(name = "wgmeshd")]
#[command(about = "wgmesh daemon - WireGuard mesh control plane")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "WGMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long, env = "WGMESH_STORE")]
    store: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    #[arg(long, env = "MASTER_KEY", hide_env_values = true)]
    master_key: Option<String>,

    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// mq or emqx
    #[arg(long, env = "BROKER_TYPE")]
    broker_type: Option<BrokerType>,

    #[arg(long, env = "BROKER_ENDPOINT")]
    broker_endpoint: Option<String>,

    #[arg(long, env = "BROKER_USERNAME")]
    broker_username: Option<String>,

    #[arg(long, env = "BROKER_PASSWORD", hide_env_values = true)]
    broker_password: Option<String>,

    #[arg(long, env = "EMQX_REST_ENDPOINT")]
    emqx_rest_endpoint: Option<String>,

    /// Public host name of the API
    #[arg(long, env = "API_HOST")]
    api_host: Option<String>,

    #[arg(long, env = "API_PORT")]
    api_port: Option<u16>,

    #[arg(long, env = "GRPC_PORT")]
    grpc_port: Option<u16>,

    #[arg(long, env = "SERVER_NAME")]
    server_name: Option<String>,

    #[arg(long, env = "FRONTEND_URL")]
    frontend_url: Option<String>,

    /// google, github, azure-ad or oidc
    #[arg(long, env = "OAUTH_PROVIDER")]
    oauth_provider: Option<String>,

    #[arg(long, env = "OAUTH_CLIENT_ID")]
    oauth_client_id: Option<String>,

    #[arg(long, env = "OAUTH_CLIENT_SECRET", hide_env_values = true)]
    oauth_client_secret: Option<String>,

    #[arg(long, env = "AZURE_TENANT")]
    azure_tenant: Option<String>,

    #[arg(long, env = "OIDC_ISSUER")]
    oidc_issuer: Option<String>,

    #[arg(long, env = "DNS_KEY", hide_env_values = true)]
    dns_key: Option<String>,

    #[arg(long, env = "DISPLAY_KEYS")]
    display_keys: Option<bool>,

    #[arg(long, env = "BASIC_AUTH")]
    basic_auth: Option<bool>,

    #[arg(long, env = "RCE")]
    rce: Option<bool>,

    #[arg(long, env = "DNS_MODE")]
    dns_mode: Option<bool>,

    /// Do not start the gRPC listener
    #[arg(long)]
    no_grpc: bool,
}

impl Cli {
    /// Flags and environment take precedence over the file
    fn apply(self, config: &mut DaemonConfig) {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *slot = value;
            }
        }

        set(&mut config.store_path, self.store);
        set(&mut config.server_name, self.server_name);

        set(&mut config.api.host, self.api_host);
        set(&mut config.api.port, self.api_port);
        set(&mut config.api.grpc_port, self.grpc_port);
        set(&mut config.api.frontend_url, self.frontend_url);
        config.api.master_key = self.master_key.or(config.api.master_key.take());
        config.api.jwt_secret = self.jwt_secret.or(config.api.jwt_secret.take());

        set(&mut config.broker.broker_type, self.broker_type);
        set(&mut config.broker.endpoint, self.broker_endpoint);
        set(&mut config.broker.username, self.broker_username);
        set(&mut config.broker.password, self.broker_password);
        config.broker.emqx_rest_endpoint = self
            .emqx_rest_endpoint
            .or(config.broker.emqx_rest_endpoint.take());

        config.oauth.provider = self.oauth_provider.or(config.oauth.provider.take());
        set(&mut config.oauth.client_id, self.oauth_client_id);
        set(&mut config.oauth.client_secret, self.oauth_client_secret);
        config.oauth.azure_tenant = self.azure_tenant.or(config.oauth.azure_tenant.take());
        config.oauth.oidc_issuer = self.oidc_issuer.or(config.oauth.oidc_issuer.take());

        config.features.dns_key = self.dns_key.or(config.features.dns_key.take());
        set(&mut config.features.display_keys, self.display_keys);
        set(&mut config.features.basic_auth, self.basic_auth);
        set(&mut config.features.rce, self.rce);
        set(&mut config.features.dns_mode, self.dns_mode);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let (plain, json) = if cli.log_json {
        (None, Some(fmt::layer().json()))
    } else {
        (Some(fmt::layer()), None)
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .init();

    info!("wgmesh daemon v{}", wgmesh_common::VERSION);

    let mut config = match &cli.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };
    let no_grpc = cli.no_grpc;
    cli.apply(&mut config);

    let state = StateManager::new(&config).await?;
    let broker = Arc::new(MqttBroker::new(config.broker.clone(), &config.server_name)?);
    let plane = ControlPlane::build(state, broker).await?;

    let http = TcpListener::bind(config.api.http_addr()).await?;
    let grpc_addr: Option<SocketAddr> = if no_grpc {
        None
    } else {
        Some(config.api.grpc_addr().parse()?)
    };

    info!(
        "Serving {} as {} (broker: {})",
        config.api.base_url(),
        config.server_name,
        config.broker.broker_type
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => error!("Failed to listen for shutdown signal: {}", e),
            }
            shutdown.cancel();
        });
    }

    plane.run(http, grpc_addr, shutdown).await?;

    info!("Daemon shutdown complete");
    Ok(())
}
