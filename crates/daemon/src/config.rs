//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use wgmesh_common::BrokerType;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Server name, used in broker topics
    pub server_name: String,

    /// Lifetime of a pending enrollment in the session cache
    pub session_ttl_secs: u64,

    /// HTTP / gRPC configuration
    pub api: ApiConfig,

    /// Broker configuration
    pub broker: BrokerConfig,

    /// OAuth provider configuration
    pub oauth: OAuthConfig,

    /// Feature toggles
    pub features: FeatureFlags,

    /// Publish engine tuning
    pub publish: PublishConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: wgmesh_common::default_store_path(),
            server_name: "wgmesh".to_string(),
            session_ttl_secs: 300,
            api: ApiConfig::default(),
            broker: BrokerConfig::default(),
            oauth: OAuthConfig::default(),
            features: FeatureFlags::default(),
            publish: PublishConfig::default(),
        }
    }
}

/// HTTP and gRPC listeners
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Public host name clients and IdPs use to reach the API
    pub host: String,

    /// Public HTTP port
    pub port: u16,

    /// URL scheme of the public address
    pub scheme: String,

    /// Bind address for both listeners
    pub listen: String,

    /// gRPC port
    pub grpc_port: u16,

    /// Dashboard URL that receives `?login=<jwt>&user=<name>`
    pub frontend_url: String,

    /// Bearer that bypasses JWT validation
    pub master_key: Option<String>,

    /// HS256 secret for locally minted JWTs; random per process when unset
    pub jwt_secret: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8081,
            scheme: "http".to_string(),
            listen: "0.0.0.0".to_string(),
            grpc_port: 50051,
            frontend_url: "http://127.0.0.1:8080".to_string(),
            master_key: None,
            jwt_secret: None,
        }
    }
}

impl ApiConfig {
    /// Base URL used in redirects handed to browsers and CLIs
    pub fn base_url(&self) -> String {
        match (self.scheme.as_str(), self.port) {
            ("https", 443) | ("http", 80) => format!("{}://{}", self.scheme, self.host),
            _ => format!("{}://{}:{}", self.scheme, self.host, self.port),
        }
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.listen, self.port)
    }

    pub fn grpc_addr(&self) -> String {
        format!("{}:{}", self.listen, self.grpc_port)
    }
}

/// Message broker connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub broker_type: BrokerType,

    /// `mqtt://host:port` as seen by this server
    pub endpoint: String,

    /// Endpoint handed to hosts; defaults to `endpoint`
    pub public_endpoint: Option<String>,

    pub username: String,
    pub password: String,

    /// EMQX REST API base, used only with `broker_type = "emqx"`
    pub emqx_rest_endpoint: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_type: BrokerType::Mq,
            endpoint: "mqtt://127.0.0.1:1883".to_string(),
            public_endpoint: None,
            username: "wgmesh".to_string(),
            password: String::new(),
            emqx_rest_endpoint: None,
        }
    }
}

impl BrokerConfig {
    /// Split `endpoint` into host and port
    pub fn host_port(&self) -> (String, u16) {
        let stripped = self
            .endpoint
            .split("://")
            .last()
            .unwrap_or(&self.endpoint)
            .trim_end_matches('/');
        match stripped.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().unwrap_or(1883)),
            None => (stripped.to_string(), 1883),
        }
    }
}

/// OAuth provider settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OAuthConfig {
    /// One of google, github, azure-ad, oidc; OAuth disabled when unset
    pub provider: Option<String>,
    pub client_id: String,
    pub client_secret: String,
    pub azure_tenant: Option<String>,
    pub oidc_issuer: Option<String>,
}

impl OAuthConfig {
    pub fn is_configured(&self) -> bool {
        self.provider.is_some() && !self.client_id.is_empty()
    }
}

/// Feature toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Allow password-based WS registration
    pub basic_auth: bool,

    /// Show enrollment-key values in list responses
    pub display_keys: bool,

    /// Accept post-up/post-down from clients
    pub rce: bool,

    /// Regenerate the hosts file periodically
    pub dns_mode: bool,

    /// Bearer for the DNS read path
    pub dns_key: Option<String>,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            basic_auth: true,
            display_keys: true,
            rce: false,
            dns_mode: false,
            dns_key: None,
        }
    }
}

/// Publish engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// High-water mark of the event queue
    pub queue_capacity: usize,

    /// Per-message publish timeout
    pub publish_timeout_secs: u64,

    /// Attempts per message before the host is skipped
    pub publish_attempts: u32,

    /// How long shutdown keeps draining the queue
    pub shutdown_grace_secs: u64,

    /// Reconnect backoff
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            publish_timeout_secs: 5,
            publish_attempts: 3,
            shutdown_grace_secs: 5,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
        }
    }
}

impl PublishConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }

    /// Get signing key path
    pub fn signing_key_path(&self) -> PathBuf {
        self.store_path.join("server.key")
    }

    /// Get generated hosts file path
    pub fn hosts_file_path(&self) -> PathBuf {
        self.store_path.join("hosts")
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Broker endpoint advertised to hosts
    pub fn public_broker_endpoint(&self) -> String {
        self.broker
            .public_endpoint
            .clone()
            .unwrap_or_else(|| self.broker.endpoint.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
            server_name = "mesh-1"

            [api]
            host = "api.example.com"
            port = 443
            scheme = "https"

            [features]
            rce = true
            "#,
        )
        .unwrap();

        assert_eq!(config.server_name, "mesh-1");
        assert_eq!(config.api.base_url(), "https://api.example.com");
        assert_eq!(config.api.grpc_port, 50051);
        assert!(config.features.rce);
        assert!(config.features.basic_auth);
        assert_eq!(config.session_ttl_secs, 300);
    }

    #[test]
    fn test_broker_host_port() {
        let mut broker = BrokerConfig::default();
        assert_eq!(broker.host_port(), ("127.0.0.1".to_string(), 1883));
        broker.endpoint = "broker.example.com".to_string();
        assert_eq!(broker.host_port(), ("broker.example.com".to_string(), 1883));
        broker.endpoint = "mqtts://broker.example.com:8883".to_string();
        assert_eq!(broker.host_port(), ("broker.example.com".to_string(), 8883));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = DaemonConfig::default();
        config.oauth.provider = Some("github".into());
        config.save(&path).unwrap();

        let loaded = DaemonConfig::load(&path).unwrap();
        assert_eq!(loaded.oauth.provider.as_deref(), Some("github"));
        assert_eq!(loaded.api.base_url(), "http://127.0.0.1:8081");
    }
}
