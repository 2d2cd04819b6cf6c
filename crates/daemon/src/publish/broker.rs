//! Broker clients

use crate::config::BrokerConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wgmesh_common::{crypto, BrokerType, Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Broker login handed to a host in its `ServerConfig`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerCredentials {
    pub username: String,
    pub password: String,
}

/// A publish-only broker connection
#[async_trait]
pub trait Broker: Send + Sync {
    /// Establish (or re-establish) the connection
    async fn connect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Credentials a new host uses to subscribe to its topics
    async fn provision_host(&self, host_id: Uuid) -> Result<BrokerCredentials>;

    /// Undo `provision_host`
    async fn revoke_host(&self, host_id: Uuid) -> Result<()>;

    async fn disconnect(&self) {}
}

// ============================================================================
// MQTT
// ============================================================================

/// MQTT client; EMQX brokers additionally get per-host users and ACLs over REST
pub struct MqttBroker {
    config: BrokerConfig,
    client_id: String,
    client: Mutex<Option<AsyncClient>>,
    connected: Arc<AtomicBool>,
    http: reqwest::Client,
}

impl MqttBroker {
    pub fn new(config: BrokerConfig, server_name: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client_id: format!("{}-{}", server_name, crypto::random_string(6)),
            config,
            client: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            http,
        })
    }

    fn emqx_endpoint(&self) -> Result<&str> {
        self.config
            .emqx_rest_endpoint
            .as_deref()
            .map(|e| e.trim_end_matches('/'))
            .ok_or_else(|| Error::Broker("EMQX_REST_ENDPOINT is not set".to_string()))
    }

    async fn emqx_request(&self, request: reqwest::RequestBuilder) -> Result<()> {
        let response = request
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await
            .map_err(|e| Error::Broker(format!("EMQX request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::CONFLICT {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::Broker(format!("EMQX returned {}: {}", status, body)))
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn connect(&self) -> Result<()> {
        let (host, port) = self.config.host_port();
        let mut options = MqttOptions::new(&self.client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        if !self.config.username.is_empty() {
            options.set_credentials(&self.config.username, &self.config.password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        // wait for the broker to accept us before reporting Connected
        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(Error::Broker(format!("MQTT connect failed: {}", e))),
                }
            }
        };
        tokio::time::timeout(CONNECT_TIMEOUT, handshake)
            .await
            .map_err(|_| Error::Timeout {
                seconds: CONNECT_TIMEOUT.as_secs(),
            })??;

        self.connected.store(true, Ordering::Release);
        let connected = self.connected.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = eventloop.poll().await {
                    warn!("MQTT connection lost: {}", e);
                    connected.store(false, Ordering::Release);
                    break;
                }
            }
        });

        *self.client.lock() = Some(client);

        info!("Connected to MQTT broker {}", self.config.endpoint);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let client = self
            .client
            .lock()
            .clone()
            .ok_or_else(|| Error::Broker("not connected".to_string()))?;

        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| Error::Broker(format!("publish to {} failed: {}", topic, e)))
    }

    async fn provision_host(&self, host_id: Uuid) -> Result<BrokerCredentials> {
        if self.config.broker_type != BrokerType::Emqx {
            return Ok(BrokerCredentials {
                username: self.config.username.clone(),
                password: self.config.password.clone(),
            });
        }

        let base = self.emqx_endpoint()?;
        let credentials = BrokerCredentials {
            username: host_id.to_string(),
            password: crypto::random_string(30),
        };

        self.emqx_request(
            self.http
                .post(format!(
                    "{}/api/v5/authentication/password_based:built_in_database/users",
                    base
                ))
                .json(&json!({
                    "user_id": credentials.username,
                    "password": credentials.password,
                    "is_superuser": false,
                })),
        )
        .await?;

        self.emqx_request(
            self.http
                .post(format!(
                    "{}/api/v5/authorization/sources/built_in_database/rules/users",
                    base
                ))
                .json(&json!([{
                    "username": credentials.username,
                    "rules": [
                        {
                            "action": "subscribe",
                            "permission": "allow",
                            "topic": format!("peers/host/{}/#", host_id),
                        },
                        {
                            "action": "subscribe",
                            "permission": "allow",
                            "topic": format!("host/update/{}/#", host_id),
                        },
                        {
                            "action": "subscribe",
                            "permission": "allow",
                            "topic": "host/serverupdate/#",
                        },
                        { "action": "all", "permission": "deny", "topic": "#" },
                    ],
                }])),
        )
        .await?;

        debug!("Provisioned EMQX user for host {}", host_id);
        Ok(credentials)
    }

    async fn revoke_host(&self, host_id: Uuid) -> Result<()> {
        if self.config.broker_type != BrokerType::Emqx {
            return Ok(());
        }

        let base = self.emqx_endpoint()?;
        self.emqx_request(self.http.delete(format!(
            "{}/api/v5/authentication/password_based:built_in_database/users/{}",
            base, host_id
        )))
        .await?;
        self.emqx_request(self.http.delete(format!(
            "{}/api/v5/authorization/sources/built_in_database/rules/users/{}",
            base, host_id
        )))
        .await?;

        debug!("Revoked EMQX user for host {}", host_id);
        Ok(())
    }

    async fn disconnect(&self) {
        let client = self.client.lock().take();
        if let Some(client) = client {
            if let Err(e) = client.disconnect().await {
                debug!("MQTT disconnect: {}", e);
            }
        }
        self.connected.store(false, Ordering::Release);
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Message captured by [`MemoryBroker`]
#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Broker that records publishes in memory, for tests and embedded harnesses
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    connected: AtomicBool,
    /// Connect attempts left to fail
    failing_connects: AtomicU32,
    connects: AtomicU32,
    messages: Mutex<Vec<Published>>,
    provisioned: Mutex<Vec<Uuid>>,
    feed: broadcast::Sender<Published>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(MemoryInner {
                connected: AtomicBool::new(false),
                failing_connects: AtomicU32::new(0),
                connects: AtomicU32::new(0),
                messages: Mutex::new(Vec::new()),
                provisioned: Mutex::new(Vec::new()),
                feed,
            }),
        }
    }

    /// Live feed of every publish
    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.inner.feed.subscribe()
    }

    pub fn messages(&self) -> Vec<Published> {
        self.inner.messages.lock().clone()
    }

    pub fn messages_on(&self, topic: &str) -> Vec<Published> {
        self.inner
            .messages
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.inner.messages.lock().clear();
    }

    /// Simulate a dropped connection
    pub fn drop_connection(&self) {
        self.inner.connected.store(false, Ordering::Release);
    }

    /// Make the next `n` connect attempts fail
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.failing_connects.store(n, Ordering::Release);
    }

    pub fn connect_count(&self) -> u32 {
        self.inner.connects.load(Ordering::Acquire)
    }

    pub fn provisioned(&self) -> Vec<Uuid> {
        self.inner.provisioned.lock().clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<()> {
        self.inner.connects.fetch_add(1, Ordering::AcqRel);
        let failing = self.inner.failing_connects.load(Ordering::Acquire);
        if failing > 0 {
            self.inner
                .failing_connects
                .store(failing - 1, Ordering::Release);
            return Err(Error::Broker("connection refused".to_string()));
        }
        self.inner.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Broker("not connected".to_string()));
        }
        let message = Published {
            topic: topic.to_string(),
            payload,
        };
        self.inner.messages.lock().push(message.clone());
        // no receivers is fine
        let _ = self.inner.feed.send(message);
        Ok(())
    }

    async fn provision_host(&self, host_id: Uuid) -> Result<BrokerCredentials> {
        self.inner.provisioned.lock().push(host_id);
        Ok(BrokerCredentials {
            username: host_id.to_string(),
            password: crypto::random_string(16),
        })
    }

    async fn revoke_host(&self, host_id: Uuid) -> Result<()> {
        self.inner.provisioned.lock().retain(|id| *id != host_id);
        Ok(())
    }

    async fn disconnect(&self) {
        self.drop_connection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_memory_broker_records() {
        let broker = MemoryBroker::new();
        assert!(broker.publish("t", b"x".to_vec()).await.is_err());

        broker.fail_next_connects(1);
        assert!(broker.connect().await.is_err());
        broker.connect().await.unwrap();
        assert_eq!(broker.connect_count(), 2);

        let mut feed = broker.subscribe();
        broker.publish("a/b", b"hello".to_vec()).await.unwrap();
        assert_eq!(broker.messages_on("a/b").len(), 1);
        assert_eq!(feed.recv().await.unwrap().payload, b"hello");
    }

    #[tokio::test]
    async fn test_mq_provision_uses_shared_login() {
        let config = BrokerConfig {
            username: "server".into(),
            password: "pw".into(),
            ..Default::default()
        };
        let broker = MqttBroker::new(config, "mesh").unwrap();
        let creds = broker.provision_host(Uuid::new_v4()).await.unwrap();
        assert_eq!(creds.username, "server");
        assert_eq!(creds.password, "pw");
    }

    #[tokio::test]
    async fn test_emqx_provision_and_revoke() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(
                "/api/v5/authentication/password_based:built_in_database/users",
            ))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(
                "/api/v5/authorization/sources/built_in_database/rules/users",
            ))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .expect(2)
            .mount(&server)
            .await;

        let config = BrokerConfig {
            broker_type: BrokerType::Emqx,
            emqx_rest_endpoint: Some(server.uri()),
            ..Default::default()
        };
        let broker = MqttBroker::new(config, "mesh").unwrap();
        let host_id = Uuid::new_v4();

        let creds = broker.provision_host(host_id).await.unwrap();
        assert_eq!(creds.username, host_id.to_string());
        assert_eq!(creds.password.len(), 30);

        broker.revoke_host(host_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_emqx_error_is_broker_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let config = BrokerConfig {
            broker_type: BrokerType::Emqx,
            emqx_rest_endpoint: Some(server.uri()),
            ..Default::default()
        };
        let broker = MqttBroker::new(config, "mesh").unwrap();
        let err = broker.provision_host(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::Broker(_)));
    }
}
