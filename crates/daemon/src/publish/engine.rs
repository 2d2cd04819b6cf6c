//! Single-writer publish loop

use super::broker::Broker;
use super::queue::EventQueue;
use super::{topics, PublishEvent};
use crate::config::PublishConfig;
use crate::state::StateManager;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wgmesh_common::{
    crypto::{sha256_hex, SignedEnvelope},
    peers, Error, HostUpdate, Result, ServerUpdate, Snapshot, VERSION,
};

/// Broker connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Cheap handle handlers use to enqueue work
#[derive(Clone)]
pub struct Publisher {
    queue: Arc<EventQueue>,
    state: watch::Receiver<ConnectionState>,
}

impl Publisher {
    pub fn publish(&self, event: PublishEvent) {
        debug!("Queued {:?}", event);
        self.queue.push(event);
    }

    pub fn peer_update(&self, network: &str) {
        self.publish(PublishEvent::PeerUpdate {
            network: Some(network.to_string()),
            force: false,
        });
    }

    pub fn full_refresh(&self) {
        self.publish(PublishEvent::full_refresh());
    }

    pub fn host_update(&self, host_id: Uuid, update: HostUpdate) {
        self.publish(PublishEvent::HostUpdate { host_id, update });
    }

    pub fn ext_peer_update(&self, ingress: Uuid) {
        self.publish(PublishEvent::ExtPeerUpdate { ingress });
    }

    pub fn single_host(&self, host_id: Uuid, force: bool) {
        self.publish(PublishEvent::SingleHostPeerUpdate { host_id, force });
    }

    pub fn server_update(&self, update: ServerUpdate) {
        self.publish(PublishEvent::ServerUpdate(update));
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

/// Drains the event queue into the broker
pub struct PublishEngine {
    state: StateManager,
    broker: Arc<dyn Broker>,
    queue: Arc<EventQueue>,
    config: PublishConfig,
    connection: watch::Sender<ConnectionState>,
    /// Digest of the last payload sent per topic
    last_sent: HashMap<String, String>,
}

impl PublishEngine {
    pub fn new(state: StateManager, broker: Arc<dyn Broker>) -> (Self, Publisher) {
        let config = state.config().publish.clone();
        let queue = Arc::new(EventQueue::new(config.queue_capacity));
        let (connection, watcher) = watch::channel(ConnectionState::Disconnected);

        let publisher = Publisher {
            queue: queue.clone(),
            state: watcher,
        };
        let engine = Self {
            state,
            broker,
            queue,
            config,
            connection,
            last_sent: HashMap::new(),
        };
        (engine, publisher)
    }

    /// Run until `shutdown` fires, then flush what fits in the grace period
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Publish engine started");

        let queue = self.queue.clone();
        loop {
            if !self.broker.is_connected() && !self.reconnect(&shutdown).await {
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = queue.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }

        self.drain().await;
        self.broker.disconnect().await;
        self.set_state(ConnectionState::Disconnected);
        info!("Publish engine stopped");
    }

    fn set_state(&self, state: ConnectionState) {
        self.connection.send_replace(state);
    }

    /// Reconnect with full-jitter exponential backoff. `false` means shutdown won.
    async fn reconnect(&mut self, shutdown: &CancellationToken) -> bool {
        self.set_state(ConnectionState::Connecting);

        let mut attempt = 0u32;
        loop {
            match self.broker.connect().await {
                Ok(()) => break,
                Err(e) => {
                    let delay = backoff_delay(
                        attempt,
                        Duration::from_millis(self.config.backoff_base_ms),
                        Duration::from_millis(self.config.backoff_cap_ms),
                    );
                    warn!(
                        "Broker connect attempt {} failed: {}; retrying in {:?}",
                        attempt + 1,
                        e,
                        delay
                    );
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            self.set_state(ConnectionState::Disconnected);
                            return false;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        // anything computed before the outage is stale; one refresh replaces it
        let superseded = self.queue.retain(PublishEvent::survives_refresh);
        self.queue.push_front(PublishEvent::full_refresh());
        self.last_sent.clear();
        self.set_state(ConnectionState::Connected);

        info!(
            "Broker connected; queued full refresh ({} superseded event(s))",
            superseded
        );
        true
    }

    async fn drain(&mut self) {
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace();
        self.queue.close();

        while let Some(event) = self.queue.pop() {
            if !self.broker.is_connected() {
                warn!("Broker down at shutdown, {} event(s) not sent", self.queue.len() + 1);
                return;
            }
            if tokio::time::timeout_at(deadline, self.handle(event))
                .await
                .is_err()
            {
                warn!(
                    "Shutdown grace period elapsed, {} event(s) not sent",
                    self.queue.len()
                );
                return;
            }
        }
    }

    async fn handle(&mut self, event: PublishEvent) {
        let server = self.state.config().server_name.clone();

        match event {
            PublishEvent::HostUpdate { host_id, update } => {
                let topic = topics::host_update(host_id, &server);
                if let Err(e) = self.send(&topic, &update).await {
                    warn!("Failed to send {:?} to host {}: {}", update.action, host_id, e);
                    self.requeue_if_disconnected(PublishEvent::HostUpdate { host_id, update });
                }
            }
            PublishEvent::ServerUpdate(update) => {
                let topic = topics::server_update(&server);
                if let Err(e) = self.send(&topic, &update).await {
                    warn!("Failed to send server update: {}", e);
                    self.requeue_if_disconnected(PublishEvent::ServerUpdate(update));
                }
            }
            PublishEvent::PeerUpdate { network, force } => {
                let Some(snapshot) = self.snapshot() else {
                    return;
                };
                let hosts: Vec<Uuid> = match &network {
                    Some(network) => snapshot.hosts_in(network).into_iter().collect(),
                    None => snapshot.hosts.keys().copied().collect(),
                };
                debug!(
                    "Peer update for {} ({} host(s))",
                    network.as_deref().unwrap_or("all networks"),
                    hosts.len()
                );
                for host_id in hosts {
                    if !self.broker.is_connected() {
                        // the reconnect refresh covers the rest
                        break;
                    }
                    self.publish_host(&snapshot, host_id, force).await;
                }
            }
            PublishEvent::SingleHostPeerUpdate { host_id, force } => {
                if let Some(snapshot) = self.snapshot() {
                    self.publish_host(&snapshot, host_id, force).await;
                }
            }
            PublishEvent::ExtPeerUpdate { ingress } => {
                let Some(snapshot) = self.snapshot() else {
                    return;
                };
                match peers::ext_peer_update(&snapshot, ingress, &server, VERSION) {
                    Some(update) => {
                        let topic = topics::peers(update.host_id, &server);
                        if let Err(e) = self.send(&topic, &update).await {
                            warn!("Failed to send ext-peers of ingress {}: {}", ingress, e);
                        }
                    }
                    None => debug!("Ingress {} is gone, skipping ext-peer update", ingress),
                }
            }
        }
    }

    /// Host actions are not covered by the reconnect refresh, so they wait for it
    fn requeue_if_disconnected(&self, event: PublishEvent) {
        if !self.broker.is_connected() && !self.queue.is_closed() {
            self.queue.push_front(event);
        }
    }

    fn snapshot(&self) -> Option<Snapshot> {
        match self.state.snapshot() {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                error!("Failed to snapshot registry for publish: {}", e);
                None
            }
        }
    }

    /// Publish one host's merged peer view unless it is unchanged
    async fn publish_host(&mut self, snapshot: &Snapshot, host_id: Uuid, force: bool) {
        if !snapshot.hosts.contains_key(&host_id) {
            debug!("Host {} is gone, skipping peer update", host_id);
            return;
        }

        let server = self.state.config().server_name.clone();
        let update = peers::host_peer_update(snapshot, host_id, &server, VERSION);
        let topic = topics::peers(host_id, &server);

        let digest = match serde_json::to_vec(&update) {
            Ok(body) => sha256_hex(&body),
            Err(e) => {
                error!("Failed to encode peer update for {}: {}", host_id, e);
                return;
            }
        };
        if !force && self.last_sent.get(&topic) == Some(&digest) {
            debug!("Peer view of host {} unchanged", host_id);
            return;
        }

        match self.send(&topic, &update).await {
            Ok(()) => {
                self.last_sent.insert(topic, digest);
            }
            Err(e) => warn!("Failed to publish peers to host {}: {}", host_id, e),
        }
    }

    /// Seal and publish with a per-attempt timeout
    async fn send<T: serde::Serialize>(&self, topic: &str, payload: &T) -> Result<()> {
        let envelope = SignedEnvelope::seal(payload, self.state.key_pair())?;
        let bytes = serde_json::to_vec(&envelope)?;
        let timeout = self.config.publish_timeout();

        let mut last_error = Error::Broker("no publish attempts".to_string());
        for attempt in 0..self.config.publish_attempts.max(1) {
            match tokio::time::timeout(timeout, self.broker.publish(topic, bytes.clone())).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => last_error = e,
                Err(_) => {
                    last_error = Error::Timeout {
                        seconds: timeout.as_secs(),
                    }
                }
            }
            if !self.broker.is_connected() {
                break;
            }
            debug!("Publish to {} failed (attempt {}), retrying", topic, attempt + 1);
            tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt + 1))).await;
        }
        Err(last_error)
    }
}

/// Full-jitter backoff: uniform in `[0, min(cap, base * 2^attempt)]`
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let ceiling = backoff_ceiling(attempt, base, cap);
    let millis = ceiling.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

fn backoff_ceiling(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}
