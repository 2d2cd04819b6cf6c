//! Host lifecycle: joining networks, removal cascades and the client update channel

use crate::actions::HostActions;
use crate::failover::FailoverController;
use crate::publish::{Broker, Publisher};
use crate::state::StateManager;
use crate::topology::{IngressRequest, Topology};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wgmesh_common::{Error, Host, HostAction, HostUpdate, Node, Result, User};

/// Fields an admin or the owning host may change on a node
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeUpdate {
    #[serde(default)]
    pub persistent_keepalive: Option<u16>,
    #[serde(default)]
    pub post_up: Option<String>,
    #[serde(default)]
    pub post_down: Option<String>,
    #[serde(default)]
    pub connected: Option<bool>,
}

#[derive(Clone)]
pub struct HostManager {
    state: StateManager,
    publisher: Publisher,
    broker: Arc<dyn Broker>,
    actions: HostActions,
    topology: Topology,
    failover: FailoverController,
}

impl HostManager {
    pub fn new(
        state: StateManager,
        publisher: Publisher,
        broker: Arc<dyn Broker>,
        actions: HostActions,
        topology: Topology,
        failover: FailoverController,
    ) -> Self {
        Self {
            state,
            publisher,
            broker,
            actions,
            topology,
            failover,
        }
    }

    pub fn actions(&self) -> &HostActions {
        &self.actions
    }

    /// Networks a registration asks for: every network, or the named one
    pub fn requested_networks(&self, network: &str, join_all: bool) -> Result<Vec<String>> {
        if join_all {
            return Ok(self
                .state
                .list_networks()?
                .into_iter()
                .map(|n| n.id)
                .collect());
        }
        if network.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![network.to_string()])
    }

    /// Add a host to each network, skipping the ones `user` may not join.
    ///
    /// Per-network failures are logged and skipped so one bad network does not block
    /// the rest.
    pub fn join_networks(
        &self,
        host_id: Uuid,
        networks: &[String],
        user: Option<&User>,
    ) -> Vec<Node> {
        let mut joined = Vec::new();
        for network in networks {
            if let Some(user) = user {
                if !user.can_access(network) {
                    warn!(
                        "User {} may not add hosts to {}, skipping",
                        user.username, network
                    );
                    continue;
                }
            }
            match self.join_network(host_id, network) {
                Ok(node) => joined.push(node),
                Err(e) => warn!("Host {} could not join {}: {}", host_id, network, e),
            }
        }
        joined
    }

    /// Create (or reuse) the host's node in `network` and tell the host about it
    pub fn join_network(&self, host_id: Uuid, network: &str) -> Result<Node> {
        let (mut node, created) = self.state.add_host_to_network(host_id, network)?;
        if !created {
            debug!("Host {} is already a member of {}", host_id, network);
            return Ok(node);
        }

        let host = self.state.get_host(host_id)?;
        if host.is_default {
            node = self.topology.create_ingress(node.id, IngressRequest::default())?;
            self.failover.elect_failover(network)?;
            node = self.state.get_node(node.id)?;
        }

        let update = HostUpdate::new(HostAction::JoinHostToNetwork)
            .with_host(host)
            .with_node(node.clone());
        self.actions.push(host_id, update.clone());
        self.publisher.host_update(host_id, update);
        self.publisher.peer_update(network);
        self.failover.on_topology_change(network, false)?;
        Ok(node)
    }

    /// Take the host out of one network
    pub fn leave_network(&self, host_id: Uuid, network: &str) -> Result<Node> {
        let node = self
            .state
            .nodes_of_host(host_id)?
            .into_iter()
            .find(|n| n.network == network)
            .ok_or_else(|| Error::not_found("node", format!("{}.{}", network, host_id)))?;
        let removal = self.state.remove_node(node.id)?;

        let host = self.state.get_host(host_id)?;
        self.publisher
            .host_update(host_id, HostUpdate::new(HostAction::UpdateHost).with_host(host));
        self.publisher.peer_update(network);
        self.publisher.single_host(host_id, true);
        self.failover
            .on_topology_change(network, removal.node.is_failover)?;
        Ok(removal.node)
    }

    /// Delete a host, every node it owns, and its broker login
    pub async fn remove_host(&self, host_id: Uuid) -> Result<Host> {
        let (host, removals) = self.state.remove_host(host_id)?;

        self.publisher
            .host_update(host_id, HostUpdate::new(HostAction::DeleteHost).with_host(host.clone()));
        for removal in &removals {
            self.publisher.peer_update(&removal.node.network);
            if let Err(e) = self
                .failover
                .on_topology_change(&removal.node.network, removal.node.is_failover)
            {
                warn!("Failover re-election in {} failed: {}", removal.node.network, e);
            }
        }
        self.actions.forget(host_id);

        if let Err(e) = self.broker.revoke_host(host_id).await {
            warn!("Could not revoke broker login of {}: {}", host_id, e);
        }
        info!("Host {} ({}) removed", host.name, host_id);
        Ok(host)
    }

    /// Apply a node update, dropping hook scripts unless RCE is enabled
    pub fn update_node(&self, node_id: Uuid, update: NodeUpdate) -> Result<Node> {
        let rce = self.state.config().features.rce;
        if !rce && (update.post_up.is_some() || update.post_down.is_some()) {
            debug!("Ignoring post_up/post_down on node {} (RCE disabled)", node_id);
        }

        let node = self.state.update_node(node_id, |node| {
            if let Some(keepalive) = update.persistent_keepalive {
                node.persistent_keepalive = Some(keepalive);
            }
            if let Some(connected) = update.connected {
                node.connected = connected;
            }
            if rce {
                if let Some(post_up) = update.post_up {
                    node.post_up = post_up;
                }
                if let Some(post_down) = update.post_down {
                    node.post_down = post_down;
                }
            } else {
                node.post_up.clear();
                node.post_down.clear();
            }
            Ok(())
        })?;
        self.publisher.peer_update(&node.network);
        Ok(node)
    }

    /// Handle one message from a host on the update channel.
    ///
    /// Returns the actions to hand back to the host, if any.
    pub fn handle_client_update(
        &self,
        host_id: Uuid,
        update: HostUpdate,
    ) -> Result<Vec<HostUpdate>> {
        match update.action {
            HostAction::CheckIn => {
                self.check_in(host_id)?;
                Ok(Vec::new())
            }
            HostAction::UpdateHost => {
                let reported = update
                    .host
                    .ok_or_else(|| Error::validation("UPDATE_HOST without a host"))?;
                self.refresh_host(host_id, reported)?;
                Ok(Vec::new())
            }
            HostAction::SignalHost => {
                let signal = update
                    .signal
                    .ok_or_else(|| Error::validation("SIGNAL_HOST without a signal"))?;
                match (signal.failover_peer, signal.from_node_id, signal.to_node_id) {
                    (true, Some(from), Some(to)) => {
                        let victim = self.state.get_node(from)?;
                        if victim.host_id != host_id {
                            return Err(Error::PermissionDenied(format!(
                                "node {} does not belong to host {}",
                                from, host_id
                            )));
                        }
                        self.failover.failover_peer(from, to)?;
                    }
                    _ => debug!("Ignoring signal from host {}", host_id),
                }
                Ok(Vec::new())
            }
            HostAction::RequestPull => {
                self.publisher.single_host(host_id, true);
                Ok(self.actions.drain(host_id))
            }
            HostAction::Ack | HostAction::RequestAck => Ok(self.actions.drain(host_id)),
            other => Err(Error::validation(format!(
                "hosts may not send {:?}",
                other
            ))),
        }
    }

    fn check_in(&self, host_id: Uuid) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        for node in self.state.nodes_of_host(host_id)? {
            self.state.update_node(node.id, |node| {
                node.last_check_in = now;
                node.connected = true;
                Ok(())
            })?;
        }
        debug!("Host {} checked in", host_id);
        Ok(())
    }

    /// Take the endpoint, port and key a host reports, then republish its networks
    fn refresh_host(&self, host_id: Uuid, reported: Host) -> Result<Host> {
        let before = self.state.get_host(host_id)?;
        let host = self.state.update_host(host_id, |host| {
            if !reported.name.is_empty() {
                host.name = reported.name;
            }
            if !reported.public_key.is_empty() {
                host.public_key = reported.public_key;
            }
            if reported.listen_port != 0 {
                host.listen_port = reported.listen_port;
            }
            host.endpoint_ip = reported.endpoint_ip.or(host.endpoint_ip);
            host.endpoint_ipv6 = reported.endpoint_ipv6.or(host.endpoint_ipv6);
            host.version = reported.version;
            host.mtu = reported.mtu.or(host.mtu);
            host.persistent_keepalive = reported.persistent_keepalive.or(host.persistent_keepalive);
            Ok(())
        })?;

        let changed = before.public_key != host.public_key
            || before.endpoint() != host.endpoint()
            || before.endpoint_ipv6 != host.endpoint_ipv6;
        if changed {
            info!("Host {} changed its endpoint or key", host_id);
            for node in self.state.nodes_of_host(host_id)? {
                self.publisher.peer_update(&node.network);
            }
        }
        Ok(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::publish::{MemoryBroker, PublishEngine};
    use crate::state::tests::host_with_endpoint;
    use wgmesh_common::{AuthSource, Network, Signal};

    struct Fixture {
        state: StateManager,
        hosts: HostManager,
        broker: Arc<MemoryBroker>,
    }

    fn fixture(config: DaemonConfig) -> Fixture {
        let state = StateManager::in_memory(config).unwrap();
        for (id, cidr) in [("skynet", "10.0.0.0/24"), ("lab", "10.1.0.0/24")] {
            state
                .create_network(Network::new(id, cidr.parse().unwrap()))
                .unwrap();
        }
        let broker = Arc::new(MemoryBroker::new());
        let (_engine, publisher) = PublishEngine::new(state.clone(), broker.clone());
        let failover = FailoverController::new(state.clone(), publisher.clone());
        let topology = Topology::new(state.clone(), publisher.clone(), failover.clone());
        let hosts = HostManager::new(
            state.clone(),
            publisher,
            broker.clone(),
            HostActions::new(),
            topology,
            failover,
        );
        Fixture { state, hosts, broker }
    }

    fn user(networks: &[&str]) -> User {
        User {
            username: "alice".into(),
            password: String::new(),
            is_admin: false,
            is_superadmin: false,
            networks: networks.iter().map(|n| n.to_string()).collect(),
            auth_source: AuthSource::Oauth,
            created_at: 0,
        }
    }

    #[test]
    fn test_requested_networks() {
        let f = fixture(DaemonConfig::default());
        let mut all = f.hosts.requested_networks("", true).unwrap();
        all.sort();
        assert_eq!(all, vec!["lab".to_string(), "skynet".to_string()]);
        assert_eq!(f.hosts.requested_networks("lab", false).unwrap(), vec!["lab".to_string()]);
        assert!(f.hosts.requested_networks("", false).unwrap().is_empty());
    }

    #[test]
    fn test_join_enforces_user_networks() {
        let f = fixture(DaemonConfig::default());
        let host = host_with_endpoint(&f.state, "h1", 1);
        let networks = vec!["skynet".to_string(), "lab".to_string()];

        let joined = f.hosts.join_networks(host.id, &networks, Some(&user(&["lab"])));
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].network, "lab");

        let actions = f.hosts.actions().drain(host.id);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action, HostAction::JoinHostToNetwork);
        assert_eq!(actions[0].node.as_ref().map(|n| n.id), Some(joined[0].id));
    }

    #[test]
    fn test_join_is_idempotent() {
        let f = fixture(DaemonConfig::default());
        let host = host_with_endpoint(&f.state, "h1", 1);
        let first = f.hosts.join_network(host.id, "skynet").unwrap();
        let second = f.hosts.join_network(host.id, "skynet").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(f.hosts.actions().pending(host.id), 1);
    }

    #[test]
    fn test_default_host_becomes_ingress_and_failover() {
        let f = fixture(DaemonConfig::default());
        let mut host = Host::new("gw");
        host.is_default = true;
        let host = f.state.create_host(host).unwrap();

        let node = f.hosts.join_network(host.id, "skynet").unwrap();
        assert!(node.is_ingress);
        assert!(node.is_failover);
    }

    #[tokio::test]
    async fn test_remove_host_cascade() {
        let f = fixture(DaemonConfig::default());
        let host = host_with_endpoint(&f.state, "h1", 1);
        let other = host_with_endpoint(&f.state, "h2", 2);
        f.hosts.join_network(host.id, "skynet").unwrap();
        f.hosts.join_network(host.id, "lab").unwrap();
        f.hosts.join_network(other.id, "skynet").unwrap();
        f.broker.provision_host(host.id).await.unwrap();

        let removed = f.hosts.remove_host(host.id).await.unwrap();
        assert_eq!(removed.id, host.id);
        assert!(f.state.get_host(host.id).is_err());
        assert!(f.state.nodes_of_host(host.id).unwrap().is_empty());
        assert_eq!(f.state.nodes_in("skynet").unwrap().len(), 1);
        assert_eq!(f.hosts.actions().pending(host.id), 0);
        assert!(!f.broker.provisioned().contains(&host.id));
    }

    #[test]
    fn test_leave_network() {
        let f = fixture(DaemonConfig::default());
        let host = host_with_endpoint(&f.state, "h1", 1);
        f.hosts.join_network(host.id, "skynet").unwrap();
        f.hosts.join_network(host.id, "lab").unwrap();

        f.hosts.leave_network(host.id, "lab").unwrap();
        let nodes = f.state.nodes_of_host(host.id).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].network, "skynet");
        assert!(matches!(
            f.hosts.leave_network(host.id, "lab"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_rce_gate() {
        let f = fixture(DaemonConfig::default());
        let host = host_with_endpoint(&f.state, "h1", 1);
        let node = f.hosts.join_network(host.id, "skynet").unwrap();

        let update = NodeUpdate {
            persistent_keepalive: Some(15),
            post_up: Some("iptables -A FORWARD -j ACCEPT".into()),
            ..Default::default()
        };
        let node = f.hosts.update_node(node.id, update.clone()).unwrap();
        assert_eq!(node.persistent_keepalive, Some(15));
        assert!(node.post_up.is_empty());

        let mut config = DaemonConfig::default();
        config.features.rce = true;
        let f = fixture(config);
        let host = host_with_endpoint(&f.state, "h1", 1);
        let node = f.hosts.join_network(host.id, "skynet").unwrap();
        let node = f.hosts.update_node(node.id, update).unwrap();
        assert_eq!(node.post_up, "iptables -A FORWARD -j ACCEPT");
    }

    #[test]
    fn test_client_update_channel() {
        let f = fixture(DaemonConfig::default());
        let host = host_with_endpoint(&f.state, "h1", 1);
        f.hosts.join_network(host.id, "skynet").unwrap();

        f.hosts
            .handle_client_update(host.id, HostUpdate::new(HostAction::CheckIn))
            .unwrap();
        let node = &f.state.nodes_of_host(host.id).unwrap()[0];
        assert!(node.connected);
        assert!(node.last_check_in > 0);

        let mut reported = host.clone();
        reported.listen_port = 51999;
        f.hosts
            .handle_client_update(
                host.id,
                HostUpdate::new(HostAction::UpdateHost).with_host(reported),
            )
            .unwrap();
        assert_eq!(f.state.get_host(host.id).unwrap().listen_port, 51999);

        let pulled = f
            .hosts
            .handle_client_update(host.id, HostUpdate::new(HostAction::RequestPull))
            .unwrap();
        assert_eq!(pulled.len(), 1);
        assert!(f
            .hosts
            .handle_client_update(host.id, HostUpdate::new(HostAction::Ack))
            .unwrap()
            .is_empty());

        assert!(matches!(
            f.hosts
                .handle_client_update(host.id, HostUpdate::new(HostAction::DeleteHost)),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_failover_signal() {
        let f = fixture(DaemonConfig::default());
        let a = host_with_endpoint(&f.state, "a", 1);
        let b = host_with_endpoint(&f.state, "b", 2);
        let c = host_with_endpoint(&f.state, "c", 3);
        let na = f.hosts.join_network(a.id, "skynet").unwrap();
        let nb = f.hosts.join_network(b.id, "skynet").unwrap();
        let nc = f.hosts.join_network(c.id, "skynet").unwrap();
        f.hosts.failover.create_failover(nc.id).unwrap();

        let mut signal = HostUpdate::new(HostAction::SignalHost);
        signal.signal = Some(Signal {
            from_node_id: Some(na.id),
            to_node_id: Some(nb.id),
            failover_peer: true,
        });

        assert!(matches!(
            f.hosts.handle_client_update(b.id, signal.clone()),
            Err(Error::PermissionDenied(_))
        ));
        f.hosts.handle_client_update(a.id, signal).unwrap();
        let na = f.state.get_node(na.id).unwrap();
        assert!(na.failover_peers.contains(&nb.id));
    }
}
