//! Failover controller
//!
//! A network has at most one failover node. Hosts that cannot reach a peer directly
//! signal it, and both ends then route that pair through the failover node.

use crate::publish::Publisher;
use crate::state::{RegistryTx, StateManager};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;
use wgmesh_common::{db::Batch, Error, Host, Node, Result};

/// Whether `node` may act as its network's failover
pub fn is_eligible(node: &Node, host: &Host) -> bool {
    host.is_linux() && !node.is_relayed && !node.is_pending
}

/// Keep the current failover while it stays eligible, otherwise pick the eligible
/// node with the lowest host id.
pub fn elect(nodes: &[Node], hosts: &HashMap<Uuid, Host>) -> Option<Uuid> {
    let eligible = |node: &&Node| {
        hosts
            .get(&node.host_id)
            .map(|host| is_eligible(node, host))
            .unwrap_or(false)
    };

    if let Some(current) = nodes.iter().filter(eligible).find(|n| n.is_failover) {
        return Some(current.id);
    }
    nodes
        .iter()
        .filter(eligible)
        .min_by_key(|n| (n.host_id, n.id))
        .map(|n| n.id)
}

#[derive(Clone)]
pub struct FailoverController {
    state: StateManager,
    publisher: Publisher,
}

impl FailoverController {
    pub fn new(state: StateManager, publisher: Publisher) -> Self {
        Self { state, publisher }
    }

    /// Confirm or replace the network's failover node, storing the decision
    pub fn elect_failover(&self, network: &str) -> Result<Option<Uuid>> {
        let (chosen, changed) = self
            .state
            .db()
            .batch(|tx| elect_in(tx, network, true))?;
        if changed {
            info!("Failover of {} is now {:?}", network, chosen);
            self.publisher.peer_update(network);
        }
        Ok(chosen)
    }

    /// Re-run the election after a node, relay or gateway change.
    ///
    /// Networks without a failover stay without one unless `lost_failover` says the
    /// previous one was just removed.
    pub fn on_topology_change(&self, network: &str, lost_failover: bool) -> Result<()> {
        let (chosen, changed) = self
            .state
            .db()
            .batch(|tx| elect_in(tx, network, lost_failover))?;
        if changed {
            info!("Failover of {} re-elected: {:?}", network, chosen);
            self.publisher.peer_update(network);
        }
        Ok(())
    }

    /// Make `node_id` its network's failover
    pub fn create_failover(&self, node_id: Uuid) -> Result<Node> {
        let node = self.state.db().batch(|tx| {
            let mut node = tx.node(node_id)?;
            let host = tx.host(node.host_id)?;
            if !host.is_linux() {
                return Err(Error::validation("failover nodes must run Linux"));
            }
            if node.is_relayed {
                return Err(Error::conflict("a relayed node cannot be a failover"));
            }
            if node.is_pending {
                return Err(Error::validation("node is still pending"));
            }
            if node.is_failover {
                return Ok(node);
            }
            if let Some(existing) = tx.nodes_in(&node.network)?.iter().find(|n| n.is_failover) {
                return Err(Error::conflict(format!(
                    "network {} already has failover node {}",
                    node.network, existing.id
                )));
            }

            node.is_failover = true;
            tx.save_node(&mut node)?;
            Ok(node)
        })?;

        info!("Node {} is the failover of {}", node.id, node.network);
        self.publisher.peer_update(&node.network);
        Ok(node)
    }

    pub fn delete_failover(&self, node_id: Uuid) -> Result<Node> {
        let node = self.state.db().batch(|tx| {
            let mut node = tx.node(node_id)?;
            if !node.is_failover {
                return Err(Error::validation(format!("node {} is not a failover", node_id)));
            }
            node.is_failover = false;
            tx.save_node(&mut node)?;
            clear_marks(tx, &node.network)?;
            Ok(node)
        })?;

        info!("Removed failover {} from {}", node.id, node.network);
        self.publisher.peer_update(&node.network);
        Ok(node)
    }

    /// Clear every failed-over pair in the network
    pub fn reset_failover(&self, network: &str) -> Result<usize> {
        let cleared = self.state.db().batch(|tx| {
            tx.network(network)?;
            clear_marks(tx, network)
        })?;
        if cleared > 0 {
            debug!("Reset failover marks on {} node(s) in {}", cleared, network);
            self.publisher.peer_update(network);
        }
        Ok(cleared)
    }

    /// Clear one node's failed-over pairs, on both ends
    pub fn reset_failed_over_peer(&self, node_id: Uuid) -> Result<Node> {
        let node = self.state.db().batch(|tx| {
            let mut node = tx.node(node_id)?;
            for peer_id in std::mem::take(&mut node.failover_peers) {
                if let Ok(mut peer) = tx.node(peer_id) {
                    peer.failover_peers.remove(&node_id);
                    if peer.failover_peers.is_empty() {
                        peer.failed_over_by = None;
                    }
                    tx.save_node(&mut peer)?;
                }
            }
            node.failed_over_by = None;
            tx.save_node(&mut node)?;
            Ok(node)
        })?;

        self.publisher.peer_update(&node.network);
        Ok(node)
    }

    /// Route traffic between `victim` and `peer` through the network's failover
    pub fn failover_peer(&self, victim_id: Uuid, peer_id: Uuid) -> Result<Uuid> {
        let (network, via) = self.state.db().batch(|tx| {
            let mut victim = tx.node(victim_id)?;
            let mut peer = tx.node(peer_id)?;
            if victim.network != peer.network {
                return Err(Error::validation("nodes are in different networks"));
            }
            if victim.id == peer.id {
                return Err(Error::validation("a node cannot fail over to itself"));
            }
            let failover = tx
                .nodes_in(&victim.network)?
                .into_iter()
                .find(|n| n.is_failover)
                .ok_or_else(|| {
                    Error::conflict(format!("network {} has no failover node", victim.network))
                })?;
            if failover.id == victim.id || failover.id == peer.id {
                return Err(Error::validation("the failover node cannot be failed over"));
            }

            victim.failover_peers.insert(peer.id);
            victim.failed_over_by = Some(failover.id);
            peer.failover_peers.insert(victim.id);
            peer.failed_over_by = Some(failover.id);
            tx.save_node(&mut victim)?;
            tx.save_node(&mut peer)?;
            Ok((victim.network, failover.id))
        })?;

        info!(
            "Failing over {} <-> {} via {} in {}",
            victim_id, peer_id, via, network
        );
        self.publisher.peer_update(&network);
        Ok(via)
    }
}

/// Election inside a transaction. Returns the chosen node and whether anything changed.
fn elect_in(tx: &Batch<'_>, network: &str, force: bool) -> Result<(Option<Uuid>, bool)> {
    tx.network(network)?;
    let nodes = tx.nodes_in(network)?;
    let current = nodes.iter().find(|n| n.is_failover).map(|n| n.id);
    if current.is_none() && !force {
        return Ok((None, false));
    }

    let mut hosts = HashMap::new();
    for node in &nodes {
        if let Ok(host) = tx.host(node.host_id) {
            hosts.insert(host.id, host);
        }
    }

    let chosen = elect(&nodes, &hosts);
    if chosen == current {
        return Ok((current, false));
    }

    for mut node in nodes {
        let is_failover = Some(node.id) == chosen;
        let had_marks = node.failed_over_by.is_some() || !node.failover_peers.is_empty();
        if node.is_failover != is_failover || had_marks {
            node.is_failover = is_failover;
            node.failed_over_by = None;
            node.failover_peers.clear();
            tx.save_node(&mut node)?;
        }
    }
    Ok((chosen, true))
}

fn clear_marks(tx: &Batch<'_>, network: &str) -> Result<usize> {
    let mut cleared = 0;
    for mut node in tx.nodes_in(network)? {
        if node.failed_over_by.is_some() || !node.failover_peers.is_empty() {
            node.failed_over_by = None;
            node.failover_peers.clear();
            tx.save_node(&mut node)?;
            cleared += 1;
        }
    }
    Ok(cleared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::publish::{MemoryBroker, PublishEngine};
    use crate::state::tests::host_with_endpoint;
    use std::sync::Arc;
    use wgmesh_common::Network;

    fn fixture() -> (StateManager, FailoverController, Vec<Node>) {
        let state = StateManager::in_memory(DaemonConfig::default()).unwrap();
        state
            .create_network(Network::new("skynet", "10.0.0.0/24".parse().unwrap()))
            .unwrap();
        let (_engine, publisher) = PublishEngine::new(state.clone(), Arc::new(MemoryBroker::new()));

        let mut nodes = Vec::new();
        for i in 1..=3 {
            let host = host_with_endpoint(&state, &format!("h{}", i), i);
            nodes.push(state.add_host_to_network(host.id, "skynet").unwrap().0);
        }
        nodes.sort_by_key(|n| n.host_id);
        let controller = FailoverController::new(state.clone(), publisher);
        (state, controller, nodes)
    }

    #[test]
    fn test_election_prefers_current_then_lowest_host() {
        let host = |id: Uuid, os: &str| {
            let mut h = Host::new("h");
            h.id = id;
            h.os = os.to_string();
            h
        };
        let ids: Vec<Uuid> = (1..=3u128).map(Uuid::from_u128).collect();
        let mut nodes: Vec<Node> = ids.iter().map(|id| Node::new(*id, "net")).collect();
        let mut hosts: HashMap<Uuid, Host> =
            ids.iter().map(|id| (*id, host(*id, "linux"))).collect();

        assert_eq!(elect(&nodes, &hosts), Some(nodes[0].id));

        nodes[2].is_failover = true;
        assert_eq!(elect(&nodes, &hosts), Some(nodes[2].id));

        // current becomes ineligible
        nodes[2].is_relayed = true;
        hosts.insert(ids[0], host(ids[0], "windows"));
        assert_eq!(elect(&nodes, &hosts), Some(nodes[1].id));

        assert_eq!(elect(&[], &hosts), None);
    }

    #[test]
    fn test_create_is_exclusive() {
        let (_state, controller, nodes) = fixture();
        controller.create_failover(nodes[1].id).unwrap();
        // idempotent for the same node
        controller.create_failover(nodes[1].id).unwrap();
        assert!(matches!(
            controller.create_failover(nodes[0].id),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_failover_peer_marks_both_ends() {
        let (state, controller, nodes) = fixture();
        controller.create_failover(nodes[0].id).unwrap();

        let via = controller.failover_peer(nodes[1].id, nodes[2].id).unwrap();
        assert_eq!(via, nodes[0].id);

        let victim = state.get_node(nodes[1].id).unwrap();
        let peer = state.get_node(nodes[2].id).unwrap();
        assert!(victim.failover_peers.contains(&peer.id));
        assert!(peer.failover_peers.contains(&victim.id));
        assert_eq!(peer.failed_over_by, Some(nodes[0].id));

        // the failed-over pair now reaches each other through the failover
        let snapshot = state.snapshot().unwrap();
        let view = wgmesh_common::peers::compute_peers(&snapshot, victim.id);
        assert_eq!(view.peers.len(), 1);
        assert_eq!(view.peers[0].host_id, nodes[0].host_id);

        controller.reset_failed_over_peer(victim.id).unwrap();
        assert!(state.get_node(peer.id).unwrap().failover_peers.is_empty());
        assert!(state.get_node(peer.id).unwrap().failed_over_by.is_none());
    }

    #[test]
    fn test_failover_peer_without_failover() {
        let (_state, controller, nodes) = fixture();
        assert!(matches!(
            controller.failover_peer(nodes[1].id, nodes[2].id),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_reelection_after_removal() {
        let (state, controller, nodes) = fixture();
        controller.create_failover(nodes[2].id).unwrap();
        controller.failover_peer(nodes[0].id, nodes[1].id).unwrap();

        let removal = state.remove_node(nodes[2].id).unwrap();
        assert!(removal.node.is_failover);
        controller.on_topology_change("skynet", true).unwrap();

        let elected = state.get_node(nodes[0].id).unwrap();
        assert!(elected.is_failover);
        assert!(elected.failover_peers.is_empty());
    }

    #[test]
    fn test_no_election_without_failover_in_use() {
        let (state, controller, nodes) = fixture();
        controller.on_topology_change("skynet", false).unwrap();
        assert!(state.nodes_in("skynet").unwrap().iter().all(|n| !n.is_failover));

        assert_eq!(controller.elect_failover("skynet").unwrap(), Some(nodes[0].id));
    }

    #[test]
    fn test_reset_failover() {
        let (state, controller, nodes) = fixture();
        controller.create_failover(nodes[0].id).unwrap();
        controller.failover_peer(nodes[1].id, nodes[2].id).unwrap();

        assert_eq!(controller.reset_failover("skynet").unwrap(), 2);
        assert!(state
            .nodes_in("skynet")
            .unwrap()
            .iter()
            .all(|n| n.failover_peers.is_empty()));
    }
}
