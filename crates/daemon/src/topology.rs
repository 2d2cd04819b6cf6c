//! Gateway roles: ingress, egress, relay and internet gateway
//!
//! Every mutation runs in one store transaction and then schedules a peer update
//! for the affected network.

use crate::failover::FailoverController;
use crate::publish::Publisher;
use crate::state::{RegistryTx, StateManager};
use ipnetwork::IpNetwork;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;
use wgmesh_common::{db::tables, AclPolicy, Error, ExtClient, Network, Node, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngressRequest {
    #[serde(default)]
    pub ingress_dns: Option<String>,
    /// Replaces the network's default ACL stance
    #[serde(default)]
    pub default_acl: Option<AclPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressRequest {
    pub interface: String,
    pub ranges: Vec<IpNetwork>,
    #[serde(default)]
    pub nat: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayRequest {
    pub relay_id: Uuid,
    pub relayed: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InternetGwRequest {
    #[serde(default)]
    pub inet_clients: Vec<Uuid>,
}

#[derive(Clone)]
pub struct Topology {
    state: StateManager,
    publisher: Publisher,
    failover: FailoverController,
}

impl Topology {
    pub fn new(state: StateManager, publisher: Publisher, failover: FailoverController) -> Self {
        Self {
            state,
            publisher,
            failover,
        }
    }

    pub fn create_ingress(&self, node_id: Uuid, req: IngressRequest) -> Result<Node> {
        let node = self.state.db().batch(|tx| {
            let mut node = tx.node(node_id)?;
            if node.is_relayed {
                return Err(Error::conflict("a relayed node cannot be an ingress gateway"));
            }
            node.is_ingress = true;
            node.ingress_dns = req.ingress_dns.clone().filter(|d| !d.is_empty());
            tx.save_node(&mut node)?;

            if let Some(policy) = req.default_acl {
                let mut network: Network = tx.network(&node.network)?;
                if network.default_acl != policy {
                    network.default_acl = policy;
                    network.touch();
                    tx.put(tables::NETWORKS, &network.id, &network)?;
                }
            }
            Ok(node)
        })?;

        info!("Node {} is an ingress gateway in {}", node.id, node.network);
        self.publisher.peer_update(&node.network);
        Ok(node)
    }

    /// Drop the ingress role along with every ext-client behind it
    pub fn delete_ingress(&self, node_id: Uuid) -> Result<(Node, Vec<ExtClient>)> {
        let (node, removed) = self.state.db().batch(|tx| {
            let mut node = tx.node(node_id)?;
            if !node.is_ingress {
                return Err(Error::validation(format!("node {} is not an ingress", node_id)));
            }

            let mut removed = Vec::new();
            for client in tx.ext_clients_in(&node.network)? {
                if client.ingress_node_id == node.id {
                    tx.delete(tables::EXT_CLIENTS, &client.key())?;
                    removed.push(client);
                }
            }

            node.is_ingress = false;
            node.ingress_dns = None;
            tx.save_node(&mut node)?;
            Ok((node, removed))
        })?;

        info!(
            "Removed ingress {} and {} ext-client(s)",
            node.id,
            removed.len()
        );
        self.publisher.peer_update(&node.network);
        Ok((node, removed))
    }

    pub fn create_egress(&self, node_id: Uuid, req: EgressRequest) -> Result<Node> {
        let interface = req.interface.trim();
        if interface.is_empty() {
            return Err(Error::validation("egress interface is required"));
        }
        let mut ranges = req.ranges;
        if ranges.is_empty() {
            return Err(Error::validation("egress needs at least one range"));
        }
        ranges.sort_by(|a, b| (a.ip(), a.prefix()).cmp(&(b.ip(), b.prefix())));
        ranges.dedup();

        let node = self.state.db().batch(|tx| {
            let mut node = tx.node(node_id)?;
            node.is_egress = true;
            node.egress_interface = interface.to_string();
            node.egress_ranges = ranges.clone();
            node.egress_nat = req.nat;
            tx.save_node(&mut node)?;
            Ok(node)
        })?;

        info!(
            "Node {} is an egress gateway for {:?}",
            node.id, node.egress_ranges
        );
        self.publisher.peer_update(&node.network);
        Ok(node)
    }

    pub fn delete_egress(&self, node_id: Uuid) -> Result<Node> {
        let node = self.state.db().batch(|tx| {
            let mut node = tx.node(node_id)?;
            node.is_egress = false;
            node.egress_interface.clear();
            node.egress_ranges.clear();
            node.egress_nat = false;
            tx.save_node(&mut node)?;
            Ok(node)
        })?;

        self.publisher.peer_update(&node.network);
        Ok(node)
    }

    /// Route `relayed` through `relay_id`. Applying the same request twice is a no-op.
    pub fn create_relay(&self, req: RelayRequest) -> Result<Node> {
        let relay = self.state.db().batch(|tx| {
            let mut relay = tx.node(req.relay_id)?;
            if relay.is_relayed {
                return Err(Error::conflict("a relayed node cannot be a relay"));
            }

            let mut relayed_ids = relay.relayed_nodes.clone();
            for id in &req.relayed {
                if *id == relay.id {
                    return Err(Error::validation("a node cannot relay itself"));
                }
                let mut target = tx.node(*id)?;
                if target.network != relay.network {
                    return Err(Error::validation(format!(
                        "node {} is not in network {}",
                        id, relay.network
                    )));
                }
                if target.is_relay {
                    return Err(Error::conflict(format!("node {} is a relay", id)));
                }
                if target.is_ingress || target.is_internet_gw {
                    return Err(Error::conflict(format!(
                        "node {} is a gateway and cannot be relayed",
                        id
                    )));
                }
                match target.relayed_by {
                    Some(other) if other != relay.id => {
                        return Err(Error::conflict(format!(
                            "node {} is already relayed by {}",
                            id, other
                        )));
                    }
                    Some(_) => {}
                    None => {
                        target.is_relayed = true;
                        target.relayed_by = Some(relay.id);
                        tx.save_node(&mut target)?;
                    }
                }
                relayed_ids.push(*id);
            }
            relayed_ids.sort();
            relayed_ids.dedup();

            if !relay.is_relay || relay.relayed_nodes != relayed_ids {
                relay.is_relay = true;
                relay.relayed_nodes = relayed_ids;
                tx.save_node(&mut relay)?;
            }
            Ok(relay)
        })?;

        info!(
            "Node {} relays {} node(s) in {}",
            relay.id,
            relay.relayed_nodes.len(),
            relay.network
        );
        // relayed nodes may have lost failover eligibility
        self.failover.on_topology_change(&relay.network, false)?;
        self.publisher.peer_update(&relay.network);
        Ok(relay)
    }

    /// Drop the relay role. The relayed nodes keep their memberships.
    pub fn delete_relay(&self, relay_id: Uuid) -> Result<Node> {
        let relay = self.state.db().batch(|tx| {
            let mut relay = tx.node(relay_id)?;
            if !relay.is_relay {
                return Err(Error::validation(format!("node {} is not a relay", relay_id)));
            }
            for id in std::mem::take(&mut relay.relayed_nodes) {
                let Ok(mut target) = tx.node(id) else {
                    continue;
                };
                if target.relayed_by == Some(relay.id) {
                    target.is_relayed = false;
                    target.relayed_by = None;
                    tx.save_node(&mut target)?;
                }
            }
            relay.is_relay = false;
            tx.save_node(&mut relay)?;
            Ok(relay)
        })?;

        info!("Node {} no longer relays", relay.id);
        self.failover.on_topology_change(&relay.network, false)?;
        self.publisher.peer_update(&relay.network);
        Ok(relay)
    }

    /// Make `node_id` the network's internet gateway for `req.inet_clients`
    pub fn set_internet_gw(&self, node_id: Uuid, req: InternetGwRequest) -> Result<Node> {
        let gw = self.state.db().batch(|tx| {
            let mut gw = tx.node(node_id)?;
            let host = tx.host(gw.host_id)?;
            if !host.is_linux() {
                return Err(Error::validation("internet gateways must run Linux"));
            }
            if gw.is_relayed {
                return Err(Error::conflict("a relayed node cannot be an internet gateway"));
            }

            let members = tx.nodes_in(&gw.network)?;
            if let Some(other) = members.iter().find(|n| n.is_internet_gw && n.id != gw.id) {
                return Err(Error::conflict(format!(
                    "network {} already has internet gateway {}",
                    gw.network, other.id
                )));
            }

            let mut clients = req.inet_clients.clone();
            clients.sort();
            clients.dedup();
            for id in &clients {
                if *id == gw.id {
                    return Err(Error::validation("a gateway cannot be its own client"));
                }
                if !members.iter().any(|n| n.id == *id) {
                    return Err(Error::validation(format!(
                        "node {} is not in network {}",
                        id, gw.network
                    )));
                }
            }

            for mut member in members {
                if member.id == gw.id {
                    continue;
                }
                let wanted = clients.contains(&member.id).then_some(gw.id);
                let current = member.internet_gw_node_id.filter(|id| *id == gw.id);
                if wanted != current {
                    member.internet_gw_node_id = wanted;
                    tx.save_node(&mut member)?;
                }
            }

            gw.is_internet_gw = true;
            gw.inet_clients = clients;
            tx.save_node(&mut gw)?;
            Ok(gw)
        })?;

        info!(
            "Node {} is the internet gateway of {} with {} client(s)",
            gw.id,
            gw.network,
            gw.inet_clients.len()
        );
        self.reset_routing(&gw.network)?;
        self.publisher.peer_update(&gw.network);
        Ok(gw)
    }

    pub fn unset_internet_gw(&self, node_id: Uuid) -> Result<Node> {
        let gw = self.state.db().batch(|tx| {
            let mut gw = tx.node(node_id)?;
            if !gw.is_internet_gw {
                return Err(Error::validation(format!(
                    "node {} is not an internet gateway",
                    node_id
                )));
            }
            for mut member in tx.nodes_in(&gw.network)? {
                if member.internet_gw_node_id == Some(gw.id) {
                    member.internet_gw_node_id = None;
                    tx.save_node(&mut member)?;
                }
            }
            gw.is_internet_gw = false;
            gw.inet_clients.clear();
            tx.save_node(&mut gw)?;
            Ok(gw)
        })?;

        info!("Node {} is no longer an internet gateway", gw.id);
        self.reset_routing(&gw.network)?;
        self.publisher.peer_update(&gw.network);
        Ok(gw)
    }

    /// Failed-over pairs were computed against the old routes
    fn reset_routing(&self, network: &str) -> Result<()> {
        self.failover.reset_failover(network)?;
        self.failover.on_topology_change(network, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::publish::{MemoryBroker, PublishEngine};
    use crate::state::tests::host_with_endpoint;
    use std::sync::Arc;
    use wgmesh_common::peers::compute_peers;
    use wgmesh_common::PeerSet;

    struct Fixture {
        state: StateManager,
        topology: Topology,
        publisher: Publisher,
        nodes: Vec<Node>,
    }

    fn fixture(count: u8) -> Fixture {
        let state = StateManager::in_memory(DaemonConfig::default()).unwrap();
        state
            .create_network(Network::new("skynet", "10.0.0.0/24".parse().unwrap()))
            .unwrap();
        let (_engine, publisher) = PublishEngine::new(state.clone(), Arc::new(MemoryBroker::new()));
        let failover = FailoverController::new(state.clone(), publisher.clone());

        let nodes = (1..=count)
            .map(|i| {
                let host = host_with_endpoint(&state, &format!("h{}", i), i);
                state.add_host_to_network(host.id, "skynet").unwrap().0
            })
            .collect();
        let topology = Topology::new(state.clone(), publisher.clone(), failover);
        Fixture {
            state,
            topology,
            publisher,
            nodes,
        }
    }

    fn ext_client(network: &str, ingress: Uuid, id: &str) -> ExtClient {
        ExtClient {
            client_id: id.to_string(),
            network: network.to_string(),
            ingress_node_id: ingress,
            address: Some("10.0.0.200".parse().unwrap()),
            address6: None,
            private_key: String::new(),
            public_key: wgmesh_common::crypto::generate_wireguard_keypair().public_key,
            dns: None,
            extra_allowed_ips: Vec::new(),
            enabled: true,
            owner_id: None,
            last_modified: 0,
        }
    }

    fn peer_sets(f: &Fixture) -> Vec<PeerSet> {
        let snapshot = f.state.snapshot().unwrap();
        f.nodes
            .iter()
            .map(|n| compute_peers(&snapshot, n.id))
            .collect()
    }

    #[test]
    fn test_ingress_round_trip_restores_peers() {
        let f = fixture(3);
        let before = peer_sets(&f);
        let ingress = f.nodes[1].id;

        f.topology
            .create_ingress(ingress, IngressRequest::default())
            .unwrap();
        let client = ext_client("skynet", ingress, "phone");
        f.state
            .db()
            .create(tables::EXT_CLIENTS, &client.key(), &client)
            .unwrap();
        assert_ne!(peer_sets(&f), before);

        f.topology.delete_ingress(ingress).unwrap();
        assert_eq!(peer_sets(&f), before);
    }

    #[test]
    fn test_ingress_lifecycle_removes_clients() {
        let f = fixture(2);
        let ingress = f.nodes[0].id;
        f.topology
            .create_ingress(
                ingress,
                IngressRequest {
                    default_acl: Some(AclPolicy::Deny),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(
            f.state.get_network("skynet").unwrap().default_acl,
            AclPolicy::Deny
        );

        let client = ext_client("skynet", ingress, "laptop");
        f.state
            .db()
            .create(tables::EXT_CLIENTS, &client.key(), &client)
            .unwrap();

        let (node, removed) = f.topology.delete_ingress(ingress).unwrap();
        assert!(!node.is_ingress);
        assert_eq!(removed.len(), 1);
        assert!(f.state.list_ext_clients(Some("skynet")).unwrap().is_empty());
        assert!(f.publisher.pending() > 0);
    }

    #[test]
    fn test_egress_validation_and_dedup() {
        let f = fixture(1);
        let id = f.nodes[0].id;
        let range: IpNetwork = "192.168.10.0/24".parse().unwrap();

        assert!(f
            .topology
            .create_egress(
                id,
                EgressRequest {
                    interface: " ".into(),
                    ranges: vec![range],
                    nat: true
                }
            )
            .is_err());
        assert!(f
            .topology
            .create_egress(
                id,
                EgressRequest {
                    interface: "eth0".into(),
                    ranges: vec![],
                    nat: true
                }
            )
            .is_err());

        let node = f
            .topology
            .create_egress(
                id,
                EgressRequest {
                    interface: "eth0".into(),
                    ranges: vec![range, range],
                    nat: true,
                },
            )
            .unwrap();
        assert_eq!(node.egress_ranges, vec![range]);

        let node = f.topology.delete_egress(id).unwrap();
        assert!(!node.is_egress);
        assert!(node.egress_ranges.is_empty());
    }

    #[test]
    fn test_relay_is_idempotent() {
        let f = fixture(3);
        let (relay, a, b) = (f.nodes[0].id, f.nodes[1].id, f.nodes[2].id);
        let req = RelayRequest {
            relay_id: relay,
            relayed: vec![a, b],
        };

        let first = f.topology.create_relay(req.clone()).unwrap();
        let after_first: Vec<Node> = f.state.nodes_in("skynet").unwrap();
        let second = f.topology.create_relay(req).unwrap();
        assert_eq!(first.relayed_nodes, second.relayed_nodes);
        assert_eq!(f.state.nodes_in("skynet").unwrap(), after_first);

        let relayed = f.state.get_node(a).unwrap();
        assert!(relayed.is_relayed);
        assert_eq!(relayed.relayed_by, Some(relay));

        // a relayed node only sees its relay
        let snapshot = f.state.snapshot().unwrap();
        let view = compute_peers(&snapshot, a);
        assert_eq!(view.peers.len(), 1);
        assert!(view.peers[0].is_relay);
    }

    #[test]
    fn test_relay_rules() {
        let f = fixture(3);
        let (relay, a, b) = (f.nodes[0].id, f.nodes[1].id, f.nodes[2].id);

        assert!(matches!(
            f.topology.create_relay(RelayRequest {
                relay_id: relay,
                relayed: vec![relay]
            }),
            Err(Error::Validation(_))
        ));

        f.topology
            .create_relay(RelayRequest {
                relay_id: relay,
                relayed: vec![a],
            })
            .unwrap();

        // a second relay cannot claim an already relayed node
        assert!(matches!(
            f.topology.create_relay(RelayRequest {
                relay_id: b,
                relayed: vec![a]
            }),
            Err(Error::Conflict(_))
        ));
        // nor can a relayed node become a relay
        assert!(matches!(
            f.topology.create_relay(RelayRequest {
                relay_id: a,
                relayed: vec![b]
            }),
            Err(Error::Conflict(_))
        ));
        // a relayed node cannot host ext-clients
        assert!(matches!(
            f.topology.create_ingress(a, IngressRequest::default()),
            Err(Error::Conflict(_))
        ));

        f.topology.delete_relay(relay).unwrap();
        let freed = f.state.get_node(a).unwrap();
        assert!(!freed.is_relayed);
        assert_eq!(f.state.nodes_in("skynet").unwrap().len(), 3);
    }

    #[test]
    fn test_relay_across_networks_is_rejected() {
        let f = fixture(1);
        f.state
            .create_network(Network::new("other", "10.1.0.0/24".parse().unwrap()))
            .unwrap();
        let host = host_with_endpoint(&f.state, "elsewhere", 50);
        let (foreign, _) = f.state.add_host_to_network(host.id, "other").unwrap();

        assert!(matches!(
            f.topology.create_relay(RelayRequest {
                relay_id: f.nodes[0].id,
                relayed: vec![foreign.id]
            }),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_internet_gw_routes_clients() {
        let f = fixture(3);
        let (gw, client, bystander) = (f.nodes[0].id, f.nodes[1].id, f.nodes[2].id);
        f.topology
            .set_internet_gw(
                gw,
                InternetGwRequest {
                    inet_clients: vec![client],
                },
            )
            .unwrap();

        assert_eq!(f.state.get_node(client).unwrap().internet_gw_node_id, Some(gw));
        assert_eq!(f.state.get_node(bystander).unwrap().internet_gw_node_id, None);

        let snapshot = f.state.snapshot().unwrap();
        let view = compute_peers(&snapshot, client);
        let gw_host = f.state.get_node(gw).unwrap().host_id;
        let entry = view.peer(gw_host).unwrap();
        assert!(entry.allowed_ips.iter().any(|ip| ip.prefix() == 0));

        // only one gateway per network
        assert!(matches!(
            f.topology.set_internet_gw(bystander, InternetGwRequest::default()),
            Err(Error::Conflict(_))
        ));

        f.topology.unset_internet_gw(gw).unwrap();
        assert_eq!(f.state.get_node(client).unwrap().internet_gw_node_id, None);
    }

    #[test]
    fn test_internet_gw_requires_linux() {
        let f = fixture(1);
        let node = &f.nodes[0];
        f.state
            .update_host(node.host_id, |h| {
                h.os = "windows".into();
                Ok(())
            })
            .unwrap();
        assert!(matches!(
            f.topology.set_internet_gw(node.id, InternetGwRequest::default()),
            Err(Error::Validation(_))
        ));
    }
}
