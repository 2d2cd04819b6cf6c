//! Peer computation
//!
//! Pure functions from a consistent [`Snapshot`] of the registry to the WireGuard peer
//! view of one node or one host. Nothing here touches storage or the network, and every
//! lookup tolerates dangling references by skipping them.

use crate::types::*;
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, Ipv6Addr};
use uuid::Uuid;

/// Point-in-time copy of everything the peer computer reads
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub networks: BTreeMap<String, Network>,
    pub hosts: BTreeMap<Uuid, Host>,
    pub nodes: BTreeMap<Uuid, Node>,
    pub ext_clients: Vec<ExtClient>,
    pub acls: BTreeMap<String, NetworkAcl>,
}

impl Snapshot {
    pub fn new(
        networks: Vec<Network>,
        hosts: Vec<Host>,
        nodes: Vec<Node>,
        mut ext_clients: Vec<ExtClient>,
        acls: Vec<NetworkAcl>,
    ) -> Self {
        ext_clients.sort_by(|a, b| a.key().cmp(&b.key()));
        Self {
            networks: networks.into_iter().map(|n| (n.id.clone(), n)).collect(),
            hosts: hosts.into_iter().map(|h| (h.id, h)).collect(),
            nodes: nodes.into_iter().map(|n| (n.id, n)).collect(),
            ext_clients,
            acls: acls.into_iter().map(|a| (a.network.clone(), a)).collect(),
        }
    }

    pub fn nodes_in<'a>(&'a self, network: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.values().filter(move |n| n.network == network)
    }

    pub fn nodes_of_host(&self, host_id: Uuid) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(move |n| n.host_id == host_id)
    }

    /// Hosts with at least one node in `network`
    pub fn hosts_in(&self, network: &str) -> BTreeSet<Uuid> {
        self.nodes_in(network).map(|n| n.host_id).collect()
    }

    pub fn ext_clients_of(&self, ingress_id: Uuid) -> impl Iterator<Item = &ExtClient> {
        self.ext_clients
            .iter()
            .filter(move |c| c.ingress_node_id == ingress_id)
    }

    pub fn failover_node(&self, network: &str) -> Option<&Node> {
        self.nodes
            .values()
            .find(|n| n.network == network && n.is_failover)
    }
}

/// Compute the peer set of one node.
///
/// Unknown viewers yield an empty set.
pub fn compute_peers(snapshot: &Snapshot, viewer_id: Uuid) -> PeerSet {
    let Some(viewer) = snapshot.nodes.get(&viewer_id) else {
        return PeerSet {
            node_id: viewer_id,
            ..Default::default()
        };
    };

    let network = snapshot.networks.get(&viewer.network);
    let network_ranges = network.map(Network::ranges).unwrap_or_default();
    let default_keepalive = network
        .map(|n| n.default_keepalive)
        .unwrap_or(DEFAULT_KEEPALIVE);
    let default_acl = network.map(|n| n.default_acl).unwrap_or_default();
    let acl = snapshot.acls.get(&viewer.network);

    let mut entries: BTreeMap<Uuid, PeerEntry> = BTreeMap::new();
    for candidate in snapshot.nodes_in(&viewer.network) {
        if candidate.id == viewer.id || candidate.host_id == viewer.host_id || candidate.is_pending
        {
            continue;
        }
        if let Some(acl) = acl {
            if !acl.allows(default_acl, viewer.id, candidate.id) {
                continue;
            }
        } else if default_acl == AclPolicy::Deny {
            continue;
        }
        let Some(host) = snapshot.hosts.get(&candidate.host_id) else {
            continue;
        };

        entries.insert(
            candidate.id,
            PeerEntry {
                host_id: host.id,
                node_ids: vec![candidate.id],
                public_key: host.public_key.clone(),
                endpoint: host.endpoint(),
                address: candidate.address,
                allowed_ips: allowed_ips(snapshot, &network_ranges, viewer, candidate),
                persistent_keepalive: candidate.persistent_keepalive.unwrap_or(default_keepalive),
                is_relay: candidate.is_relay,
                is_failover: candidate.is_failover,
            },
        );
    }

    let peers = if viewer.is_relayed {
        collapse_into_relay(viewer, entries)
    } else {
        fold_relayed(snapshot, viewer, &mut entries);
        fold_failed_over(snapshot, viewer, &mut entries);
        entries.into_values().collect()
    };

    PeerSet {
        network: viewer.network.clone(),
        node_id: viewer.id,
        peers: finish(peers),
    }
}

/// Ext-clients of an ingress node as WireGuard peers of its host
pub fn compute_ext_peers(snapshot: &Snapshot, ingress_id: Uuid) -> Vec<ExtPeerEntry> {
    match snapshot.nodes.get(&ingress_id) {
        Some(node) if node.is_ingress => {}
        _ => return Vec::new(),
    }

    let mut peers: Vec<ExtPeerEntry> = snapshot
        .ext_clients_of(ingress_id)
        .filter(|c| c.enabled && !c.public_key.is_empty())
        .map(|c| {
            let mut allowed_ips = c.address_networks();
            allowed_ips.extend(c.extra_allowed_ips.iter().copied());
            sort_networks(&mut allowed_ips);
            ExtPeerEntry {
                client_id: c.client_id.clone(),
                public_key: c.public_key.clone(),
                allowed_ips,
            }
        })
        .collect();
    peers.sort_by(|a, b| a.client_id.cmp(&b.client_id));
    peers
}

/// Full payload for one host: every network's view plus a merged peer list
pub fn host_peer_update(
    snapshot: &Snapshot,
    host_id: Uuid,
    server: &str,
    server_version: &str,
) -> HostPeerUpdate {
    let mut update = HostPeerUpdate {
        host_id,
        server: server.to_string(),
        server_version: server_version.to_string(),
        ..Default::default()
    };

    let mut merged: BTreeMap<String, PeerEntry> = BTreeMap::new();
    for node in snapshot.nodes_of_host(host_id) {
        let set = compute_peers(snapshot, node.id);
        for peer in &set.peers {
            match merged.get_mut(&peer.public_key) {
                Some(existing) => {
                    existing.allowed_ips.extend(peer.allowed_ips.iter().copied());
                    existing.node_ids.extend(peer.node_ids.iter().copied());
                    existing.persistent_keepalive =
                        existing.persistent_keepalive.min(peer.persistent_keepalive);
                    existing.is_relay |= peer.is_relay;
                    existing.is_failover |= peer.is_failover;
                }
                None => {
                    merged.insert(peer.public_key.clone(), peer.clone());
                }
            }
        }
        if node.is_ingress {
            update.ext_peers.extend(compute_ext_peers(snapshot, node.id));
        }
        update.networks.insert(node.network.clone(), set);
    }

    update.peers = finish(merged.into_values().collect());
    update
}

/// Narrow update carrying only the ext-peers of one ingress
pub fn ext_peer_update(
    snapshot: &Snapshot,
    ingress_id: Uuid,
    server: &str,
    server_version: &str,
) -> Option<HostPeerUpdate> {
    let node = snapshot.nodes.get(&ingress_id)?;
    Some(HostPeerUpdate {
        host_id: node.host_id,
        server: server.to_string(),
        server_version: server_version.to_string(),
        ext_peers: compute_ext_peers(snapshot, ingress_id),
        ext_only: true,
        ..Default::default()
    })
}

/// Whether two CIDRs share any address
pub fn overlaps(a: &IpNetwork, b: &IpNetwork) -> bool {
    if a.is_ipv4() != b.is_ipv4() {
        return false;
    }
    a.contains(b.network()) || b.contains(a.network())
}

fn allowed_ips(
    snapshot: &Snapshot,
    network_ranges: &[IpNetwork],
    viewer: &Node,
    candidate: &Node,
) -> Vec<IpNetwork> {
    let mut ips = candidate.address_networks();

    if candidate.is_egress {
        for range in &candidate.egress_ranges {
            if !network_ranges.iter().any(|net| overlaps(range, net)) {
                ips.push(*range);
            }
        }
    }

    if candidate.is_ingress {
        for client in snapshot.ext_clients_of(candidate.id).filter(|c| c.enabled) {
            ips.extend(client.address_networks());
            ips.extend(client.extra_allowed_ips.iter().copied());
        }
    }

    if candidate.is_internet_gw && viewer.internet_gw_node_id == Some(candidate.id) {
        if let Ok(all_v4) = Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0) {
            ips.push(IpNetwork::V4(all_v4));
        }
        if let Ok(all_v6) = Ipv6Network::new(Ipv6Addr::UNSPECIFIED, 0) {
            ips.push(IpNetwork::V6(all_v6));
        }
    }

    ips
}

/// A relayed viewer talks only to its relay, which carries everyone else's routes.
fn collapse_into_relay(viewer: &Node, mut entries: BTreeMap<Uuid, PeerEntry>) -> Vec<PeerEntry> {
    let Some(mut relay) = viewer.relayed_by.and_then(|id| entries.remove(&id)) else {
        return Vec::new();
    };
    for other in entries.into_values() {
        relay.allowed_ips.extend(other.allowed_ips);
        relay.node_ids.extend(other.node_ids);
    }
    vec![relay]
}

/// Hide nodes relayed by someone other than the viewer behind their relay's entry.
fn fold_relayed(snapshot: &Snapshot, viewer: &Node, entries: &mut BTreeMap<Uuid, PeerEntry>) {
    let relayed: Vec<(Uuid, Option<Uuid>)> = entries
        .keys()
        .filter_map(|id| snapshot.nodes.get(id))
        .filter(|n| n.is_relayed && n.relayed_by != Some(viewer.id))
        .map(|n| (n.id, n.relayed_by))
        .collect();

    for (id, relay_id) in relayed {
        let Some(hidden) = entries.remove(&id) else {
            continue;
        };
        if let Some(relay) = relay_id.and_then(|r| entries.get_mut(&r)) {
            relay.allowed_ips.extend(hidden.allowed_ips);
            relay.node_ids.extend(hidden.node_ids);
        }
    }
}

/// Route failed-over peers through the failover node.
fn fold_failed_over(snapshot: &Snapshot, viewer: &Node, entries: &mut BTreeMap<Uuid, PeerEntry>) {
    if viewer.failover_peers.is_empty() {
        return;
    }

    let via = viewer
        .failed_over_by
        .or_else(|| snapshot.failover_node(&viewer.network).map(|n| n.id));
    let Some(via) = via else {
        return;
    };
    if via == viewer.id {
        return;
    }

    for peer_id in &viewer.failover_peers {
        if *peer_id == via || !entries.contains_key(&via) {
            continue;
        }
        let Some(hidden) = entries.remove(peer_id) else {
            continue;
        };
        if let Some(failover) = entries.get_mut(&via) {
            failover.allowed_ips.extend(hidden.allowed_ips);
            failover.node_ids.extend(hidden.node_ids);
        }
    }
}

fn sort_networks(nets: &mut Vec<IpNetwork>) {
    nets.sort_by(|a, b| (a.ip(), a.prefix()).cmp(&(b.ip(), b.prefix())));
    nets.dedup();
}

/// Drop peers we cannot reach, normalize fields and order deterministically.
fn finish(peers: Vec<PeerEntry>) -> Vec<PeerEntry> {
    let mut peers: Vec<PeerEntry> = peers
        .into_iter()
        .filter(|p| p.endpoint.is_some() && !p.public_key.is_empty())
        .map(|mut p| {
            sort_networks(&mut p.allowed_ips);
            p.node_ids.sort();
            p.node_ids.dedup();
            p
        })
        .collect();
    peers.sort_by(|a, b| (a.host_id, a.address).cmp(&(b.host_id, b.address)));
    peers
}
