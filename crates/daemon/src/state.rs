//! Registry of hosts, nodes, networks and ext-clients

use crate::allocator::{allocate_address, UsedAddresses};
use crate::auth::password;
use crate::config::DaemonConfig;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;
use wgmesh_common::{
    crypto::KeyPair,
    db::{tables, Batch, Database},
    types::*,
    Error, Result, Snapshot, VERSION,
};

/// Typed registry reads and writes inside one transaction
pub trait RegistryTx {
    fn network(&self, id: &str) -> Result<Network>;
    fn host(&self, id: Uuid) -> Result<Host>;
    fn node(&self, id: Uuid) -> Result<Node>;
    fn nodes_in(&self, network: &str) -> Result<Vec<Node>>;
    fn ext_clients_in(&self, network: &str) -> Result<Vec<ExtClient>>;
    fn save_node(&self, node: &mut Node) -> Result<()>;
    fn save_host(&self, host: &mut Host) -> Result<()>;
}

impl RegistryTx for Batch<'_> {
    fn network(&self, id: &str) -> Result<Network> {
        self.get(tables::NETWORKS, id)?
            .ok_or_else(|| Error::not_found("network", id))
    }

    fn host(&self, id: Uuid) -> Result<Host> {
        self.get(tables::HOSTS, &id.to_string())?
            .ok_or_else(|| Error::not_found("host", id))
    }

    fn node(&self, id: Uuid) -> Result<Node> {
        self.get(tables::NODES, &id.to_string())?
            .ok_or_else(|| Error::not_found("node", id))
    }

    fn nodes_in(&self, network: &str) -> Result<Vec<Node>> {
        let nodes: Vec<Node> = self.list(tables::NODES)?;
        Ok(nodes.into_iter().filter(|n| n.network == network).collect())
    }

    fn ext_clients_in(&self, network: &str) -> Result<Vec<ExtClient>> {
        self.list_prefix(tables::EXT_CLIENTS, &format!("{}.", network))
    }

    fn save_node(&self, node: &mut Node) -> Result<()> {
        node.touch();
        self.put(tables::NODES, &node.key(), node)
    }

    fn save_host(&self, host: &mut Host) -> Result<()> {
        host.touch();
        self.put(tables::HOSTS, &host.id.to_string(), host)
    }
}

/// What a node removal took with it
#[derive(Debug, Clone)]
pub struct NodeRemoval {
    pub node: Node,
    /// Ext-clients deleted because the node was their ingress
    pub ext_clients: Vec<ExtClient>,
}

/// State manager for the registry
#[derive(Clone)]
pub struct StateManager {
    config: DaemonConfig,
    db: Database,
    key_pair: Arc<KeyPair>,
}

impl StateManager {
    /// Open the on-disk store, creating it and the signing key on first start
    pub async fn new(config: &DaemonConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.store_path).await?;

        let db = Database::open(config.db_path())?;
        let key_pair = KeyPair::load_or_generate(config.signing_key_path()).await?;

        info!("Signing key public: {}", key_pair.public_key_hex());

        Ok(Self {
            config: config.clone(),
            db,
            key_pair: Arc::new(key_pair),
        })
    }

    /// Registry over an in-memory database with a fresh signing key
    pub fn in_memory(config: DaemonConfig) -> Result<Self> {
        Ok(Self {
            config,
            db: Database::open_memory()?,
            key_pair: Arc::new(KeyPair::generate()),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    /// What a host needs to reach this server
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            server: self.config.server_name.clone(),
            api: self.config.api.base_url(),
            broker: self.config.public_broker_endpoint(),
            broker_type: self.config.broker.broker_type,
            version: VERSION.to_string(),
            signing_key: self.key_pair.public_key_hex(),
            broker_username: String::new(),
            broker_password: String::new(),
        }
    }

    /// Consistent copy of everything peer computation reads
    pub fn snapshot(&self) -> Result<Snapshot> {
        self.db.batch(|tx| {
            Ok(Snapshot::new(
                tx.list(tables::NETWORKS)?,
                tx.list(tables::HOSTS)?,
                tx.list(tables::NODES)?,
                tx.list(tables::EXT_CLIENTS)?,
                tx.list(tables::ACLS)?,
            ))
        })
    }

    // ========================================================================
    // Networks
    // ========================================================================

    pub fn create_network(&self, mut network: Network) -> Result<Network> {
        if !validate_name(&network.id) || network.id.len() > MAX_NETWORK_ID_LEN {
            return Err(Error::validation(format!(
                "invalid network id {:?}: expected 1-{} of [A-Za-z0-9-]",
                network.id, MAX_NETWORK_ID_LEN
            )));
        }
        if network.address_range.prefix() > 30 {
            return Err(Error::validation(format!(
                "address range {} is too small",
                network.address_range
            )));
        }
        if matches!(network.address_range6, Some(range) if range.prefix() > 126) {
            return Err(Error::validation("IPv6 address range is too small"));
        }

        let now = chrono::Utc::now().timestamp();
        network.created_at = now;
        network.last_modified = now;
        self.db.create(tables::NETWORKS, &network.id, &network)?;

        info!("Created network {} ({})", network.id, network.address_range);
        Ok(network)
    }

    pub fn get_network(&self, id: &str) -> Result<Network> {
        self.db
            .get(tables::NETWORKS, id)?
            .ok_or_else(|| Error::not_found("network", id))
    }

    pub fn list_networks(&self) -> Result<Vec<Network>> {
        self.db.list(tables::NETWORKS)
    }

    /// Mutate network settings; the address ranges are fixed once created
    pub fn update_network<F>(&self, id: &str, f: F) -> Result<Network>
    where
        F: FnOnce(&mut Network) -> Result<()>,
    {
        self.db.update(tables::NETWORKS, id, |network: &mut Network| {
            let range = network.address_range;
            let range6 = network.address_range6;
            f(network)?;
            if network.address_range != range || network.address_range6 != range6 {
                return Err(Error::validation("address ranges cannot be changed"));
            }
            network.touch();
            Ok(())
        })
    }

    /// Delete an empty network
    pub fn delete_network(&self, id: &str) -> Result<()> {
        self.db.batch(|tx| {
            tx.network(id)?;
            if !tx.nodes_in(id)?.is_empty() {
                return Err(Error::conflict(format!(
                    "network {} still has nodes",
                    id
                )));
            }
            tx.delete(tables::NETWORKS, id)?;
            tx.delete(tables::ACLS, id)?;
            tx.delete(tables::DNS, id)?;
            Ok(())
        })?;

        info!("Deleted network {}", id);
        Ok(())
    }

    pub fn get_acl(&self, network: &str) -> Result<NetworkAcl> {
        self.get_network(network)?;
        Ok(self
            .db
            .get(tables::ACLS, network)?
            .unwrap_or_else(|| NetworkAcl::new(network)))
    }

    pub fn put_acl(&self, acl: &NetworkAcl) -> Result<()> {
        self.db.batch(|tx| {
            tx.network(&acl.network)?;
            let members: Vec<Uuid> = tx.nodes_in(&acl.network)?.iter().map(|n| n.id).collect();
            for (a, peers) in &acl.rules {
                if !members.contains(a) || peers.keys().any(|b| !members.contains(b)) {
                    return Err(Error::validation("acl references a node outside the network"));
                }
            }
            tx.put(tables::ACLS, &acl.network, acl)
        })
    }

    // ========================================================================
    // Hosts
    // ========================================================================

    /// Persist a host unless one with the same id exists, idempotent on its id.
    ///
    /// A known host is returned as stored; re-registration never rewrites its
    /// name, key or password. Use [`update_host`](Self::update_host) for that.
    pub fn create_host(&self, host: Host) -> Result<Host> {
        self.insert_host(host).map(|(host, _)| host)
    }

    /// Like [`create_host`](Self::create_host), also reporting whether the host is new
    pub fn insert_host(&self, mut host: Host) -> Result<(Host, bool)> {
        if host.name.is_empty() {
            return Err(Error::validation("host name is required"));
        }
        if !host.host_pass.is_empty() && !password::is_hashed(&host.host_pass) {
            host.host_pass = password::hash_password(&host.host_pass)?;
        }

        let (stored, created) = self.db.batch(|tx| {
            let key = host.id.to_string();
            if let Some(existing) = tx.get::<Host>(tables::HOSTS, &key)? {
                return Ok((existing, false));
            }
            let mut stored = host.clone();
            tx.save_host(&mut stored)?;
            Ok((stored, true))
        })?;

        if created {
            debug!("Stored host {} ({})", stored.name, stored.id);
        } else {
            debug!("Host {} already registered", stored.id);
        }
        Ok((stored, created))
    }

    pub fn get_host(&self, id: Uuid) -> Result<Host> {
        self.db
            .get(tables::HOSTS, &id.to_string())?
            .ok_or_else(|| Error::not_found("host", id))
    }

    pub fn list_hosts(&self) -> Result<Vec<Host>> {
        self.db.list(tables::HOSTS)
    }

    pub fn update_host<F>(&self, id: Uuid, f: F) -> Result<Host>
    where
        F: FnOnce(&mut Host) -> Result<()>,
    {
        self.db.update(tables::HOSTS, &id.to_string(), |host: &mut Host| {
            let nodes = host.nodes.clone();
            f(host)?;
            host.nodes = nodes;
            host.touch();
            Ok(())
        })
    }

    /// Remove a host and every node it owns
    pub fn remove_host(&self, id: Uuid) -> Result<(Host, Vec<NodeRemoval>)> {
        let (host, removals) = self.db.batch(|tx| {
            let host = tx.host(id)?;
            let mut removals = Vec::new();
            for node in tx.list::<Node>(tables::NODES)? {
                if node.host_id == id {
                    removals.push(detach_node(tx, node)?);
                }
            }
            tx.delete(tables::HOSTS, &id.to_string())?;
            Ok((host, removals))
        })?;

        info!("Removed host {} with {} node(s)", host.name, removals.len());
        Ok((host, removals))
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    /// Create the host's node in `network`, allocating its address.
    ///
    /// Returns the existing node and `false` when the host is already a member.
    pub fn add_host_to_network(&self, host_id: Uuid, network: &str) -> Result<(Node, bool)> {
        let (node, created) = self.db.batch(|tx| {
            let net = tx.network(network)?;
            let mut host = tx.host(host_id)?;
            let nodes = tx.nodes_in(network)?;

            if let Some(existing) = nodes.iter().find(|n| n.host_id == host_id) {
                return Ok((existing.clone(), false));
            }
            if net.node_limit > 0 && nodes.len() >= net.node_limit as usize {
                return Err(Error::conflict(format!(
                    "network {} reached its node limit of {}",
                    network, net.node_limit
                )));
            }

            let clients = tx.ext_clients_in(network)?;
            let (address, address6) =
                allocate_address(&net, &UsedAddresses::collect(&nodes, &clients))?;

            let mut node = Node::new(host_id, network);
            node.address = Some(address);
            node.address6 = address6;
            node.persistent_keepalive = host.persistent_keepalive;
            tx.create(tables::NODES, &node.key(), &node)?;

            host.nodes.push(node.id);
            tx.save_host(&mut host)?;
            Ok((node, true))
        })?;

        if created {
            info!(
                "Host {} joined {} as node {} ({:?})",
                host_id, network, node.id, node.address
            );
        }
        Ok((node, created))
    }

    pub fn get_node(&self, id: Uuid) -> Result<Node> {
        self.db
            .get(tables::NODES, &id.to_string())?
            .ok_or_else(|| Error::not_found("node", id))
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>> {
        self.db.list(tables::NODES)
    }

    pub fn nodes_in(&self, network: &str) -> Result<Vec<Node>> {
        Ok(self
            .list_nodes()?
            .into_iter()
            .filter(|n| n.network == network)
            .collect())
    }

    pub fn nodes_of_host(&self, host_id: Uuid) -> Result<Vec<Node>> {
        Ok(self
            .list_nodes()?
            .into_iter()
            .filter(|n| n.host_id == host_id)
            .collect())
    }

    /// Mutate the non-topology fields of a node
    pub fn update_node<F>(&self, id: Uuid, f: F) -> Result<Node>
    where
        F: FnOnce(&mut Node) -> Result<()>,
    {
        self.db.update(tables::NODES, &id.to_string(), |node: &mut Node| {
            let pinned = node.clone();
            f(node)?;
            // identity and roles only change through their own operations
            node.id = pinned.id;
            node.host_id = pinned.host_id;
            node.network = pinned.network.clone();
            node.is_ingress = pinned.is_ingress;
            node.is_egress = pinned.is_egress;
            node.egress_ranges = pinned.egress_ranges.clone();
            node.is_relay = pinned.is_relay;
            node.relayed_nodes = pinned.relayed_nodes.clone();
            node.is_relayed = pinned.is_relayed;
            node.relayed_by = pinned.relayed_by;
            node.is_internet_gw = pinned.is_internet_gw;
            node.inet_clients = pinned.inet_clients.clone();
            node.is_failover = pinned.is_failover;
            node.failed_over_by = pinned.failed_over_by;
            node.failover_peers = pinned.failover_peers.clone();
            node.touch();
            Ok(())
        })
    }

    /// Delete a node and unwind every relation that points at it
    pub fn remove_node(&self, id: Uuid) -> Result<NodeRemoval> {
        let removal = self.db.batch(|tx| {
            let node = tx.node(id)?;
            if let Ok(mut host) = tx.host(node.host_id) {
                host.nodes.retain(|n| *n != id);
                tx.save_host(&mut host)?;
            }
            detach_node(tx, node)
        })?;

        info!(
            "Removed node {} from {} ({} ext-client(s) deleted)",
            id,
            removal.node.network,
            removal.ext_clients.len()
        );
        Ok(removal)
    }

    // ========================================================================
    // Ext-clients
    // ========================================================================

    pub fn get_ext_client(&self, network: &str, client_id: &str) -> Result<ExtClient> {
        let key = ext_client_key(network, client_id);
        self.db
            .get(tables::EXT_CLIENTS, &key)?
            .ok_or_else(|| Error::not_found("ext client", key))
    }

    pub fn list_ext_clients(&self, network: Option<&str>) -> Result<Vec<ExtClient>> {
        match network {
            Some(network) => self
                .db
                .list_prefix(tables::EXT_CLIENTS, &format!("{}.", network)),
            None => self.db.list(tables::EXT_CLIENTS),
        }
    }
}

/// Delete `node` and clear every reference to it, inside an open transaction.
///
/// The owning host's node list is left to the caller.
pub(crate) fn detach_node(tx: &Batch<'_>, node: Node) -> Result<NodeRemoval> {
    let id = node.id;
    let mut ext_clients = Vec::new();

    if node.is_ingress {
        for client in tx.ext_clients_in(&node.network)? {
            if client.ingress_node_id == id {
                tx.delete(tables::EXT_CLIENTS, &client.key())?;
                ext_clients.push(client);
            }
        }
    }

    for mut other in tx.nodes_in(&node.network)? {
        if other.id == id {
            continue;
        }
        let before = other.clone();

        if other.relayed_by == Some(id) {
            other.is_relayed = false;
            other.relayed_by = None;
        }
        other.relayed_nodes.retain(|n| *n != id);

        if other.internet_gw_node_id == Some(id) {
            other.internet_gw_node_id = None;
        }
        other.inet_clients.retain(|n| *n != id);

        if other.failed_over_by == Some(id) {
            other.failed_over_by = None;
            other.failover_peers.clear();
        }
        other.failover_peers.remove(&id);
        if other.failover_peers.is_empty() {
            other.failed_over_by = None;
        }

        if other != before {
            tx.save_node(&mut other)?;
        }
    }

    if let Some(mut acl) = tx.get::<NetworkAcl>(tables::ACLS, &node.network)? {
        acl.remove_node(id);
        tx.put(tables::ACLS, &node.network, &acl)?;
    }

    tx.delete(tables::NODES, &node.key())?;
    Ok(NodeRemoval { node, ext_clients })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    pub(crate) fn registry() -> StateManager {
        StateManager::in_memory(DaemonConfig::default()).unwrap()
    }

    pub(crate) fn host_with_endpoint(state: &StateManager, name: &str, last_octet: u8) -> Host {
        let mut host = Host::new(name);
        host.public_key = wgmesh_common::crypto::generate_wireguard_keypair().public_key;
        host.endpoint_ip = Some(Ipv4Addr::new(203, 0, 113, last_octet).into());
        state.create_host(host).unwrap()
    }

    #[test]
    fn test_network_validation() {
        let state = registry();

        let bad = Network::new("has space", "10.0.0.0/24".parse().unwrap());
        assert!(matches!(state.create_network(bad), Err(Error::Validation(_))));

        let tiny = Network::new("tiny", "10.0.0.0/31".parse().unwrap());
        assert!(state.create_network(tiny).is_err());

        let net = Network::new("skynet", "10.0.0.0/24".parse().unwrap());
        state.create_network(net.clone()).unwrap();
        assert!(matches!(
            state.create_network(net),
            Err(Error::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_join_is_idempotent() {
        let state = registry();
        state
            .create_network(Network::new("skynet", "10.0.0.0/24".parse().unwrap()))
            .unwrap();
        let host = host_with_endpoint(&state, "laptop", 1);

        let (node, created) = state.add_host_to_network(host.id, "skynet").unwrap();
        assert!(created);
        assert_eq!(node.address, Some(Ipv4Addr::new(10, 0, 0, 1)));

        let (again, created) = state.add_host_to_network(host.id, "skynet").unwrap();
        assert!(!created);
        assert_eq!(again.id, node.id);
        assert_eq!(state.get_host(host.id).unwrap().nodes, vec![node.id]);
    }

    #[test]
    fn test_node_limit() {
        let state = registry();
        let mut net = Network::new("small", "10.1.0.0/24".parse().unwrap());
        net.node_limit = 1;
        state.create_network(net).unwrap();

        let a = host_with_endpoint(&state, "a", 1);
        let b = host_with_endpoint(&state, "b", 2);
        state.add_host_to_network(a.id, "small").unwrap();
        assert!(matches!(
            state.add_host_to_network(b.id, "small"),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_delete_network_with_nodes_is_refused() {
        let state = registry();
        state
            .create_network(Network::new("skynet", "10.0.0.0/24".parse().unwrap()))
            .unwrap();
        let host = host_with_endpoint(&state, "laptop", 1);
        let (node, _) = state.add_host_to_network(host.id, "skynet").unwrap();

        assert!(matches!(
            state.delete_network("skynet"),
            Err(Error::Conflict(_))
        ));

        state.remove_node(node.id).unwrap();
        state.delete_network("skynet").unwrap();
        assert!(state.get_network("skynet").is_err());
    }

    #[test]
    fn test_host_password_is_hashed_once() {
        let state = registry();
        let mut host = Host::new("laptop");
        host.host_pass = "hunter2".into();
        let (stored, created) = state.insert_host(host.clone()).unwrap();
        assert!(created);
        assert!(password::is_hashed(&stored.host_pass));
        assert!(password::verify_password("hunter2", &stored.host_pass).unwrap());

        let (again, created) = state.insert_host(host).unwrap();
        assert!(!created);
        assert_eq!(again.host_pass, stored.host_pass);
    }

    #[test]
    fn test_known_host_is_not_rewritten() {
        let state = registry();
        let mut host = Host::new("laptop");
        host.public_key = "ORIGINAL".into();
        state.create_host(host.clone()).unwrap();

        host.name = "evil".into();
        host.public_key = "ATTACKER".into();
        let returned = state.create_host(host.clone()).unwrap();
        assert_eq!(returned.name, "laptop");

        let stored = state.get_host(host.id).unwrap();
        assert_eq!(stored.name, "laptop");
        assert_eq!(stored.public_key, "ORIGINAL");
    }

    #[test]
    fn test_remove_host_cascades() {
        let state = registry();
        for (id, cidr) in [("a", "10.0.0.0/24"), ("b", "10.1.0.0/24")] {
            state
                .create_network(Network::new(id, cidr.parse().unwrap()))
                .unwrap();
        }
        let host = host_with_endpoint(&state, "laptop", 1);
        let other = host_with_endpoint(&state, "server", 2);
        state.add_host_to_network(host.id, "a").unwrap();
        state.add_host_to_network(host.id, "b").unwrap();
        let (kept, _) = state.add_host_to_network(other.id, "a").unwrap();

        let (_, removals) = state.remove_host(host.id).unwrap();
        assert_eq!(removals.len(), 2);
        assert!(state.get_host(host.id).is_err());
        assert_eq!(state.list_nodes().unwrap(), vec![state.get_node(kept.id).unwrap()]);
    }

    #[test]
    fn test_update_node_pins_roles() {
        let state = registry();
        state
            .create_network(Network::new("skynet", "10.0.0.0/24".parse().unwrap()))
            .unwrap();
        let host = host_with_endpoint(&state, "laptop", 1);
        let (node, _) = state.add_host_to_network(host.id, "skynet").unwrap();

        let updated = state
            .update_node(node.id, |n| {
                n.is_relay = true;
                n.persistent_keepalive = Some(5);
                Ok(())
            })
            .unwrap();
        assert!(!updated.is_relay);
        assert_eq!(updated.persistent_keepalive, Some(5));
    }

    #[test]
    fn test_snapshot_sees_everything() {
        let state = registry();
        state
            .create_network(Network::new("skynet", "10.0.0.0/24".parse().unwrap()))
            .unwrap();
        let host = host_with_endpoint(&state, "laptop", 1);
        state.add_host_to_network(host.id, "skynet").unwrap();

        let snapshot = state.snapshot().unwrap();
        assert_eq!(snapshot.networks.len(), 1);
        assert_eq!(snapshot.hosts.len(), 1);
        assert_eq!(snapshot.nodes_in("skynet").count(), 1);
    }
}
