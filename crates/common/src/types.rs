//! Core types for wgmesh

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use uuid::Uuid;

/// Default WireGuard listen port
pub const DEFAULT_LISTEN_PORT: u16 = 51821;

/// Default persistent keepalive in seconds
pub const DEFAULT_KEEPALIVE: u16 = 20;

/// Maximum length of a network identifier
pub const MAX_NETWORK_ID_LEN: usize = 32;

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ============================================================================
// Host
// ============================================================================

/// A device running the agent. Exists once globally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Host {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub os: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub endpoint_ip: Option<IpAddr>,
    #[serde(default)]
    pub endpoint_ipv6: Option<Ipv6Addr>,
    #[serde(default)]
    pub is_default: bool,
    /// Plain on the wire from the agent; argon2 hash once stored; blanked in responses.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host_pass: String,
    #[serde(default)]
    pub nodes: Vec<Uuid>,
    #[serde(default)]
    pub persistent_keepalive: Option<u16>,
    #[serde(default)]
    pub mtu: Option<u16>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub last_modified: i64,
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

impl Host {
    pub fn new(name: impl Into<String>) -> Self {
        let now = now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            version: String::new(),
            os: "linux".to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            public_key: String::new(),
            endpoint_ip: None,
            endpoint_ipv6: None,
            is_default: false,
            host_pass: String::new(),
            nodes: Vec::new(),
            persistent_keepalive: None,
            mtu: None,
            created_at: now,
            last_modified: now,
        }
    }

    pub fn is_linux(&self) -> bool {
        self.os.eq_ignore_ascii_case("linux")
    }

    /// WireGuard endpoint, preferring IPv4
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint_ip
            .or(self.endpoint_ipv6.map(IpAddr::V6))
            .map(|ip| SocketAddr::new(ip, self.listen_port))
    }

    /// Copy safe to hand back to clients
    pub fn redacted(&self) -> Self {
        let mut host = self.clone();
        host.host_pass.clear();
        host
    }

    pub fn touch(&mut self) {
        self.last_modified = now();
    }
}

// ============================================================================
// Node
// ============================================================================

/// A host's membership in one network
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Node {
    pub id: Uuid,
    pub host_id: Uuid,
    pub network: String,
    #[serde(default)]
    pub address: Option<Ipv4Addr>,
    #[serde(default)]
    pub address6: Option<Ipv6Addr>,

    #[serde(default)]
    pub is_ingress: bool,
    #[serde(default)]
    pub ingress_dns: Option<String>,

    #[serde(default)]
    pub is_egress: bool,
    #[serde(default)]
    pub egress_ranges: Vec<IpNetwork>,
    #[serde(default)]
    pub egress_interface: String,
    #[serde(default)]
    pub egress_nat: bool,

    #[serde(default)]
    pub is_relay: bool,
    #[serde(default)]
    pub relayed_nodes: Vec<Uuid>,
    #[serde(default)]
    pub is_relayed: bool,
    #[serde(default)]
    pub relayed_by: Option<Uuid>,

    #[serde(default)]
    pub is_internet_gw: bool,
    #[serde(default)]
    pub inet_clients: Vec<Uuid>,
    /// Internet gateway this node routes its default route through
    #[serde(default)]
    pub internet_gw_node_id: Option<Uuid>,

    #[serde(default)]
    pub is_failover: bool,
    #[serde(default)]
    pub failed_over_by: Option<Uuid>,
    #[serde(default)]
    pub failover_peers: BTreeSet<Uuid>,

    #[serde(default)]
    pub persistent_keepalive: Option<u16>,
    #[serde(default)]
    pub post_up: String,
    #[serde(default)]
    pub post_down: String,
    #[serde(default)]
    pub is_pending: bool,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub last_check_in: i64,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub last_modified: i64,
}

impl Node {
    pub fn new(host_id: Uuid, network: impl Into<String>) -> Self {
        let now = now();
        Self {
            id: Uuid::new_v4(),
            host_id,
            network: network.into(),
            connected: true,
            last_check_in: now,
            created_at: now,
            last_modified: now,
            ..Default::default()
        }
    }

    /// Storage key under the nodes table
    pub fn key(&self) -> String {
        self.id.to_string()
    }

    /// Overlay addresses as host routes (/32, /128)
    pub fn address_networks(&self) -> Vec<IpNetwork> {
        let mut nets = Vec::new();
        if let Some(v4) = self.address {
            nets.push(IpNetwork::V4(Ipv4Network::from(v4)));
        }
        if let Some(v6) = self.address6 {
            nets.push(IpNetwork::V6(Ipv6Network::from(v6)));
        }
        nets
    }

    /// Reset topology roles, keeping identity and addressing
    pub fn clear_roles(&mut self) {
        self.is_ingress = false;
        self.ingress_dns = None;
        self.is_egress = false;
        self.egress_ranges.clear();
        self.egress_interface.clear();
        self.is_relay = false;
        self.relayed_nodes.clear();
        self.is_relayed = false;
        self.relayed_by = None;
        self.is_internet_gw = false;
        self.inet_clients.clear();
        self.internet_gw_node_id = None;
        self.is_failover = false;
        self.failed_over_by = None;
        self.failover_peers.clear();
    }

    pub fn touch(&mut self) {
        self.last_modified = now();
    }
}

// ============================================================================
// Network
// ============================================================================

/// Default ACL stance for a network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AclPolicy {
    #[default]
    Allow,
    Deny,
}

impl std::fmt::Display for AclPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AclPolicy::Allow => write!(f, "allow"),
            AclPolicy::Deny => write!(f, "deny"),
        }
    }
}

impl std::str::FromStr for AclPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allow" | "yes" => Ok(AclPolicy::Allow),
            "deny" | "no" => Ok(AclPolicy::Deny),
            other => Err(format!("unknown acl policy: {}", other)),
        }
    }
}

/// An isolated L3 overlay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Network {
    pub id: String,
    pub address_range: Ipv4Network,
    #[serde(default)]
    pub address_range6: Option<Ipv6Network>,
    #[serde(default = "default_keepalive")]
    pub default_keepalive: u16,
    #[serde(default)]
    pub default_dns: Option<String>,
    #[serde(default)]
    pub default_acl: AclPolicy,
    /// 0 = unlimited
    #[serde(default)]
    pub node_limit: u32,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub last_modified: i64,
}

fn default_keepalive() -> u16 {
    DEFAULT_KEEPALIVE
}

impl Network {
    pub fn new(id: impl Into<String>, address_range: Ipv4Network) -> Self {
        let now = now();
        Self {
            id: id.into(),
            address_range,
            address_range6: None,
            default_keepalive: DEFAULT_KEEPALIVE,
            default_dns: None,
            default_acl: AclPolicy::Allow,
            node_limit: 0,
            created_at: now,
            last_modified: now,
        }
    }

    pub fn is_dual_stack(&self) -> bool {
        self.address_range6.is_some()
    }

    /// The overlay CIDRs as generic networks
    pub fn ranges(&self) -> Vec<IpNetwork> {
        let mut ranges = vec![IpNetwork::V4(self.address_range)];
        if let Some(v6) = self.address_range6 {
            ranges.push(IpNetwork::V6(v6));
        }
        ranges
    }

    pub fn touch(&mut self) {
        self.last_modified = now();
    }
}

/// Explicit allow/deny between node pairs, overriding the network default
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NetworkAcl {
    pub network: String,
    #[serde(default)]
    pub rules: BTreeMap<Uuid, BTreeMap<Uuid, AclPolicy>>,
}

impl NetworkAcl {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            rules: BTreeMap::new(),
        }
    }

    /// Set the rule both ways
    pub fn set(&mut self, a: Uuid, b: Uuid, policy: AclPolicy) {
        self.rules.entry(a).or_default().insert(b, policy);
        self.rules.entry(b).or_default().insert(a, policy);
    }

    pub fn remove_node(&mut self, node: Uuid) {
        self.rules.remove(&node);
        for peers in self.rules.values_mut() {
            peers.remove(&node);
        }
    }

    /// Whether `a` and `b` may peer; deny wins when the two directions disagree.
    pub fn allows(&self, default: AclPolicy, a: Uuid, b: Uuid) -> bool {
        let forward = self.rules.get(&a).and_then(|m| m.get(&b)).copied();
        let backward = self.rules.get(&b).and_then(|m| m.get(&a)).copied();
        match (forward, backward) {
            (Some(AclPolicy::Deny), _) | (_, Some(AclPolicy::Deny)) => false,
            (Some(AclPolicy::Allow), _) | (_, Some(AclPolicy::Allow)) => true,
            _ => default == AclPolicy::Allow,
        }
    }
}

// ============================================================================
// Ext-client
// ============================================================================

/// A thin WireGuard client attached to an ingress node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtClient {
    pub client_id: String,
    pub network: String,
    pub ingress_node_id: Uuid,
    pub address: Option<Ipv4Addr>,
    #[serde(default)]
    pub address6: Option<Ipv6Addr>,
    #[serde(default)]
    pub private_key: String,
    pub public_key: String,
    #[serde(default)]
    pub dns: Option<String>,
    #[serde(default)]
    pub extra_allowed_ips: Vec<IpNetwork>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub last_modified: i64,
}

fn default_true() -> bool {
    true
}

impl ExtClient {
    /// Composite storage key `<net>.<id>`
    pub fn key(&self) -> String {
        ext_client_key(&self.network, &self.client_id)
    }

    pub fn address_networks(&self) -> Vec<IpNetwork> {
        let mut nets = Vec::new();
        if let Some(v4) = self.address {
            nets.push(IpNetwork::V4(Ipv4Network::from(v4)));
        }
        if let Some(v6) = self.address6 {
            nets.push(IpNetwork::V6(Ipv6Network::from(v6)));
        }
        nets
    }

    pub fn touch(&mut self) {
        self.last_modified = now();
    }
}

pub fn ext_client_key(network: &str, client_id: &str) -> String {
    format!("{}.{}", network, client_id)
}

// ============================================================================
// Enrollment keys
// ============================================================================

/// Token that authorizes creating nodes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrollmentKey {
    pub id: Uuid,
    pub value: String,
    pub networks: Vec<String>,
    /// 0 = unlimited
    pub uses_remaining: u32,
    #[serde(default)]
    pub expiration: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub created_at: i64,
}

impl EnrollmentKey {
    pub fn is_unlimited(&self) -> bool {
        self.uses_remaining == 0
    }

    pub fn is_expired_at(&self, at: i64) -> bool {
        matches!(self.expiration, Some(exp) if exp <= at)
    }

    pub fn covers(&self, network: &str) -> bool {
        self.networks.iter().any(|n| n == network)
    }
}

/// Bootstrap blob a client decodes to find the server and its key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrollmentToken {
    pub server: String,
    pub value: String,
}

// ============================================================================
// Users
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthSource {
    #[default]
    Basic,
    Oauth,
}

/// Dashboard / CLI user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub username: String,
    /// argon2id PHC string; empty for OAuth users
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_superadmin: bool,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub auth_source: AuthSource,
    #[serde(default)]
    pub created_at: i64,
}

impl User {
    pub fn is_privileged(&self) -> bool {
        self.is_admin || self.is_superadmin
    }

    pub fn can_access(&self, network: &str) -> bool {
        self.is_privileged() || self.networks.iter().any(|n| n == network)
    }

    pub fn redacted(&self) -> Self {
        let mut user = self.clone();
        user.password.clear();
        user
    }
}

// ============================================================================
// Server config
// ============================================================================

/// Broker flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerType {
    #[default]
    Mq,
    Emqx,
}

impl std::fmt::Display for BrokerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerType::Mq => write!(f, "mq"),
            BrokerType::Emqx => write!(f, "emqx"),
        }
    }
}

impl std::str::FromStr for BrokerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mq" | "mosquitto" => Ok(BrokerType::Mq),
            "emqx" => Ok(BrokerType::Emqx),
            other => Err(format!("unknown broker type: {}", other)),
        }
    }
}

/// What a host needs to talk to this server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServerConfig {
    pub server: String,
    pub api: String,
    pub broker: String,
    pub broker_type: BrokerType,
    pub version: String,
    /// Ed25519 verifying key (hex) for broker envelopes
    pub signing_key: String,
    #[serde(default)]
    pub broker_username: String,
    #[serde(default)]
    pub broker_password: String,
}

// ============================================================================
// Enrollment messages
// ============================================================================

/// First (and only) message a joining client sends on the register socket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMsg {
    pub register_host: Host,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub join_all: bool,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub server_conf: ServerConfig,
    pub requested_host: Host,
}

// ============================================================================
// Host actions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostAction {
    #[serde(rename = "UPGRADE")]
    Upgrade,
    #[serde(rename = "SIGNAL_HOST")]
    SignalHost,
    #[serde(rename = "UPDATE_HOST")]
    UpdateHost,
    #[serde(rename = "DELETE_HOST")]
    DeleteHost,
    #[serde(rename = "JOIN_HOST_TO_NETWORK")]
    JoinHostToNetwork,
    #[serde(rename = "ACK")]
    Ack,
    #[serde(rename = "REQ_ACK")]
    RequestAck,
    #[serde(rename = "CHECK_IN")]
    CheckIn,
    #[serde(rename = "UPDATE_KEYS")]
    UpdateKeys,
    #[serde(rename = "REQ_PULL")]
    RequestPull,
    #[serde(rename = "SIGNAL_PULL")]
    SignalPull,
}

/// Signal a host raises about one of its peers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Signal {
    #[serde(default)]
    pub from_node_id: Option<Uuid>,
    #[serde(default)]
    pub to_node_id: Option<Uuid>,
    #[serde(default)]
    pub failover_peer: bool,
}

/// Host action message, exchanged both ways on `host/update/...` and `/api/v1/update`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostUpdate {
    pub action: HostAction,
    #[serde(default)]
    pub host: Option<Host>,
    #[serde(default)]
    pub node: Option<Node>,
    #[serde(default)]
    pub signal: Option<Signal>,
}

impl HostUpdate {
    pub fn new(action: HostAction) -> Self {
        Self {
            action,
            host: None,
            node: None,
            signal: None,
        }
    }

    pub fn with_host(mut self, host: Host) -> Self {
        self.host = Some(host.redacted());
        self
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.node = Some(node);
        self
    }
}

/// Fleet-wide message on `host/serverupdate/{server}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerUpdate {
    pub action: HostAction,
    #[serde(default)]
    pub version: String,
}

// ============================================================================
// Peer views
// ============================================================================

/// One WireGuard peer as seen by a viewer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerEntry {
    pub host_id: Uuid,
    /// Nodes represented by this entry: the peer itself plus anything folded into it
    pub node_ids: Vec<Uuid>,
    pub public_key: String,
    pub endpoint: Option<SocketAddr>,
    pub address: Option<Ipv4Addr>,
    pub allowed_ips: Vec<IpNetwork>,
    pub persistent_keepalive: u16,
    #[serde(default)]
    pub is_relay: bool,
    #[serde(default)]
    pub is_failover: bool,
}

/// Peer list of one node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PeerSet {
    pub network: String,
    pub node_id: Uuid,
    pub peers: Vec<PeerEntry>,
}

impl PeerSet {
    pub fn peer(&self, host_id: Uuid) -> Option<&PeerEntry> {
        self.peers.iter().find(|p| p.host_id == host_id)
    }
}

/// An ext-client as a peer of its ingress host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtPeerEntry {
    pub client_id: String,
    pub public_key: String,
    pub allowed_ips: Vec<IpNetwork>,
}

/// Payload published on `peers/host/{host-id}/{server}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HostPeerUpdate {
    pub host_id: Uuid,
    pub server: String,
    pub server_version: String,
    /// Peers merged across every network the host is in, keyed by public key
    pub peers: Vec<PeerEntry>,
    /// Per-network views
    pub networks: BTreeMap<String, PeerSet>,
    #[serde(default)]
    pub ext_peers: Vec<ExtPeerEntry>,
    /// Set when only `ext_peers` is meaningful
    #[serde(default)]
    pub ext_only: bool,
}

// ============================================================================
// Name validation
// ============================================================================

/// Accepts exactly `^[A-Za-z0-9-]+$`
pub fn validate_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_validate_name_examples() {
        assert!(validate_name("skynet"));
        assert!(validate_name("c-1"));
        assert!(validate_name("ABC-def-123"));
        assert!(!validate_name(""));
        assert!(!validate_name("has space"));
        assert!(!validate_name("under_score"));
        assert!(!validate_name("dot.ted"));
        assert!(!validate_name("ünï"));
    }

    proptest! {
        #[test]
        fn validate_name_accepts_charset(name in "[A-Za-z0-9-]{1,40}") {
            prop_assert!(validate_name(&name));
        }

        #[test]
        fn validate_name_rejects_foreign_chars(
            prefix in "[A-Za-z0-9-]{0,10}",
            bad in "[^A-Za-z0-9-]",
            suffix in "[A-Za-z0-9-]{0,10}",
        ) {
            let name = format!("{}{}{}", prefix, bad, suffix);
            prop_assert!(!validate_name(&name));
        }
    }

    #[test]
    fn test_acl_deny_wins() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut acl = NetworkAcl::new("skynet");
        assert!(acl.allows(AclPolicy::Allow, a, b));
        assert!(!acl.allows(AclPolicy::Deny, a, b));

        acl.set(a, b, AclPolicy::Allow);
        assert!(acl.allows(AclPolicy::Deny, a, b));

        acl.rules.entry(b).or_default().insert(a, AclPolicy::Deny);
        assert!(!acl.allows(AclPolicy::Allow, a, b));

        acl.remove_node(b);
        assert!(acl.allows(AclPolicy::Allow, a, b));
    }

    #[test]
    fn test_host_action_wire_names() {
        let json = serde_json::to_string(&HostAction::JoinHostToNetwork).unwrap();
        assert_eq!(json, "\"JOIN_HOST_TO_NETWORK\"");
        let parsed: HostAction = serde_json::from_str("\"REQ_ACK\"").unwrap();
        assert_eq!(parsed, HostAction::RequestAck);
    }

    #[test]
    fn test_host_redaction() {
        let mut host = Host::new("laptop");
        host.host_pass = "secret".to_string();
        let json = serde_json::to_value(host.redacted()).unwrap();
        assert!(json.get("host_pass").is_none());
    }

    #[test]
    fn test_endpoint_prefers_v4() {
        let mut host = Host::new("gw");
        assert!(host.endpoint().is_none());
        host.endpoint_ipv6 = Some("2001:db8::1".parse().unwrap());
        host.listen_port = 51820;
        assert_eq!(host.endpoint().unwrap().to_string(), "[2001:db8::1]:51820");
        host.endpoint_ip = Some("198.51.100.5".parse().unwrap());
        assert_eq!(host.endpoint().unwrap().to_string(), "198.51.100.5:51820");
    }
}
