//! Identity and address allocation
//!
//! Addresses are handed out by scanning a network's CIDR in order from the first usable
//! address, so allocation is deterministic for a given registry state.

use ipnetwork::{Ipv4Network, Ipv6Network};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use wgmesh_common::{crypto, Error, ExtClient, Network, Node, Result};

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "calm", "dapper", "eager", "fancy", "gentle", "happy", "icy", "jolly",
    "keen", "lively", "merry", "nimble", "odd", "proud", "quick", "rapid", "silent", "tidy",
    "upbeat", "vivid", "witty", "young", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "cedar", "dingo", "falcon", "gecko", "heron", "ibis", "jackal", "koala",
    "lynx", "marten", "newt", "otter", "panda", "quokka", "raven", "stoat", "tapir", "urchin",
    "vole", "walrus", "yak", "zebra",
];

/// Addresses taken in a network by nodes and ext-clients
#[derive(Debug, Default, Clone)]
pub struct UsedAddresses {
    pub v4: HashSet<Ipv4Addr>,
    pub v6: HashSet<Ipv6Addr>,
}

impl UsedAddresses {
    pub fn collect<'a>(
        nodes: impl IntoIterator<Item = &'a Node>,
        ext_clients: impl IntoIterator<Item = &'a ExtClient>,
    ) -> Self {
        let mut used = Self::default();
        for node in nodes {
            used.v4.extend(node.address);
            used.v6.extend(node.address6);
        }
        for client in ext_clients {
            used.v4.extend(client.address);
            used.v6.extend(client.address6);
        }
        used
    }
}

/// First free IPv4 in `range`, skipping the network and broadcast addresses
pub fn next_ipv4(range: &Ipv4Network, used: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
    let base = u32::from(range.network()) as u64;
    let host_bits = 32 - u32::from(range.prefix());
    let size = 1u64 << host_bits;
    // RFC 3021: /31 and /32 have no network or broadcast address
    let (first, last) = if host_bits <= 1 { (0, size - 1) } else { (1, size - 2) };

    // one of the first used.len() + 1 candidates must be free
    let last = last.min(first + used.len() as u64);
    (first..=last)
        .map(|offset| Ipv4Addr::from((base + offset) as u32))
        .find(|candidate| !used.contains(candidate))
}

/// First free IPv6 in `range`, skipping the subnet-router anycast address
pub fn next_ipv6(range: &Ipv6Network, used: &HashSet<Ipv6Addr>) -> Option<Ipv6Addr> {
    let base = u128::from(range.network());
    let host_bits = 128 - u32::from(range.prefix());
    let last = if host_bits >= 128 {
        u128::MAX
    } else {
        (1u128 << host_bits) - 1
    };
    let first = if host_bits == 0 { 0 } else { 1 };

    let last = last.min(first + used.len() as u128);
    (first..=last)
        .map(|offset| Ipv6Addr::from(base + offset))
        .find(|candidate| !used.contains(candidate))
}

/// Allocate an IPv4 (and IPv6 on dual-stack networks) not used by any node or ext-client
pub fn allocate_address(
    network: &Network,
    used: &UsedAddresses,
) -> Result<(Ipv4Addr, Option<Ipv6Addr>)> {
    let v4 = next_ipv4(&network.address_range, &used.v4)
        .ok_or_else(|| Error::NoAddressesAvailable(network.id.clone()))?;
    let v6 = match &network.address_range6 {
        Some(range) => Some(
            next_ipv6(range, &used.v6)
                .ok_or_else(|| Error::NoAddressesAvailable(network.id.clone()))?,
        ),
        None => None,
    };
    Ok((v4, v6))
}

/// Check a caller-chosen IPv4 against the network and current assignments
pub fn reserve_ipv4(network: &Network, used: &UsedAddresses, addr: Ipv4Addr) -> Result<Ipv4Addr> {
    let range = &network.address_range;
    if !range.contains(addr) {
        return Err(Error::validation(format!(
            "{} is outside {}",
            addr, range
        )));
    }
    if range.prefix() <= 30 && (addr == range.network() || addr == range.broadcast()) {
        return Err(Error::validation(format!("{} is not a usable host address", addr)));
    }
    if used.v4.contains(&addr) {
        return Err(Error::conflict(format!("address {} is already in use", addr)));
    }
    Ok(addr)
}

/// Human-readable identifier matching `^[A-Za-z0-9-]+$`
pub fn generate_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("node");
    let suffix: u16 = rand::Rng::gen_range(&mut rng, 0..1000);
    format!("{}-{}-{}", adjective, noun, suffix)
}

/// URL-safe random secret
pub fn generate_key(len: usize) -> String {
    crypto::random_string(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use wgmesh_common::validate_name;

    fn skynet() -> Network {
        Network::new("skynet", "10.0.0.0/24".parse().unwrap())
    }

    #[test]
    fn test_first_allocation_then_next() {
        let network = skynet();
        let mut used = UsedAddresses::default();

        let (first, v6) = allocate_address(&network, &used).unwrap();
        assert_eq!(first, Ipv4Addr::new(10, 0, 0, 1));
        assert!(v6.is_none());

        used.v4.insert(first);
        let (second, _) = allocate_address(&network, &used).unwrap();
        assert_eq!(second, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn test_fills_gaps_in_order() {
        let network = skynet();
        let mut used = UsedAddresses::default();
        used.v4.insert(Ipv4Addr::new(10, 0, 0, 1));
        used.v4.insert(Ipv4Addr::new(10, 0, 0, 3));
        // outside the range, must not matter
        used.v4.insert(Ipv4Addr::new(192, 168, 0, 2));

        let (next, _) = allocate_address(&network, &used).unwrap();
        assert_eq!(next, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn test_saturated_network() {
        let network = Network::new("tiny", "10.9.0.0/30".parse().unwrap());
        let mut used = UsedAddresses::default();
        used.v4.insert(Ipv4Addr::new(10, 9, 0, 1));
        used.v4.insert(Ipv4Addr::new(10, 9, 0, 2));

        let err = allocate_address(&network, &used).unwrap_err();
        assert!(matches!(err, Error::NoAddressesAvailable(_)));
    }

    #[test]
    fn test_never_hands_out_broadcast() {
        let range: Ipv4Network = "10.0.0.0/29".parse().unwrap();
        let mut used = HashSet::new();
        while let Some(addr) = next_ipv4(&range, &used) {
            assert_ne!(addr, range.network());
            assert_ne!(addr, range.broadcast());
            used.insert(addr);
        }
        assert_eq!(used.len(), 6);
    }

    #[test]
    fn test_dual_stack() {
        let mut network = skynet();
        network.address_range6 = Some("fd00::/64".parse().unwrap());
        let mut used = UsedAddresses::default();

        let (_, v6) = allocate_address(&network, &used).unwrap();
        assert_eq!(v6, Some("fd00::1".parse().unwrap()));

        used.v6.insert("fd00::1".parse().unwrap());
        let (_, v6) = allocate_address(&network, &used).unwrap();
        assert_eq!(v6, Some("fd00::2".parse().unwrap()));
    }

    #[test]
    fn test_counts_ext_clients() {
        let network = skynet();
        let mut node = Node::new(uuid::Uuid::new_v4(), "skynet");
        node.address = Some(Ipv4Addr::new(10, 0, 0, 1));
        let client = ExtClient {
            client_id: "c1".into(),
            network: "skynet".into(),
            ingress_node_id: node.id,
            address: Some(Ipv4Addr::new(10, 0, 0, 2)),
            address6: None,
            private_key: String::new(),
            public_key: "k".into(),
            dns: None,
            extra_allowed_ips: Vec::new(),
            enabled: true,
            owner_id: None,
            last_modified: 0,
        };
        let used = UsedAddresses::collect([&node], [&client]);

        let (next, _) = allocate_address(&network, &used).unwrap();
        assert_eq!(next, Ipv4Addr::new(10, 0, 0, 3));
    }

    #[test]
    fn test_reserve_ipv4() {
        let network = skynet();
        let mut used = UsedAddresses::default();
        used.v4.insert(Ipv4Addr::new(10, 0, 0, 7));

        assert!(reserve_ipv4(&network, &used, Ipv4Addr::new(10, 0, 0, 8)).is_ok());
        assert!(matches!(
            reserve_ipv4(&network, &used, Ipv4Addr::new(10, 0, 0, 7)),
            Err(Error::Conflict(_))
        ));
        assert!(reserve_ipv4(&network, &used, Ipv4Addr::new(10, 0, 0, 255)).is_err());
        assert!(reserve_ipv4(&network, &used, Ipv4Addr::new(10, 0, 1, 1)).is_err());
    }

    #[test]
    fn test_generated_names_are_valid() {
        for _ in 0..50 {
            assert!(validate_name(&generate_name()));
        }
        assert_eq!(generate_key(24).len(), 24);
    }

    proptest! {
        #[test]
        fn allocations_are_distinct_and_usable(
            prefix in 26u8..=30,
            taken in proptest::collection::vec(0u32..64, 0..10),
        ) {
            let range = Ipv4Network::new(Ipv4Addr::new(10, 20, 0, 0), prefix).unwrap();
            let network = Network::new("prop", range);
            let mut used = UsedAddresses::default();
            for offset in &taken {
                if *offset < range.size() {
                    used.v4.insert(range.nth(*offset).unwrap());
                }
            }
            let preset = used.v4.clone();

            let mut handed_out = HashSet::new();
            while let Ok((addr, _)) = allocate_address(&network, &used) {
                prop_assert!(range.contains(addr));
                prop_assert_ne!(addr, range.network());
                prop_assert_ne!(addr, range.broadcast());
                prop_assert!(handed_out.insert(addr));
                used.v4.insert(addr);
            }

            let usable: HashSet<Ipv4Addr> = range
                .iter()
                .filter(|a| *a != range.network() && *a != range.broadcast())
                .collect();
            let expected: HashSet<Ipv4Addr> = usable.difference(&preset).copied().collect();
            prop_assert_eq!(handed_out, expected);
        }
    }
}
