//! Name records for mesh addresses
//!
//! Every node resolves as `<host-name>.<network>` and every ext-client as
//! `<client-id>.<network>`. With DNS mode on, the records are written to a hosts file
//! in the store directory every 30 seconds.

use crate::state::StateManager;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wgmesh_common::Result;

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsEntry {
    pub address: IpAddr,
    pub name: String,
    pub network: String,
}

/// Records of one network, or of every network
pub fn entries(state: &StateManager, network: Option<&str>) -> Result<Vec<DnsEntry>> {
    if let Some(network) = network {
        state.get_network(network)?;
    }
    let hosts: HashMap<_, _> = state
        .list_hosts()?
        .into_iter()
        .map(|h| (h.id, h.name))
        .collect();

    let mut entries = Vec::new();
    for node in state.list_nodes()? {
        if network.is_some_and(|n| n != node.network) {
            continue;
        }
        let Some(host_name) = hosts.get(&node.host_id) else {
            continue;
        };
        let name = format!("{}.{}", label(host_name), node.network);
        if let Some(v4) = node.address {
            entries.push(DnsEntry {
                address: v4.into(),
                name: name.clone(),
                network: node.network.clone(),
            });
        }
        if let Some(v6) = node.address6 {
            entries.push(DnsEntry {
                address: v6.into(),
                name,
                network: node.network.clone(),
            });
        }
    }
    for client in state.list_ext_clients(network)? {
        if let Some(v4) = client.address {
            entries.push(DnsEntry {
                address: v4.into(),
                name: format!("{}.{}", label(&client.client_id), client.network),
                network: client.network.clone(),
            });
        }
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name).then(a.address.cmp(&b.address)));
    Ok(entries)
}

/// Lowercase DNS label; anything outside `[a-z0-9-]` becomes `-`
fn label(name: &str) -> String {
    name.to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

pub fn render_hosts(entries: &[DnsEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{} {}\n", e.address, e.name))
        .collect()
}

/// Rewrite `<store>/hosts`, replacing the file atomically
pub async fn write_hosts_file(state: &StateManager) -> Result<usize> {
    let entries = entries(state, None)?;
    let path = state.config().hosts_file_path();
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, render_hosts(&entries)).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(entries.len())
}

/// Regenerate the hosts file until shutdown
pub async fn run(state: StateManager, shutdown: CancellationToken) {
    info!(
        "DNS mode on, writing {}",
        state.config().hosts_file_path().display()
    );
    let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => match write_hosts_file(&state).await {
                Ok(count) => debug!("Wrote {} DNS record(s)", count),
                Err(e) => warn!("Failed to write hosts file: {}", e),
            },
        }
    }
}
