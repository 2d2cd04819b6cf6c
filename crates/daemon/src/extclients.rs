//! Ext-client manager
//!
//! Thin WireGuard clients terminate on an ingress node. They are stored under
//! `<network>.<client_id>` and rendered as wg-quick configs, QR codes or JSON.

use crate::allocator::{allocate_address, generate_name, UsedAddresses};
use crate::publish::Publisher;
use crate::state::{RegistryTx, StateManager};
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use ipnetwork::IpNetwork;
use qrcode::{Color, QrCode};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::io::Cursor;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;
use wgmesh_common::{
    crypto, db::tables, ext_client_key, peers::overlaps, validate_name, Error, ExtClient, Result,
    DEFAULT_KEEPALIVE,
};

/// Pixels per QR module
const QR_SCALE: u32 = 8;
/// Quiet zone around the code, in modules
const QR_BORDER: u32 = 4;
const NAME_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtClientRequest {
    #[serde(default)]
    pub client_id: Option<String>,
    /// When set the client keeps its own private key
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub dns: Option<String>,
    #[serde(default)]
    pub extra_allowed_ips: Vec<IpNetwork>,
    #[serde(default)]
    pub owner_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtClientUpdate {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub dns: Option<String>,
    #[serde(default)]
    pub extra_allowed_ips: Option<Vec<IpNetwork>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Conf,
    Qr,
    Json,
}

impl FromStr for ConfigFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "conf" | "file" => Ok(ConfigFormat::Conf),
            "qr" => Ok(ConfigFormat::Qr),
            "json" => Ok(ConfigFormat::Json),
            other => Err(Error::validation(format!("unknown config format {:?}", other))),
        }
    }
}

/// A rendered client configuration ready to serve
#[derive(Debug, Clone)]
pub struct RenderedConfig {
    pub content_type: &'static str,
    pub filename: String,
    pub body: Vec<u8>,
}

/// Everything a client needs to reach its ingress
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClientConfig {
    pub client_id: String,
    pub network: String,
    pub address: Option<IpNetwork>,
    pub address6: Option<IpNetwork>,
    pub private_key: String,
    pub dns: Option<String>,
    pub mtu: Option<u16>,
    pub peer_public_key: String,
    pub allowed_ips: Vec<IpNetwork>,
    pub endpoint: Option<String>,
    pub persistent_keepalive: u16,
}

impl ClientConfig {
    /// wg-quick representation
    pub fn to_wg_quick(&self) -> String {
        let mut out = String::from("[Interface]\n");
        let addresses: Vec<String> = self
            .address
            .iter()
            .chain(self.address6.iter())
            .map(|a| a.to_string())
            .collect();
        if !addresses.is_empty() {
            let _ = writeln!(out, "Address = {}", addresses.join(", "));
        }
        if !self.private_key.is_empty() {
            let _ = writeln!(out, "PrivateKey = {}", self.private_key);
        }
        if let Some(mtu) = self.mtu {
            let _ = writeln!(out, "MTU = {}", mtu);
        }
        if let Some(dns) = &self.dns {
            let _ = writeln!(out, "DNS = {}", dns);
        }

        out.push_str("\n[Peer]\n");
        let _ = writeln!(out, "PublicKey = {}", self.peer_public_key);
        let allowed: Vec<String> = self.allowed_ips.iter().map(|n| n.to_string()).collect();
        let _ = writeln!(out, "AllowedIPs = {}", allowed.join(", "));
        if let Some(endpoint) = &self.endpoint {
            let _ = writeln!(out, "Endpoint = {}", endpoint);
        }
        let _ = writeln!(out, "PersistentKeepalive = {}", self.persistent_keepalive);
        out
    }
}

#[derive(Clone)]
pub struct ExtClientManager {
    state: StateManager,
    publisher: Publisher,
}

impl ExtClientManager {
    pub fn new(state: StateManager, publisher: Publisher) -> Self {
        Self { state, publisher }
    }

    pub fn create(&self, ingress_id: Uuid, req: ExtClientRequest) -> Result<ExtClient> {
        if let Some(id) = &req.client_id {
            if !validate_name(id) {
                return Err(Error::validation(format!("invalid client id {:?}", id)));
            }
        }
        let (private_key, public_key) = match &req.public_key {
            Some(key) if !crypto::is_valid_wireguard_key(key) => {
                return Err(Error::validation("invalid WireGuard public key"));
            }
            Some(key) => (String::new(), key.clone()),
            None => {
                let pair = crypto::generate_wireguard_keypair();
                (pair.private_key, pair.public_key)
            }
        };

        let client = self.state.db().batch(|tx| {
            let ingress = tx.node(ingress_id)?;
            if !ingress.is_ingress {
                return Err(Error::validation(format!(
                    "node {} is not an ingress gateway",
                    ingress_id
                )));
            }
            let network = tx.network(&ingress.network)?;
            let existing = tx.ext_clients_in(&network.id)?;

            let client_id = match &req.client_id {
                Some(id) => {
                    if existing.iter().any(|c| c.client_id == *id) {
                        return Err(Error::already_exists("ext client", id));
                    }
                    id.clone()
                }
                None => (0..NAME_ATTEMPTS)
                    .map(|_| generate_name())
                    .find(|name| !existing.iter().any(|c| c.client_id == *name))
                    .ok_or_else(|| Error::Internal("could not generate a client id".into()))?,
            };

            let nodes = tx.nodes_in(&network.id)?;
            let (address, address6) =
                allocate_address(&network, &UsedAddresses::collect(&nodes, &existing))?;

            let mut client = ExtClient {
                client_id,
                network: network.id.clone(),
                ingress_node_id: ingress.id,
                address: Some(address),
                address6,
                private_key: private_key.clone(),
                public_key: public_key.clone(),
                dns: req.dns.clone().filter(|d| !d.is_empty()),
                extra_allowed_ips: req.extra_allowed_ips.clone(),
                enabled: true,
                owner_id: req.owner_id.clone(),
                last_modified: 0,
            };
            client.touch();
            tx.create(tables::EXT_CLIENTS, &client.key(), &client)?;
            Ok(client)
        })?;

        info!(
            "Created ext-client {} on ingress {} ({:?})",
            client.client_id, ingress_id, client.address
        );
        self.announce(&client);
        Ok(client)
    }

    /// Rename, toggle or re-route a client. A rename moves the record to its new key.
    pub fn update(
        &self,
        network: &str,
        client_id: &str,
        req: ExtClientUpdate,
    ) -> Result<ExtClient> {
        if let Some(id) = &req.client_id {
            if !validate_name(id) {
                return Err(Error::validation(format!("invalid client id {:?}", id)));
            }
        }

        let (client, changed) = self.state.db().batch(|tx| {
            let key = ext_client_key(network, client_id);
            let mut client: ExtClient = tx
                .get(tables::EXT_CLIENTS, &key)?
                .ok_or_else(|| Error::not_found("ext client", &key))?;
            let before = client.clone();

            if let Some(enabled) = req.enabled {
                client.enabled = enabled;
            }
            if let Some(dns) = &req.dns {
                client.dns = Some(dns.clone()).filter(|d| !d.is_empty());
            }
            if let Some(extra) = &req.extra_allowed_ips {
                client.extra_allowed_ips = extra.clone();
            }
            client.touch();

            match req.client_id.as_deref() {
                Some(new_id) if new_id != client_id => {
                    client.client_id = new_id.to_string();
                    if tx.get::<ExtClient>(tables::EXT_CLIENTS, &client.key())?.is_some() {
                        return Err(Error::already_exists("ext client", client.key()));
                    }
                    tx.delete(tables::EXT_CLIENTS, &key)?;
                    tx.create(tables::EXT_CLIENTS, &client.key(), &client)?;
                }
                _ => tx.put(tables::EXT_CLIENTS, &key, &client)?,
            }

            let changed = before.enabled != client.enabled
                || before.client_id != client.client_id
                || before.extra_allowed_ips != client.extra_allowed_ips;
            Ok((client, changed))
        })?;

        debug!("Updated ext-client {} in {}", client.client_id, network);
        if changed {
            self.announce(&client);
        }
        Ok(client)
    }

    pub fn delete(&self, network: &str, client_id: &str) -> Result<ExtClient> {
        let key = ext_client_key(network, client_id);
        let client = self.state.get_ext_client(network, client_id)?;
        self.state.db().delete(tables::EXT_CLIENTS, &key)?;

        info!("Deleted ext-client {} from {}", client_id, network);
        self.announce(&client);
        Ok(client)
    }

    /// Configuration for the client side of the tunnel
    pub fn client_config(&self, network: &str, client_id: &str) -> Result<ClientConfig> {
        let client = self.state.get_ext_client(network, client_id)?;
        let ingress = self.state.get_node(client.ingress_node_id)?;
        let host = self.state.get_host(ingress.host_id)?;
        let net = self.state.get_network(network)?;

        let mut allowed_ips = net.ranges();
        for node in self.state.nodes_in(network)? {
            if !node.is_egress {
                continue;
            }
            for range in node.egress_ranges {
                let shadowed = allowed_ips.iter().any(|known| overlaps(known, &range));
                if !shadowed {
                    allowed_ips.push(range);
                }
            }
        }

        let keepalive = ingress
            .persistent_keepalive
            .or(Some(net.default_keepalive).filter(|k| *k > 0))
            .unwrap_or(DEFAULT_KEEPALIVE);
        let dns = client
            .dns
            .clone()
            .or(ingress.ingress_dns.clone())
            .or(net.default_dns.clone());

        Ok(ClientConfig {
            client_id: client.client_id.clone(),
            network: network.to_string(),
            address: client.address.map(|a| IpNetwork::V4(a.into())),
            address6: client.address6.map(|a| IpNetwork::V6(a.into())),
            private_key: client.private_key.clone(),
            dns,
            mtu: host.mtu,
            peer_public_key: host.public_key.clone(),
            allowed_ips,
            endpoint: host.endpoint().map(|e| e.to_string()),
            persistent_keepalive: keepalive,
        })
    }

    pub fn render_config(
        &self,
        network: &str,
        client_id: &str,
        format: ConfigFormat,
    ) -> Result<RenderedConfig> {
        let config = self.client_config(network, client_id)?;
        match format {
            ConfigFormat::Conf => Ok(RenderedConfig {
                content_type: "text/plain; charset=utf-8",
                filename: format!("{}.conf", client_id),
                body: config.to_wg_quick().into_bytes(),
            }),
            ConfigFormat::Qr => Ok(RenderedConfig {
                content_type: "image/png",
                filename: format!("{}.png", client_id),
                body: render_qr(&config.to_wg_quick())?,
            }),
            ConfigFormat::Json => Ok(RenderedConfig {
                content_type: "application/json",
                filename: format!("{}.json", client_id),
                body: serde_json::to_vec_pretty(&config)?,
            }),
        }
    }

    fn announce(&self, client: &ExtClient) {
        self.publisher.ext_peer_update(client.ingress_node_id);
        // the other peers route the client's address through the ingress
        self.publisher.peer_update(&client.network);
    }
}

/// PNG of a QR code encoding `text`
pub fn render_qr(text: &str) -> Result<Vec<u8>> {
    let code = QrCode::new(text.as_bytes())
        .map_err(|e| Error::Internal(format!("QR encoding failed: {}", e)))?;
    let width = code.width() as u32;
    let colors = code.to_colors();
    let side = (width + 2 * QR_BORDER) * QR_SCALE;

    let image = GrayImage::from_fn(side, side, |x, y| {
        let (mx, my) = (x / QR_SCALE, y / QR_SCALE);
        let inside = (QR_BORDER..QR_BORDER + width).contains(&mx)
            && (QR_BORDER..QR_BORDER + width).contains(&my);
        if !inside {
            return Luma([255]);
        }
        let index = ((my - QR_BORDER) * width + (mx - QR_BORDER)) as usize;
        match colors.get(index) {
            Some(Color::Dark) => Luma([0]),
            _ => Luma([255]),
        }
    });

    let mut png = Vec::new();
    DynamicImage::ImageLuma8(image)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| Error::Internal(format!("PNG encoding failed: {}", e)))?;
    Ok(png)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::publish::{MemoryBroker, PublishEngine};
    use crate::state::tests::host_with_endpoint;
    use crate::topology::{IngressRequest, Topology};
    use crate::failover::FailoverController;
    use std::sync::Arc;
    use wgmesh_common::{Network, Node};

    struct Fixture {
        state: StateManager,
        manager: ExtClientManager,
        publisher: Publisher,
        ingress: Node,
    }

    fn fixture() -> Fixture {
        let state = StateManager::in_memory(DaemonConfig::default()).unwrap();
        state
            .create_network(Network::new("skynet", "10.0.0.0/24".parse().unwrap()))
            .unwrap();
        let (_engine, publisher) = PublishEngine::new(state.clone(), Arc::new(MemoryBroker::new()));
        let topology = Topology::new(
            state.clone(),
            publisher.clone(),
            FailoverController::new(state.clone(), publisher.clone()),
        );

        let host = host_with_endpoint(&state, "gateway", 5);
        let (node, _) = state.add_host_to_network(host.id, "skynet").unwrap();
        let ingress = topology
            .create_ingress(node.id, IngressRequest::default())
            .unwrap();
        Fixture {
            manager: ExtClientManager::new(state.clone(), publisher.clone()),
            state,
            publisher,
            ingress,
        }
    }

    fn named(id: &str) -> ExtClientRequest {
        ExtClientRequest {
            client_id: Some(id.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_allocates_after_nodes() {
        let f = fixture();
        let client = f.manager.create(f.ingress.id, named("c1")).unwrap();
        assert_eq!(client.address, Some("10.0.0.2".parse().unwrap()));
        assert!(!client.private_key.is_empty());
        assert_eq!(
            crypto::wireguard_public_key(&client.private_key).unwrap(),
            client.public_key
        );

        let generated = f.manager.create(f.ingress.id, ExtClientRequest::default()).unwrap();
        assert!(validate_name(&generated.client_id));
        assert_eq!(generated.address, Some("10.0.0.3".parse().unwrap()));

        assert!(matches!(
            f.manager.create(f.ingress.id, named("c1")),
            Err(Error::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_create_requires_ingress() {
        let f = fixture();
        let host = host_with_endpoint(&f.state, "plain", 6);
        let (plain, _) = f.state.add_host_to_network(host.id, "skynet").unwrap();
        assert!(matches!(
            f.manager.create(plain.id, named("c1")),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            f.manager.create(f.ingress.id, named("bad id")),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_rename_moves_record() {
        let f = fixture();
        f.manager.create(f.ingress.id, named("c1")).unwrap();
        let renamed = f
            .manager
            .update(
                "skynet",
                "c1",
                ExtClientUpdate {
                    client_id: Some("laptop".into()),
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(renamed.client_id, "laptop");
        assert!(!renamed.enabled);
        assert!(f.state.get_ext_client("skynet", "c1").is_err());
        assert_eq!(
            f.state.get_ext_client("skynet", "laptop").unwrap().address,
            renamed.address
        );

        // a disabled client is not an ext-peer
        let snapshot = f.state.snapshot().unwrap();
        assert!(wgmesh_common::peers::compute_ext_peers(&snapshot, f.ingress.id).is_empty());
    }

    #[test]
    fn test_delete_announces() {
        let f = fixture();
        f.manager.create(f.ingress.id, named("c1")).unwrap();
        let before = f.publisher.pending();
        f.manager.delete("skynet", "c1").unwrap();
        assert!(f.publisher.pending() > before);
        assert!(matches!(
            f.manager.delete("skynet", "c1"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_render_wg_quick() {
        let f = fixture();
        f.state
            .update_host(f.ingress.host_id, |h| {
                h.endpoint_ip = Some("198.51.100.5".parse().unwrap());
                h.listen_port = 51820;
                Ok(())
            })
            .unwrap();
        f.manager.create(f.ingress.id, named("c1")).unwrap();
        f.state
            .db()
            .update(tables::EXT_CLIENTS, "skynet.c1", |c: &mut ExtClient| {
                c.address = Some("10.0.0.50".parse().unwrap());
                c.private_key = "K".into();
                Ok(())
            })
            .unwrap();

        let host = f.state.get_host(f.ingress.host_id).unwrap();
        let rendered = f
            .manager
            .render_config("skynet", "c1", ConfigFormat::Conf)
            .unwrap();
        let text = String::from_utf8(rendered.body).unwrap();

        assert!(text.contains("Address = 10.0.0.50/32"));
        assert!(text.contains("PrivateKey = K"));
        assert!(text.contains(&format!("PublicKey = {}", host.public_key)));
        assert!(text.contains("AllowedIPs = 10.0.0.0/24"));
        assert!(text.contains("Endpoint = 198.51.100.5:51820"));
        assert!(text.contains("PersistentKeepalive = 20"));
    }

    #[test]
    fn test_render_qr_and_json() {
        let f = fixture();
        f.manager.create(f.ingress.id, named("c1")).unwrap();

        let png = f
            .manager
            .render_config("skynet", "c1", ConfigFormat::Qr)
            .unwrap();
        assert_eq!(png.content_type, "image/png");
        assert_eq!(&png.body[1..4], b"PNG");

        let json = f
            .manager
            .render_config("skynet", "c1", ConfigFormat::Json)
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json.body).unwrap();
        assert_eq!(value["client_id"], "c1");
    }

    #[test]
    fn test_format_names() {
        assert_eq!("file".parse::<ConfigFormat>().unwrap(), ConfigFormat::Conf);
        assert_eq!("qr".parse::<ConfigFormat>().unwrap(), ConfigFormat::Qr);
        assert!("svg".parse::<ConfigFormat>().is_err());
    }
}
