//! Publish engine
//!
//! Handlers enqueue [`PublishEvent`]s through a [`Publisher`] and return immediately.
//! A single [`PublishEngine`] task drains the queue, recomputes peer views from a
//! registry snapshot, and sends signed payloads to the broker.

pub mod broker;
pub mod engine;
pub mod queue;

pub use broker::{Broker, BrokerCredentials, MemoryBroker, MqttBroker};
pub use engine::{ConnectionState, PublishEngine, Publisher};
pub use queue::EventQueue;

use uuid::Uuid;
use wgmesh_common::{HostUpdate, ServerUpdate};

/// Work item for the publish engine
#[derive(Debug, Clone, PartialEq)]
pub enum PublishEvent {
    /// Recompute every host in `network`, or every host when `None`
    PeerUpdate { network: Option<String>, force: bool },
    /// Host action for one host
    HostUpdate { host_id: Uuid, update: HostUpdate },
    /// Only the ext-peer slice of an ingress host
    ExtPeerUpdate { ingress: Uuid },
    /// Recompute one host across all its networks
    SingleHostPeerUpdate { host_id: Uuid, force: bool },
    /// Fleet-wide broadcast
    ServerUpdate(ServerUpdate),
}

impl PublishEvent {
    /// The full refresh emitted after a reconnect
    pub fn full_refresh() -> Self {
        PublishEvent::PeerUpdate {
            network: None,
            force: true,
        }
    }

    pub fn is_refresh(&self) -> bool {
        matches!(self, PublishEvent::PeerUpdate { network: None, .. })
    }

    /// Peer recomputations are superseded by a full refresh; host actions are not
    pub fn survives_refresh(&self) -> bool {
        matches!(
            self,
            PublishEvent::HostUpdate { .. } | PublishEvent::ServerUpdate(_)
        )
    }
}

/// Broker topic layout
pub mod topics {
    use uuid::Uuid;

    pub fn peers(host_id: Uuid, server: &str) -> String {
        format!("peers/host/{}/{}", host_id, server)
    }

    pub fn host_update(host_id: Uuid, server: &str) -> String {
        format!("host/update/{}/{}", host_id, server)
    }

    pub fn server_update(server: &str) -> String {
        format!("host/serverupdate/{}", server)
    }
}
