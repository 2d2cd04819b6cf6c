//! Per-host queue of pending host actions, drained when the host polls

use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;
use wgmesh_common::HostUpdate;

#[derive(Clone, Default)]
pub struct HostActions {
    pending: Arc<DashMap<Uuid, Vec<HostUpdate>>>,
}

impl HostActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, host_id: Uuid, update: HostUpdate) {
        self.pending.entry(host_id).or_default().push(update);
    }

    /// Take every queued action for `host_id`, oldest first
    pub fn drain(&self, host_id: Uuid) -> Vec<HostUpdate> {
        self.pending
            .remove(&host_id)
            .map(|(_, updates)| updates)
            .unwrap_or_default()
    }

    pub fn pending(&self, host_id: Uuid) -> usize {
        self.pending.get(&host_id).map(|u| u.len()).unwrap_or(0)
    }

    pub fn forget(&self, host_id: Uuid) {
        self.pending.remove(&host_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgmesh_common::HostAction;

    #[test]
    fn test_drain_in_order() {
        let actions = HostActions::new();
        let host = Uuid::new_v4();
        actions.push(host, HostUpdate::new(HostAction::JoinHostToNetwork));
        actions.push(host, HostUpdate::new(HostAction::UpdateKeys));
        assert_eq!(actions.pending(host), 2);

        let drained = actions.drain(host);
        assert_eq!(drained[0].action, HostAction::JoinHostToNetwork);
        assert_eq!(drained[1].action, HostAction::UpdateKeys);
        assert!(actions.drain(host).is_empty());
    }

    #[test]
    fn test_hosts_are_independent() {
        let actions = HostActions::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        actions.push(a, HostUpdate::new(HostAction::CheckIn));
        actions.push(b, HostUpdate::new(HostAction::CheckIn));
        actions.forget(a);
        assert_eq!(actions.pending(a), 0);
        assert_eq!(actions.pending(b), 1);
    }
}
