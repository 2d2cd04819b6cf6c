//! Short-lived rendezvous store between OAuth callbacks and waiting WebSocket sessions
//!
//! Each pending enrollment carries a [`Notify`] so a completed callback wakes its waiter
//! immediately. Waiters also poll every 500 ms, which covers a notification that fired
//! before they started listening.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use wgmesh_common::{Error, Host, Result};

/// Fallback poll interval of [`SessionCache::wait_for_completion`]
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Which flow is waiting on the entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    HostJoin,
    NodeSso,
    Headless,
}

/// Status slot written by the callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    /// Host id, JWT, or `AccessToken: <jwt>` depending on the kind
    Completed(String),
    Failed(String),
}

impl SessionStatus {
    pub fn is_done(&self) -> bool {
        !matches!(self, SessionStatus::Pending)
    }
}

/// One in-flight enrollment
#[derive(Debug, Clone)]
pub struct PendingEnrollment {
    pub kind: SessionKind,
    pub host: Option<Host>,
    pub network: Option<String>,
    pub join_all: bool,
    /// Hint from the client before login, the authenticated principal after
    pub user: Option<String>,
    pub status: SessionStatus,
}

impl PendingEnrollment {
    pub fn new(kind: SessionKind) -> Self {
        Self {
            kind,
            host: None,
            network: None,
            join_all: false,
            user: None,
            status: SessionStatus::Pending,
        }
    }
}

struct Entry {
    value: PendingEnrollment,
    expires_at: Instant,
    notify: Arc<Notify>,
}

/// Concurrent map from OAuth `state` to pending enrollment
#[derive(Clone)]
pub struct SessionCache {
    entries: Arc<DashMap<String, Entry>>,
    ttl: Duration,
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn insert(&self, state: &str, value: PendingEnrollment) -> Result<()> {
        use dashmap::mapref::entry::Entry as Slot;

        match self.entries.entry(state.to_string()) {
            Slot::Occupied(_) => Err(Error::already_exists("session", state)),
            Slot::Vacant(slot) => {
                slot.insert(Entry {
                    value,
                    expires_at: Instant::now() + self.ttl,
                    notify: Arc::new(Notify::new()),
                });
                Ok(())
            }
        }
    }

    /// Read an entry; entries past their TTL are dropped and reported as `Expired`
    pub fn get(&self, state: &str) -> Result<PendingEnrollment> {
        match self.entries.get(state) {
            None => return Err(Error::not_found("session", state)),
            Some(entry) if entry.expires_at > Instant::now() => return Ok(entry.value.clone()),
            Some(_) => {}
        }
        self.entries.remove(state);
        Err(Error::Expired(format!("session {} expired", state)))
    }

    /// Atomic read-modify-write that resets the TTL and wakes the waiter
    pub fn update<F>(&self, state: &str, f: F) -> Result<PendingEnrollment>
    where
        F: FnOnce(&mut PendingEnrollment),
    {
        let updated = {
            let Some(mut entry) = self.entries.get_mut(state) else {
                return Err(Error::not_found("session", state));
            };
            if entry.expires_at <= Instant::now() {
                None
            } else {
                f(&mut entry.value);
                entry.expires_at = Instant::now() + self.ttl;
                entry.notify.notify_one();
                Some(entry.value.clone())
            }
        };

        match updated {
            Some(value) => Ok(value),
            None => {
                self.entries.remove(state);
                Err(Error::Expired(format!("session {} expired", state)))
            }
        }
    }

    pub fn remove(&self, state: &str) -> Option<PendingEnrollment> {
        self.entries.remove(state).map(|(_, entry)| entry.value)
    }

    /// Drop entries past their TTL
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let purged = before - self.entries.len();
        if purged > 0 {
            debug!("Purged {} expired session(s)", purged);
        }
        purged
    }

    /// Wait until the entry leaves `Pending` or `deadline` passes
    pub async fn wait_for_completion(
        &self,
        state: &str,
        deadline: Instant,
    ) -> Result<PendingEnrollment> {
        loop {
            let notify = {
                let Some(entry) = self.entries.get(state) else {
                    return Err(Error::not_found("session", state));
                };
                if entry.value.status.is_done() {
                    return Ok(entry.value.clone());
                }
                entry.notify.clone()
            };

            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    seconds: self.ttl.as_secs(),
                });
            }

            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Remove the entry for `state` when the returned guard drops
    pub fn guard(&self, state: &str) -> SessionGuard {
        SessionGuard {
            cache: self.clone(),
            state: state.to_string(),
        }
    }
}

/// Deletes its session entry on drop
pub struct SessionGuard {
    cache: SessionCache,
    state: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.cache.remove(&self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_join() -> PendingEnrollment {
        let mut pending = PendingEnrollment::new(SessionKind::HostJoin);
        pending.host = Some(Host::new("laptop"));
        pending
    }

    #[tokio::test]
    async fn test_insert_get_update() {
        let cache = SessionCache::new(Duration::from_secs(60));
        cache.insert("s1", pending_join()).unwrap();
        assert!(cache.insert("s1", pending_join()).is_err());

        let updated = cache
            .update("s1", |p| {
                p.user = Some("u@example".into());
                p.status = SessionStatus::Completed("host".into());
            })
            .unwrap();
        assert!(updated.status.is_done());
        assert_eq!(cache.get("s1").unwrap().user.as_deref(), Some("u@example"));

        assert!(matches!(cache.get("nope"), Err(Error::NotFound { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = SessionCache::new(Duration::from_secs(300));
        cache.insert("s1", pending_join()).unwrap();

        tokio::time::advance(Duration::from_secs(299)).await;
        // a write resets the TTL
        cache.update("s1", |p| p.user = Some("u".into())).unwrap();

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(cache.get("s1").is_ok());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(cache.get("s1"), Err(Error::Expired(_))));
        assert!(matches!(cache.get("s1"), Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_update() {
        let cache = SessionCache::new(Duration::from_secs(60));
        cache.insert("s1", pending_join()).unwrap();

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move {
                let deadline = Instant::now() + Duration::from_secs(10);
                cache.wait_for_completion("s1", deadline).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = std::time::Instant::now();
        cache
            .update("s1", |p| p.status = SessionStatus::Completed("done".into()))
            .unwrap();

        let done = waiter.await.unwrap().unwrap();
        assert_eq!(done.status, SessionStatus::Completed("done".into()));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let cache = SessionCache::new(Duration::from_secs(5));
        cache.insert("s1", pending_join()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let result = cache.wait_for_completion("s1", deadline).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_guard_removes_entry() {
        let cache = SessionCache::new(Duration::from_secs(60));
        cache.insert("s1", pending_join()).unwrap();
        {
            let _guard = cache.guard("s1");
        }
        assert!(cache.get("s1").is_err());
    }
}
