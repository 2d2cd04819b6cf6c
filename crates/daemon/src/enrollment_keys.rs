//! Enrollment-key store

use crate::allocator::generate_key;
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use tracing::{debug, info};
use uuid::Uuid;
use wgmesh_common::{
    crypto::constant_time_eq,
    db::{tables, Database},
    EnrollmentKey, EnrollmentToken, Error, Result,
};

/// Length of generated key values
pub const KEY_VALUE_LEN: usize = 32;

/// Placeholder shown instead of key values when DISPLAY_KEYS is off
pub const HIDDEN_VALUE: &str = "(hidden)";

/// Parameters of a new key
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct KeyRequest {
    pub networks: Vec<String>,
    /// 0 = unlimited
    #[serde(default)]
    pub uses_remaining: u32,
    #[serde(default)]
    pub expiration: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Clone)]
pub struct EnrollmentKeyStore {
    db: Database,
}

impl EnrollmentKeyStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a key for existing networks. `server` is the API base embedded in the token.
    pub fn create(&self, req: KeyRequest, server: &str) -> Result<EnrollmentKey> {
        if req.networks.is_empty() {
            return Err(Error::validation("an enrollment key needs at least one network"));
        }
        let now = chrono::Utc::now().timestamp();
        if matches!(req.expiration, Some(exp) if exp <= now) {
            return Err(Error::validation("expiration is in the past"));
        }
        for network in &req.networks {
            if !self.db.exists(tables::NETWORKS, network)? {
                return Err(Error::not_found("network", network));
            }
        }

        let value = generate_key(KEY_VALUE_LEN);
        let key = EnrollmentKey {
            id: Uuid::new_v4(),
            token: tokenize(&value, server)?,
            value,
            networks: req.networks,
            uses_remaining: req.uses_remaining,
            expiration: req.expiration,
            tags: req.tags,
            created_at: now,
        };
        self.db
            .create(tables::ENROLLMENT_KEYS, &key.id.to_string(), &key)?;

        info!(
            "Created enrollment key {} for {:?} (uses: {})",
            key.id, key.networks, key.uses_remaining
        );
        Ok(key)
    }

    pub fn get(&self, id: Uuid) -> Result<EnrollmentKey> {
        self.db
            .get(tables::ENROLLMENT_KEYS, &id.to_string())?
            .ok_or_else(|| Error::not_found("enrollment key", id))
    }

    /// All keys; values are masked unless `display_keys`
    pub fn list(&self, display_keys: bool) -> Result<Vec<EnrollmentKey>> {
        let mut keys: Vec<EnrollmentKey> = self.db.list(tables::ENROLLMENT_KEYS)?;
        if !display_keys {
            for key in &mut keys {
                key.value = HIDDEN_VALUE.to_string();
                key.token = HIDDEN_VALUE.to_string();
            }
        }
        Ok(keys)
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        if !self.db.delete(tables::ENROLLMENT_KEYS, &id.to_string())? {
            return Err(Error::not_found("enrollment key", id));
        }
        info!("Deleted enrollment key {}", id);
        Ok(())
    }

    /// Resolve an unexpired key by value
    pub fn resolve(&self, value: &str) -> Result<EnrollmentKey> {
        let keys: Vec<EnrollmentKey> = self.db.list(tables::ENROLLMENT_KEYS)?;
        let now = chrono::Utc::now().timestamp();

        // compare against every key so timing does not reveal the match position
        let mut found = None;
        for key in keys {
            if constant_time_eq(&key.value, value) && found.is_none() {
                found = Some(key);
            }
        }

        match found {
            Some(key) if key.is_expired_at(now) => {
                debug!("Enrollment key {} expired", key.id);
                Err(Error::InvalidKey)
            }
            Some(key) => Ok(key),
            None => Err(Error::InvalidKey),
        }
    }

    /// Resolve a key value that is usable for `network`
    pub fn validate(&self, value: &str, network: &str) -> Result<EnrollmentKey> {
        let key = self.resolve(value)?;
        if !key.covers(network) {
            debug!("Enrollment key {} does not cover {}", key.id, network);
            return Err(Error::InvalidKey);
        }
        Ok(key)
    }

    /// Spend one use of `key`. Bounded keys are deleted when their last use is spent.
    pub fn consume(&self, key: &EnrollmentKey) -> Result<()> {
        if key.is_unlimited() {
            return Ok(());
        }

        let id = key.id.to_string();
        self.db.batch(|tx| {
            let mut current: EnrollmentKey = tx
                .get(tables::ENROLLMENT_KEYS, &id)?
                .ok_or(Error::InvalidKey)?;
            current.uses_remaining = current.uses_remaining.saturating_sub(1);
            if current.uses_remaining == 0 {
                tx.delete(tables::ENROLLMENT_KEYS, &id)?;
                debug!("Enrollment key {} used up", id);
            } else {
                tx.put(tables::ENROLLMENT_KEYS, &id, &current)?;
            }
            Ok(())
        })
    }

    /// Give back a use spent by [`consume`](Self::consume)
    pub fn release(&self, key: &EnrollmentKey) -> Result<()> {
        if key.is_unlimited() {
            return Ok(());
        }

        let id = key.id.to_string();
        self.db.batch(|tx| {
            let restored = match tx.get::<EnrollmentKey>(tables::ENROLLMENT_KEYS, &id)? {
                Some(mut current) => {
                    current.uses_remaining += 1;
                    current
                }
                None => EnrollmentKey {
                    uses_remaining: 1,
                    ..key.clone()
                },
            };
            tx.put(tables::ENROLLMENT_KEYS, &id, &restored)
        })
    }
}

/// Opaque bootstrap blob: URL-safe base64 of `{server, value}`
pub fn tokenize(value: &str, server: &str) -> Result<String> {
    let token = EnrollmentToken {
        server: server.to_string(),
        value: value.to_string(),
    };
    Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(&token)?))
}

pub fn untokenize(token: &str) -> Result<EnrollmentToken> {
    let token = token.trim();
    let raw = URL_SAFE_NO_PAD
        .decode(token)
        .or_else(|_| STANDARD.decode(token))
        .map_err(|_| Error::InvalidKey)?;
    serde_json::from_slice(&raw).map_err(|_| Error::InvalidKey)
}
