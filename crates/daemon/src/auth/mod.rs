//! Caller authentication for the HTTP, WebSocket and gRPC surfaces

pub mod jwt;
pub mod password;
pub mod users;

pub use jwt::{Claims, JwtManager, Subject};
pub use users::{CreateUser, UserStore};

use crate::api::ApiError;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::{header, request::Parts};
use uuid::Uuid;
use wgmesh_common::{crypto::constant_time_eq, Error, Result, User};

/// Who is making a request
#[derive(Debug, Clone, PartialEq)]
pub enum Caller {
    /// Presented the master key
    Master,
    User(User),
    Host(Uuid),
    /// Network-scoped token from the node SSO flow
    Node { username: String, network: String },
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        match self {
            Caller::Master => true,
            Caller::User(user) => user.is_privileged(),
            _ => false,
        }
    }

    pub fn require_admin(&self) -> Result<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(Error::PermissionDenied("admin access required".into()))
        }
    }

    pub fn require_superadmin(&self) -> Result<()> {
        match self {
            Caller::Master => Ok(()),
            Caller::User(user) if user.is_superadmin => Ok(()),
            _ => Err(Error::PermissionDenied("superadmin access required".into())),
        }
    }

    pub fn require_network(&self, network: &str) -> Result<()> {
        let allowed = match self {
            Caller::Master => true,
            Caller::User(user) => user.can_access(network),
            Caller::Node { network: scope, .. } => scope == network,
            Caller::Host(_) => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!("no access to network {}", network)))
        }
    }

    /// The host itself or an admin
    pub fn require_host(&self, host_id: Uuid) -> Result<()> {
        match self {
            Caller::Host(id) if *id == host_id => Ok(()),
            caller if caller.is_admin() => Ok(()),
            _ => Err(Error::PermissionDenied(format!("no access to host {}", host_id))),
        }
    }
}

/// Resolves bearer tokens into callers
#[derive(Clone)]
pub struct Authenticator {
    jwt: JwtManager,
    users: UserStore,
    master_key: Option<String>,
}

impl Authenticator {
    pub fn new(jwt: JwtManager, users: UserStore, master_key: Option<String>) -> Self {
        Self {
            jwt,
            users,
            master_key: master_key.filter(|k| !k.is_empty()),
        }
    }

    pub fn jwt(&self) -> &JwtManager {
        &self.jwt
    }

    pub fn users(&self) -> &UserStore {
        &self.users
    }

    pub fn authenticate(&self, token: &str) -> Result<Caller> {
        if token.is_empty() {
            return Err(Error::Unauthorized("missing bearer token".into()));
        }
        if let Some(master) = &self.master_key {
            if constant_time_eq(token, master) {
                return Ok(Caller::Master);
            }
        }

        let claims = self.jwt.verify(token)?;
        match claims.kind {
            Subject::User => {
                let user = self
                    .users
                    .get(&claims.sub)
                    .map_err(|_| Error::Unauthorized("unknown user".into()))?;
                Ok(Caller::User(user))
            }
            Subject::Host => claims
                .host_id()
                .map(Caller::Host)
                .ok_or_else(|| Error::Unauthorized("malformed host token".into())),
            Subject::Node => Ok(Caller::Node {
                username: claims.sub,
                network: claims.network.unwrap_or_default(),
            }),
        }
    }

    /// Authenticate an `authorization` header value
    pub fn authenticate_header(&self, value: &str) -> Result<Caller> {
        self.authenticate(bearer(value))
    }
}

/// Token part of `Bearer <token>`; a bare token is accepted as is
pub fn bearer(value: &str) -> &str {
    let value = value.trim();
    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token.trim(),
        _ => value,
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
    Authenticator: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let auth = Authenticator::from_ref(state);
        let value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let caller = auth.authenticate_header(value)?;
        tracing::debug!("Authenticated {}", caller_label(&caller));
        Ok(caller)
    }
}

fn caller_label(caller: &Caller) -> String {
    match caller {
        Caller::Master => "master".to_string(),
        Caller::User(user) => format!("user {}", user.username),
        Caller::Host(id) => format!("host {}", id),
        Caller::Node { username, network } => format!("node token of {} for {}", username, network),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgmesh_common::Database;

    fn authenticator() -> Authenticator {
        let db = Database::open_memory().unwrap();
        let users = UserStore::new(db);
        users.create_superadmin("admin", "hunter22").unwrap();
        Authenticator::new(JwtManager::new(b"secret"), users, Some("master-key".into()))
    }

    #[test]
    fn test_bearer_parsing() {
        assert_eq!(bearer("Bearer abc"), "abc");
        assert_eq!(bearer("bearer  abc "), "abc");
        assert_eq!(bearer("abc"), "abc");
    }

    #[test]
    fn test_master_key() {
        let auth = authenticator();
        assert_eq!(auth.authenticate_header("Bearer master-key").unwrap(), Caller::Master);
        assert!(auth.authenticate("master-kex").is_err());
        assert!(auth.authenticate("").is_err());
    }

    #[test]
    fn test_user_and_host_tokens() {
        let auth = authenticator();
        let admin = auth.users().get("admin").unwrap();
        let token = auth.jwt().issue(&Claims::for_user(&admin)).unwrap();
        let caller = auth.authenticate(&token).unwrap();
        assert!(caller.is_admin());
        assert!(caller.require_superadmin().is_ok());

        let host_id = Uuid::new_v4();
        let token = auth.jwt().issue(&Claims::for_host(host_id)).unwrap();
        let caller = auth.authenticate(&token).unwrap();
        assert!(caller.require_host(host_id).is_ok());
        assert!(caller.require_host(Uuid::new_v4()).is_err());
        assert!(caller.require_admin().is_err());
    }

    #[test]
    fn test_node_token_is_network_scoped() {
        let auth = authenticator();
        let token = auth.jwt().issue(&Claims::for_node("alice", "skynet")).unwrap();
        let caller = auth.authenticate(&token).unwrap();
        assert!(caller.require_network("skynet").is_ok());
        assert!(caller.require_network("other").is_err());
    }

    #[test]
    fn test_deleted_user_token_is_rejected() {
        let auth = authenticator();
        auth.users()
            .create(CreateUser {
                username: "bob".into(),
                password: "builder".into(),
                ..Default::default()
            })
            .unwrap();
        let bob = auth.users().get("bob").unwrap();
        let token = auth.jwt().issue(&Claims::for_user(&bob)).unwrap();
        auth.users().delete("bob").unwrap();
        assert!(matches!(auth.authenticate(&token), Err(Error::Unauthorized(_))));
    }
}
