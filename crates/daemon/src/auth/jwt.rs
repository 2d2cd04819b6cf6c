//! Local JWTs (HS256)

use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wgmesh_common::{crypto, db::tables, Database, Error, Result, User};

/// Lifetime of every token we mint
pub const TOKEN_VALIDITY_HOURS: i64 = 24;

const SECRET_KEY: &str = "jwt_secret";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subject {
    User,
    Host,
    /// Network-scoped token handed out by the node SSO flow
    Node,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub sub: String,
    pub kind: Subject,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_superadmin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    fn new(sub: String, kind: Subject) -> Self {
        let now = Utc::now();
        Self {
            sub,
            kind,
            is_admin: false,
            is_superadmin: false,
            network: None,
            iat: now.timestamp(),
            exp: (now + Duration::hours(TOKEN_VALIDITY_HOURS)).timestamp(),
        }
    }

    pub fn for_user(user: &User) -> Self {
        Self {
            is_admin: user.is_admin,
            is_superadmin: user.is_superadmin,
            ..Self::new(user.username.clone(), Subject::User)
        }
    }

    pub fn for_host(host_id: Uuid) -> Self {
        Self::new(host_id.to_string(), Subject::Host)
    }

    pub fn for_node(username: &str, network: &str) -> Self {
        Self {
            network: Some(network.to_string()),
            ..Self::new(username.to_string(), Subject::Node)
        }
    }

    pub fn host_id(&self) -> Option<Uuid> {
        match self.kind {
            Subject::Host => self.sub.parse().ok(),
            _ => None,
        }
    }
}

/// Signs and validates tokens with one shared secret
#[derive(Clone)]
pub struct JwtManager {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtManager {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.leeway = 0;

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Use the configured secret, or the one persisted in the store, or a new one
    pub fn load(db: &Database, configured: Option<&str>) -> Result<Self> {
        if let Some(secret) = configured.filter(|s| !s.is_empty()) {
            return Ok(Self::new(secret.as_bytes()));
        }
        let secret = match db.get::<String>(tables::SERVER_CONFIG, SECRET_KEY)? {
            Some(secret) => secret,
            None => {
                let secret = crypto::random_string(48);
                db.put(tables::SERVER_CONFIG, SECRET_KEY, &secret)?;
                secret
            }
        };
        Ok(Self::new(secret.as_bytes()))
    }

    pub fn issue(&self, claims: &Claims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| Error::Crypto(format!("Failed to sign token: {}", e)))
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => Error::Expired("token expired".into()),
                _ => Error::Unauthorized("invalid token".into()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin() -> User {
        User {
            username: "admin".into(),
            password: String::new(),
            is_admin: true,
            is_superadmin: false,
            networks: vec![],
            auth_source: Default::default(),
            created_at: 0,
        }
    }

    #[test]
    fn test_issue_and_verify() {
        let jwt = JwtManager::new(b"secret");
        let token = jwt.issue(&Claims::for_user(&admin())).unwrap();
        let claims = jwt.verify(&token).unwrap();
        assert_eq!(claims.sub, "admin");
        assert!(claims.is_admin);
        assert_eq!(claims.exp - claims.iat, TOKEN_VALIDITY_HOURS * 3600);
    }

    #[test]
    fn test_wrong_secret_is_unauthorized() {
        let token = JwtManager::new(b"a").issue(&Claims::for_host(Uuid::new_v4())).unwrap();
        assert!(matches!(
            JwtManager::new(b"b").verify(&token),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn test_expired_token() {
        let jwt = JwtManager::new(b"secret");
        let mut claims = Claims::for_host(Uuid::new_v4());
        claims.iat -= 3 * 3600 * 24;
        claims.exp = claims.iat + 60;
        let token = jwt.issue(&claims).unwrap();
        assert!(matches!(jwt.verify(&token), Err(Error::Expired(_))));
    }

    #[test]
    fn test_host_claims() {
        let id = Uuid::new_v4();
        assert_eq!(Claims::for_host(id).host_id(), Some(id));
        assert_eq!(Claims::for_user(&admin()).host_id(), None);
        assert_eq!(
            Claims::for_node("alice", "skynet").network.as_deref(),
            Some("skynet")
        );
    }

    #[test]
    fn test_secret_is_persisted() {
        let db = Database::open_memory().unwrap();
        let first = JwtManager::load(&db, None).unwrap();
        let second = JwtManager::load(&db, None).unwrap();
        let token = first.issue(&Claims::for_host(Uuid::new_v4())).unwrap();
        assert!(second.verify(&token).is_ok());
    }
}
