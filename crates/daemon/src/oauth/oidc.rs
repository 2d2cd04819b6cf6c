//! Generic OpenID Connect
//!
//! Endpoints come from the issuer's discovery document. ID tokens are verified against
//! the issuer's JWKS with the audience pinned to our client id.

use super::{
    authorize_url, exchange_code, upstream, Endpoints, OAuthProvider, Principal, ProviderKind,
    ProviderSettings,
};
use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, jwk::JwkSet, DecodingKey, Validation};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::debug;
use wgmesh_common::{Error, Result};

const SCOPES: &str = "openid profile email";

#[derive(Debug, Deserialize)]
struct Discovery {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    #[serde(default)]
    userinfo_endpoint: Option<String>,
    jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct IdClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

pub struct OidcProvider {
    settings: ProviderSettings,
    endpoints: Endpoints,
    issuer: String,
    jwks_uri: String,
    jwks: RwLock<Option<JwkSet>>,
    http: reqwest::Client,
}

impl OidcProvider {
    /// Fetch `<issuer>/.well-known/openid-configuration`
    pub async fn discover(
        settings: ProviderSettings,
        issuer: &str,
        http: reqwest::Client,
    ) -> Result<Self> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        let response = http.get(&url).send().await.map_err(upstream)?;
        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "OIDC discovery at {} returned {}",
                url,
                response.status()
            )));
        }
        let discovery: Discovery = response.json().await.map_err(upstream)?;
        debug!("Discovered OIDC issuer {}", discovery.issuer);

        Ok(Self {
            settings,
            endpoints: Endpoints {
                auth_url: discovery.authorization_endpoint,
                token_url: discovery.token_endpoint,
                userinfo_url: discovery.userinfo_endpoint.unwrap_or_default(),
            },
            issuer: discovery.issuer,
            jwks_uri: discovery.jwks_uri,
            jwks: RwLock::new(None),
            http,
        })
    }

    async fn fetch_jwks(&self) -> Result<JwkSet> {
        let response = self.http.get(&self.jwks_uri).send().await.map_err(upstream)?;
        if !response.status().is_success() {
            return Err(Error::Upstream(format!("JWKS returned {}", response.status())));
        }
        let set: JwkSet = response.json().await.map_err(upstream)?;
        *self.jwks.write() = Some(set.clone());
        Ok(set)
    }

    /// Key for `kid`, refreshing the cached set once on a miss (key rotation)
    async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey> {
        let cached = self.jwks.read().clone();
        let set = match cached {
            Some(set) if find_key(&set, kid).is_some() => set,
            _ => self.fetch_jwks().await?,
        };
        let jwk = find_key(&set, kid)
            .ok_or_else(|| Error::Unauthorized("ID token signed with an unknown key".into()))?;
        DecodingKey::from_jwk(jwk).map_err(|e| Error::Unauthorized(format!("unusable JWK: {}", e)))
    }

    async fn verify(&self, id_token: &str) -> Result<IdClaims> {
        let header = decode_header(id_token)
            .map_err(|e| Error::Unauthorized(format!("malformed ID token: {}", e)))?;
        let key = self.decoding_key(header.kid.as_deref()).await?;

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[&self.settings.client_id]);
        validation.set_issuer(&[&self.issuer]);

        decode::<IdClaims>(id_token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| Error::Unauthorized(format!("ID token rejected: {}", e)))
    }
}

fn find_key<'a>(set: &'a JwkSet, kid: Option<&str>) -> Option<&'a jsonwebtoken::jwk::Jwk> {
    match kid {
        Some(kid) => set.find(kid),
        None if set.keys.len() == 1 => set.keys.first(),
        None => None,
    }
}

#[async_trait]
impl OAuthProvider for OidcProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Oidc
    }

    fn auth_url(&self, state: &str) -> String {
        authorize_url(&self.endpoints.auth_url, &self.settings, SCOPES, state)
    }

    async fn user_info(&self, code: &str) -> Result<Principal> {
        let token =
            exchange_code(&self.http, &self.endpoints.token_url, &self.settings, code).await?;
        let id_token = token
            .id_token
            .ok_or_else(|| Error::Unauthorized("provider returned no ID token".into()))?;
        let claims = self.verify(&id_token).await?;

        let user_id = claims
            .email
            .clone()
            .or(claims.preferred_username.clone())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| claims.sub.clone());
        Ok(Principal {
            display_name: claims.name.unwrap_or_else(|| user_id.clone()),
            user_id,
        })
    }
}
