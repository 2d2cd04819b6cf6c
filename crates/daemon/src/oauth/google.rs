//! Google accounts

use super::{
    authorize_url, exchange_code, fetch_json, Endpoints, OAuthProvider, Principal, ProviderKind,
    ProviderSettings,
};
use async_trait::async_trait;
use serde::Deserialize;
use wgmesh_common::{Error, Result};

const SCOPES: &str = "https://www.googleapis.com/auth/userinfo.email";

#[derive(Debug, Deserialize)]
struct GoogleUser {
    #[serde(default)]
    email: String,
    #[serde(default)]
    name: String,
}

pub struct GoogleProvider {
    settings: ProviderSettings,
    endpoints: Endpoints,
    http: reqwest::Client,
}

impl GoogleProvider {
    pub fn new(settings: ProviderSettings, http: reqwest::Client) -> Self {
        Self::with_endpoints(
            settings,
            Endpoints {
                auth_url: "https://accounts.google.com/o/oauth2/auth".into(),
                token_url: "https://oauth2.googleapis.com/token".into(),
                userinfo_url: "https://www.googleapis.com/oauth2/v2/userinfo".into(),
            },
            http,
        )
    }

    pub fn with_endpoints(
        settings: ProviderSettings,
        endpoints: Endpoints,
        http: reqwest::Client,
    ) -> Self {
        Self {
            settings,
            endpoints,
            http,
        }
    }
}

#[async_trait]
impl OAuthProvider for GoogleProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    fn auth_url(&self, state: &str) -> String {
        authorize_url(&self.endpoints.auth_url, &self.settings, SCOPES, state)
    }

    async fn user_info(&self, code: &str) -> Result<Principal> {
        let token =
            exchange_code(&self.http, &self.endpoints.token_url, &self.settings, code).await?;
        let user: GoogleUser =
            fetch_json(&self.http, &self.endpoints.userinfo_url, &token.access_token).await?;
        if user.email.is_empty() {
            return Err(Error::Unauthorized("Google account has no email".into()));
        }
        Ok(Principal {
            display_name: if user.name.is_empty() {
                user.email.clone()
            } else {
                user.name
            },
            user_id: user.email,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> GoogleProvider {
        GoogleProvider::with_endpoints(
            ProviderSettings {
                redirect_url: "https://api.example/api/oauth/callback".into(),
                client_id: "cid".into(),
                client_secret: "secret".into(),
            },
            Endpoints {
                auth_url: format!("{}/auth", server.uri()),
                token_url: format!("{}/token", server.uri()),
                userinfo_url: format!("{}/userinfo", server.uri()),
            },
            super::super::http_client().unwrap(),
        )
    }

    #[test]
    fn test_auth_url_carries_state() {
        let provider = GoogleProvider::new(
            ProviderSettings {
                redirect_url: "https://api.example/api/oauth/callback".into(),
                client_id: "cid".into(),
                client_secret: "secret".into(),
            },
            reqwest::Client::new(),
        );
        let url = provider.auth_url("abc");
        assert!(url.starts_with("https://accounts.google.com/o/oauth2/auth?"));
        assert!(url.contains("client_id=cid"));
        assert!(url.contains("redirect_uri=https%3A%2F%2Fapi.example%2Fapi%2Foauth%2Fcallback"));
        assert!(url.ends_with("state=abc"));
    }

    #[tokio::test]
    async fn test_user_info() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("code=the-code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at",
                "token_type": "Bearer"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .and(header("authorization", "Bearer at"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "email": "u@example.com",
                "name": "U"
            })))
            .mount(&server)
            .await;

        let principal = provider(&server).user_info("the-code").await.unwrap();
        assert_eq!(principal.user_id, "u@example.com");
        assert_eq!(principal.display_name, "U");
    }

    #[tokio::test]
    async fn test_rejected_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        assert!(matches!(
            provider(&server).user_info("bad").await,
            Err(Error::Unauthorized(_))
        ));
    }
}
