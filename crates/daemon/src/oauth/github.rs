//! GitHub OAuth apps

use super::{
    authorize_url, exchange_code, fetch_json, Endpoints, OAuthProvider, Principal, ProviderKind,
    ProviderSettings,
};
use async_trait::async_trait;
use serde::Deserialize;
use wgmesh_common::{Error, Result};

#[derive(Debug, Deserialize)]
struct GithubUser {
    #[serde(default)]
    login: String,
    #[serde(default)]
    name: Option<String>,
}

pub struct GithubProvider {
    settings: ProviderSettings,
    endpoints: Endpoints,
    http: reqwest::Client,
}

impl GithubProvider {
    pub fn new(settings: ProviderSettings, http: reqwest::Client) -> Self {
        Self::with_endpoints(
            settings,
            Endpoints {
                auth_url: "https://github.com/login/oauth/authorize".into(),
                token_url: "https://github.com/login/oauth/access_token".into(),
                userinfo_url: "https://api.github.com/user".into(),
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
impl OAuthProvider for GithubProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Github
    }

    fn auth_url(&self, state: &str) -> String {
        authorize_url(&self.endpoints.auth_url, &self.settings, "", state)
    }

    async fn user_info(&self, code: &str) -> Result<Principal> {
        let token =
            exchange_code(&self.http, &self.endpoints.token_url, &self.settings, code).await?;
        let user: GithubUser =
            fetch_json(&self.http, &self.endpoints.userinfo_url, &token.access_token).await?;
        if user.login.is_empty() {
            return Err(Error::Unauthorized("GitHub returned no login".into()));
        }
        Ok(Principal {
            display_name: user.name.filter(|n| !n.is_empty()).unwrap_or_else(|| user.login.clone()),
            user_id: user.login,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_login_is_the_user_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login/oauth/access_token"))
            .and(header("accept", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "gho_123",
                "scope": "",
                "token_type": "bearer"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "login": "octocat",
                "name": null
            })))
            .mount(&server)
            .await;

        let provider = GithubProvider::with_endpoints(
            ProviderSettings {
                redirect_url: "http://localhost:8081/api/oauth/callback".into(),
                client_id: "cid".into(),
                client_secret: "secret".into(),
            },
            Endpoints {
                auth_url: format!("{}/login/oauth/authorize", server.uri()),
                token_url: format!("{}/login/oauth/access_token", server.uri()),
                userinfo_url: format!("{}/user", server.uri()),
            },
            super::super::http_client().unwrap(),
        );

        let principal = provider.user_info("code").await.unwrap();
        assert_eq!(principal.user_id, "octocat");
        assert_eq!(principal.display_name, "octocat");
    }
}
