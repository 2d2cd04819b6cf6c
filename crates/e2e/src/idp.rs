//! Mock identity provider speaking the GitHub OAuth app protocol

use std::sync::Arc;
use wgmesh_daemon::oauth::{Endpoints, GithubProvider, OAuthProvider, ProviderSettings};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const AUTHORIZE_PATH: &str = "/login/oauth/authorize";

pub struct MockIdp {
    server: MockServer,
}

impl MockIdp {
    /// Every code exchanged at this provider logs in as `login`
    pub async fn start(login: &str) -> Self {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login/oauth/access_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "gho_e2e",
                "token_type": "bearer",
                "scope": ""
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "login": login,
                "name": login
            })))
            .mount(&server)
            .await;
        Self { server }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Provider pointed at this mock; the redirect is never followed in tests
    pub fn provider(&self) -> Arc<dyn OAuthProvider> {
        let uri = self.server.uri();
        Arc::new(GithubProvider::with_endpoints(
            ProviderSettings {
                redirect_url: "http://127.0.0.1/api/oauth/callback".into(),
                client_id: "e2e-client".into(),
                client_secret: "e2e-secret".into(),
            },
            Endpoints {
                auth_url: format!("{}{}", uri, AUTHORIZE_PATH),
                token_url: format!("{}/login/oauth/access_token", uri),
                userinfo_url: format!("{}/user", uri),
            },
            reqwest::Client::new(),
        ))
    }
}
