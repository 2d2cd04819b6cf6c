//! Azure AD (Microsoft identity platform v2)

use super::{
    authorize_url, exchange_code, fetch_json, Endpoints, OAuthProvider, Principal, ProviderKind,
    ProviderSettings,
};
use async_trait::async_trait;
use serde::Deserialize;
use wgmesh_common::{Error, Result};

const SCOPES: &str = "User.Read";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphUser {
    #[serde(default)]
    user_principal_name: String,
    #[serde(default)]
    display_name: Option<String>,
}

pub struct AzureAdProvider {
    settings: ProviderSettings,
    endpoints: Endpoints,
    http: reqwest::Client,
}

impl AzureAdProvider {
    pub fn new(settings: ProviderSettings, tenant: &str, http: reqwest::Client) -> Self {
        let base = format!("https://login.microsoftonline.com/{}/oauth2/v2.0", tenant);
        Self::with_endpoints(
            settings,
            Endpoints {
                auth_url: format!("{}/authorize", base),
                token_url: format!("{}/token", base),
                userinfo_url: "https://graph.microsoft.com/v1.0/me".into(),
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
impl OAuthProvider for AzureAdProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AzureAd
    }

    fn auth_url(&self, state: &str) -> String {
        authorize_url(&self.endpoints.auth_url, &self.settings, SCOPES, state)
    }

    async fn user_info(&self, code: &str) -> Result<Principal> {
        let token =
            exchange_code(&self.http, &self.endpoints.token_url, &self.settings, code).await?;
        let user: GraphUser =
            fetch_json(&self.http, &self.endpoints.userinfo_url, &token.access_token).await?;
        if user.user_principal_name.is_empty() {
            return Err(Error::Unauthorized("Azure AD returned no user principal name".into()));
        }
        Ok(Principal {
            display_name: user
                .display_name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| user.user_principal_name.clone()),
            user_id: user.user_principal_name,
        })
    }
}
