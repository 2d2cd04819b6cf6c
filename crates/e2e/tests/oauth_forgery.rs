//! OAuth callback state handling over real HTTP
//!
//! Only a state this server issued, used once, completes a login.

use wgmesh_e2e::{init_tracing, ApiClient, MockIdp, ServerConfig, ServerHandle};

async fn server() -> (ServerHandle, MockIdp) {
    init_tracing();
    let idp = MockIdp::start("dave").await;
    let server = ServerHandle::spawn_with(ServerConfig::default(), Some(idp.provider()))
        .await
        .unwrap();
    (server, idp)
}

fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

#[tokio::test]
async fn forged_state_is_rejected() {
    let (server, _idp) = server().await;
    let browser = ApiClient::anonymous(&server).unwrap();

    let resp = browser
        .get("/api/oauth/callback?state=0123456789abcdef0123456789abcdef&code=stolen")
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let page = resp.text().await.unwrap();
    assert!(page.contains("Authentication failed"));

    // no user was created from the provider identity
    assert!(server.app.users.get("dave").is_err());
}

#[tokio::test]
async fn missing_parameters_are_rejected() {
    let (server, _idp) = server().await;
    let browser = ApiClient::anonymous(&server).unwrap();

    let resp = browser.get("/api/oauth/callback?code=abc").await.unwrap();
    assert_eq!(resp.status(), 400);
    let resp = browser.get("/api/oauth/callback").await.unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn issued_state_logs_in_once() {
    let (server, idp) = server().await;
    let browser = ApiClient::anonymous(&server).unwrap();

    let resp = browser.get("/api/oauth/login").await.unwrap();
    assert!(resp.status().is_redirection());
    let location = resp.headers()["location"].to_str().unwrap().to_string();
    assert!(location.starts_with(&idp.uri()));
    let state = query_param(&location, "state").unwrap();

    let callback = format!("/api/oauth/callback?state={}&code=granted", state);
    let resp = browser.get(&callback).await.unwrap();
    assert!(resp.status().is_redirection());
    let dashboard = resp.headers()["location"].to_str().unwrap().to_string();
    assert!(dashboard.starts_with("http://dashboard.test/login?login="));
    assert_eq!(query_param(&dashboard, "user").as_deref(), Some("dave"));

    // first login creates an unprivileged user
    let user = server.app.users.get("dave").unwrap();
    assert!(!user.is_privileged());
    assert!(user.networks.is_empty());

    // the minted token authenticates API calls
    let token = query_param(&dashboard, "login").unwrap();
    let api = ApiClient::new(&server.base_url, Some(&token)).unwrap();
    let resp = api.get("/api/server/getconfig").await.unwrap();
    assert_eq!(resp.status(), 200);

    // replaying the same state fails
    let resp = browser.get(&callback).await.unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn login_without_provider_is_rejected() {
    init_tracing();
    let server = ServerHandle::spawn(ServerConfig::default()).await.unwrap();
    let browser = ApiClient::anonymous(&server).unwrap();

    let resp = browser.get("/api/oauth/login").await.unwrap();
    assert_eq!(resp.status(), 400);
}
