//! HTTP and WebSocket clients for driving a test server

use crate::error::{E2eError, E2eResult};
use crate::server::{ServerHandle, MASTER_KEY};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use wgmesh_common::EnrollmentKey;

/// HTTP client that never follows redirects, so tests can inspect them
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<&str>) -> E2eResult<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(str::to_string),
        })
    }

    /// Client presenting the master key
    pub fn master(server: &ServerHandle) -> E2eResult<Self> {
        Self::new(&server.base_url, Some(MASTER_KEY))
    }

    /// Client without credentials
    pub fn anonymous(server: &ServerHandle) -> E2eResult<Self> {
        Self::new(&server.base_url, None)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = if path.starts_with("http") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        };
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub async fn get(&self, path: &str) -> E2eResult<reqwest::Response> {
        Ok(self.request(reqwest::Method::GET, path).send().await?)
    }

    pub async fn post<T: Serialize>(&self, path: &str, body: &T) -> E2eResult<reqwest::Response> {
        Ok(self.request(reqwest::Method::POST, path).json(body).send().await?)
    }

    pub async fn delete(&self, path: &str) -> E2eResult<reqwest::Response> {
        Ok(self.request(reqwest::Method::DELETE, path).send().await?)
    }

    /// POST and decode a successful JSON reply
    pub async fn post_ok<T: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> E2eResult<R> {
        let resp = self.post(path, body).await?;
        decode(resp).await
    }

    pub async fn create_network(&self, id: &str, range: &str) -> E2eResult<()> {
        let _: serde_json::Value = self
            .post_ok("/api/networks", &serde_json::json!({ "id": id, "address_range": range }))
            .await?;
        Ok(())
    }

    pub async fn create_key(&self, network: &str, uses: u32) -> E2eResult<EnrollmentKey> {
        self.post_ok(
            "/api/v1/enrollment-keys",
            &serde_json::json!({ "networks": [network], "uses_remaining": uses }),
        )
        .await
    }
}

async fn decode<R: DeserializeOwned>(resp: reqwest::Response) -> E2eResult<R> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(E2eError::UnexpectedResponse(format!("{}: {}", status, body)));
    }
    Ok(serde_json::from_str(&body)?)
}

/// Text-frame WebSocket client
pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

/// How the server ended a socket
#[derive(Debug, Clone, PartialEq)]
pub enum Ending {
    Closed { code: u16, reason: String },
    Dropped,
}

impl WsClient {
    pub async fn connect(url: &str) -> E2eResult<Self> {
        let (stream, _) = connect_async(url).await?;
        Ok(Self { stream })
    }

    pub async fn send_json<T: Serialize>(&mut self, value: &T) -> E2eResult<()> {
        self.stream
            .send(Message::Text(serde_json::to_string(value)?))
            .await?;
        Ok(())
    }

    /// Next text frame, or how the socket ended
    pub async fn recv(&mut self, timeout: Duration) -> E2eResult<Result<String, Ending>> {
        let next = async {
            while let Some(frame) = self.stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => return Ok(text),
                    Ok(Message::Close(frame)) => {
                        return Err(match frame {
                            Some(frame) => Ending::Closed {
                                code: u16::from(frame.code),
                                reason: frame.reason.into_owned(),
                            },
                            None => Ending::Closed {
                                code: 1005,
                                reason: String::new(),
                            },
                        })
                    }
                    Ok(_) => {}
                    Err(_) => return Err(Ending::Dropped),
                }
            }
            Err(Ending::Dropped)
        };
        tokio::time::timeout(timeout, next)
            .await
            .map_err(|_| E2eError::Timeout("websocket frame".into()))
    }

    /// Next text frame; anything else is an error
    pub async fn recv_text(&mut self, timeout: Duration) -> E2eResult<String> {
        self.recv(timeout)
            .await?
            .map_err(|ending| E2eError::UnexpectedResponse(format!("socket ended: {:?}", ending)))
    }

    pub async fn close(mut self) -> E2eResult<()> {
        self.stream.close(None).await?;
        Ok(())
    }
}
