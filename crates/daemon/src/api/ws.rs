//! WebSocket endpoints
//!
//! Enrollment sockets run the flows in [`crate::enrollment`] over an
//! [`AxumTransport`]. The update socket carries host actions both ways.

use super::{AppState, ApiResult};
use crate::auth::Caller;
use crate::enrollment::{Close, EnrollmentTransport};
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use std::borrow::Cow;
use tracing::{debug, warn};
use uuid::Uuid;
use wgmesh_common::{Error, HostUpdate, Result};

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_POLICY: u16 = 1008;
const CLOSE_ERROR: u16 = 1011;

/// Text frames over an axum socket
pub struct AxumTransport {
    socket: WebSocket,
}

impl AxumTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl EnrollmentTransport for AxumTransport {
    async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.socket.recv().await? {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => return Some(text),
                    Err(_) => debug!("Dropping non-UTF-8 binary frame"),
                },
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(Message::Close(_)) => return None,
                Err(e) => {
                    debug!("WebSocket read failed: {}", e);
                    return None;
                }
            }
        }
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        self.socket
            .send(Message::Text(text))
            .await
            .map_err(|e| Error::validation(format!("client went away: {}", e)))
    }

    async fn close(&mut self, close: Close) {
        let (code, reason) = match close {
            Close::Normal => (CLOSE_NORMAL, String::new()),
            Close::Policy(reason) => (CLOSE_POLICY, reason),
            Close::Error(reason) => (CLOSE_ERROR, reason),
        };
        let frame = CloseFrame {
            code,
            reason: Cow::Owned(truncate(reason)),
        };
        if let Err(e) = self.socket.send(Message::Close(Some(frame))).await {
            debug!("Close frame not delivered: {}", e);
        }
    }
}

/// Close reasons must fit a control frame
fn truncate(mut reason: String) -> String {
    const MAX: usize = 120;
    if reason.len() > MAX {
        let mut end = MAX;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}

/// `GET /api/hosts/adm/register`
pub async fn register(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| async move {
        let mut transport = AxumTransport::new(socket);
        let _ = app.enrollment.host_join_session(&mut transport).await;
    })
}

/// `GET /api/oauth/node-handler`
pub async fn node_sso(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| async move {
        let mut transport = AxumTransport::new(socket);
        let _ = app.enrollment.node_sso_session(&mut transport).await;
    })
}

/// `GET /api/oauth/headless`
pub async fn headless(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| async move {
        let mut transport = AxumTransport::new(socket);
        let _ = app.enrollment.headless_session(&mut transport).await;
    })
}

/// `GET /api/v1/update`, host tokens only
pub async fn updates(
    caller: Caller,
    ws: WebSocketUpgrade,
    State(app): State<AppState>,
) -> ApiResult<Response> {
    let Caller::Host(host_id) = caller else {
        return Err(Error::PermissionDenied("the update channel is for hosts".into()).into());
    };
    app.state.get_host(host_id)?;
    Ok(ws.on_upgrade(move |socket| update_loop(app, host_id, socket)))
}

async fn update_loop(app: AppState, host_id: Uuid, socket: WebSocket) {
    let mut transport = AxumTransport::new(socket);
    debug!("Host {} opened the update channel", host_id);

    while let Some(text) = transport.recv_text().await {
        let replies = serde_json::from_str::<HostUpdate>(&text)
            .map_err(|e| Error::validation(format!("malformed host update: {}", e)))
            .and_then(|update| app.hosts.handle_client_update(host_id, update));

        let outgoing = match replies {
            Ok(replies) => replies
                .iter()
                .map(serde_json::to_string)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Error::from),
            Err(e) => {
                warn!("Host {} sent a rejected update: {}", host_id, e);
                let status = super::status_of(e.kind());
                Ok(vec![serde_json::json!({
                    "code": status.as_u16(),
                    "message": e.to_string(),
                })
                .to_string()])
            }
        };

        let Ok(outgoing) = outgoing else {
            continue;
        };
        for text in outgoing {
            if transport.send_text(text).await.is_err() {
                return;
            }
        }
    }
    debug!("Host {} closed the update channel", host_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_close_reason() {
        assert_eq!(truncate("short".into()), "short");
        let long = "é".repeat(100);
        let cut = truncate(long);
        assert!(cut.len() <= 120);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
