//! OAuth login, callback and enrollment redirects

use super::{status_of, ws, ApiResult, AppState};
use crate::oauth::CallbackOutcome;
use axum::extract::{Path, Query, State};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Default, Deserialize)]
struct CallbackQuery {
    #[serde(default)]
    state: String,
    #[serde(default)]
    code: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/oauth/login", get(login))
        .route("/api/oauth/callback", get(callback))
        .route("/api/oauth/register/:state", get(register))
        .route("/api/oauth/headless", get(ws::headless))
        .route("/api/oauth/node-handler", get(ws::node_sso))
}

async fn login(State(app): State<AppState>) -> ApiResult<Redirect> {
    Ok(Redirect::temporary(&app.oauth.login()?))
}

/// Browser target for an enrollment socket's `sso_url`
async fn register(State(app): State<AppState>, Path(state): Path<String>) -> ApiResult<Redirect> {
    Ok(Redirect::temporary(&app.oauth.register_url(&state)?))
}

/// The provider sends the browser here; errors render as a page
async fn callback(State(app): State<AppState>, Query(query): Query<CallbackQuery>) -> Response {
    match app.oauth.callback(&query.state, &query.code).await {
        Ok(CallbackOutcome::Redirect(url)) => Redirect::temporary(&url).into_response(),
        Ok(CallbackOutcome::Completed { user }) => {
            info!("OAuth enrollment completed for {}", user);
            Html(page(
                "Authentication complete",
                &format!("Signed in as {}. You can close this window.", escape(&user)),
            ))
            .into_response()
        }
        Err(e) => {
            let status = status_of(e.kind());
            (status, Html(page("Authentication failed", &escape(&e.to_string())))).into_response()
        }
    }
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body><h2>{title}</h2><p>{body}</p></body></html>"
    )
}

fn escape(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '<' => "&lt;".to_string(),
            '>' => "&gt;".to_string(),
            '&' => "&amp;".to_string(),
            '"' => "&quot;".to_string(),
            '\'' => "&#39;".to_string(),
            c => c.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(escape("<b>\"x\"&'y'</b>"), "&lt;b&gt;&quot;x&quot;&amp;&#39;y&#39;&lt;/b&gt;");
        assert_eq!(escape("alice"), "alice");
    }

    #[test]
    fn test_page_embeds_title() {
        let html = page("Done", "ok");
        assert!(html.contains("<title>Done</title>"));
        assert!(html.contains("<p>ok</p>"));
    }
}
