use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::json;
use tiny_http::{Header, Method, Response, Server};
use url::Url;

use crate::dispatch::ActionDispatcher;

const BIND_ATTEMPTS: u32 = 20;
const BIND_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BODY_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl ControlResponse {
    fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
        }
    }

    fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    #[serde(default)]
    item_id: Option<String>,
}

/// Local control surface: `GET /post_reply` and `POST /delete`.
pub struct ControlServer {
    server: Arc<Server>,
    dispatcher: Arc<ActionDispatcher>,
}

/// Stops a running `ControlServer` from another task or thread.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<Server>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.unblock();
    }
}

impl ControlServer {
    /// Binds the listener. The authorization listener may still be releasing
    /// the same port, so binding is retried briefly before giving up.
    pub fn bind(addr: &str, dispatcher: Arc<ActionDispatcher>) -> Result<Self> {
        let mut last_err = None;
        for attempt in 0..BIND_ATTEMPTS {
            match Server::http(addr) {
                Ok(server) => {
                    return Ok(Self {
                        server: Arc::new(server),
                        dispatcher,
                    })
                }
                Err(err) => {
                    tracing::debug!(attempt, error = %err, "control server bind failed");
                    last_err = Some(err);
                    thread::sleep(BIND_BACKOFF);
                }
            }
        }
        let message = last_err.map(|err| err.to_string()).unwrap_or_default();
        Err(anyhow!("server: listen on {}: {}", addr, message))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.server_addr().to_ip()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.server.clone())
    }

    /// Accepts requests until shut down. Accepting happens on a blocking
    /// thread; every request is answered by a task on the current runtime.
    pub async fn run(self) -> Result<()> {
        let runtime = tokio::runtime::Handle::current();
        let server = self.server.clone();
        let dispatcher = self.dispatcher.clone();
        if let Some(addr) = self.local_addr() {
            tracing::info!(%addr, "control server started");
        }

        tokio::task::spawn_blocking(move || {
            for mut request in server.incoming_requests() {
                let method = request.method().clone();
                let url = request.url().to_string();
                let mut body = String::new();
                if method == Method::Post {
                    let mut reader = request.as_reader().take(MAX_BODY_BYTES);
                    if let Err(err) = reader.read_to_string(&mut body) {
                        tracing::debug!(error = %err, "failed to read request body");
                    }
                }
                let dispatcher = dispatcher.clone();
                runtime.spawn(async move {
                    let response = route(&dispatcher, &method, &url, &body).await;
                    tracing::info!(%method, path = %path_of(&url), status = response.status, "control request");
                    let _ = tokio::task::spawn_blocking(move || respond(request, response)).await;
                });
            }
        })
        .await
        .context("server: accept loop")?;
        tracing::info!("control server stopped");
        Ok(())
    }
}

fn path_of(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

fn respond(request: tiny_http::Request, response: ControlResponse) {
    let mut reply = Response::from_string(response.body).with_status_code(response.status);
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], response.content_type.as_bytes())
    {
        reply = reply.with_header(header);
    }
    if let Err(err) = request.respond(reply) {
        tracing::debug!(error = %err, "failed to write control response");
    }
}

/// Maps one request onto a dispatcher action.
pub async fn route(
    dispatcher: &ActionDispatcher,
    method: &Method,
    url: &str,
    body: &str,
) -> ControlResponse {
    match (method, path_of(url)) {
        (Method::Get, "/post_reply") => post_reply(dispatcher, url).await,
        (Method::Post, "/delete") => delete(dispatcher, body).await,
        (_, "/post_reply") | (_, "/delete") => ControlResponse::text(405, "method not allowed"),
        _ => ControlResponse::text(404, "not found"),
    }
}

async fn post_reply(dispatcher: &ActionDispatcher, url: &str) -> ControlResponse {
    let parsed = match Url::parse(&format!("http://control{}", url)) {
        Ok(parsed) => parsed,
        Err(_) => return ControlResponse::text(400, "Malformed request"),
    };
    let mut comment_id = None;
    let mut reply_text = None;
    for (key, value) in parsed.query_pairs() {
        match key.as_ref() {
            "comment_id" => comment_id = Some(value.into_owned()),
            "reply_text" => reply_text = Some(value.into_owned()),
            _ => {}
        }
    }
    let (comment_id, reply_text) = match (comment_id, reply_text) {
        (Some(id), Some(text)) if !id.trim().is_empty() && !text.trim().is_empty() => (id, text),
        _ => return ControlResponse::text(400, "Missing comment_id or reply_text"),
    };

    match dispatcher.reply_to_comment(&comment_id, &reply_text).await {
        Ok(reply) => ControlResponse::text(
            200,
            format!("Reply posted successfully. New reply ID: {}", reply.id),
        ),
        Err(_) => ControlResponse::text(500, "Failed to post reply"),
    }
}

async fn delete(dispatcher: &ActionDispatcher, body: &str) -> ControlResponse {
    let request: DeleteRequest = match serde_json::from_str(body) {
        Ok(request) => request,
        Err(_) => return ControlResponse::json(400, json!({"error": "invalid json body"})),
    };
    let item_id = match request.item_id {
        Some(id) if !id.trim().is_empty() => id,
        _ => return ControlResponse::json(400, json!({"error": "missing item_id"})),
    };

    match dispatcher.delete_comment(&item_id).await {
        Ok(()) => ControlResponse::json(200, json!({"success": true})),
        Err(_) => ControlResponse::json(
            500,
            json!({"success": false, "error": "failed to delete item"}),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::FakeService;
    use serde_json::Value;

    fn setup(fake: FakeService) -> (Arc<FakeService>, ActionDispatcher) {
        let fake = Arc::new(fake);
        let dispatcher = ActionDispatcher::new(fake.clone(), 2).unwrap();
        (fake, dispatcher)
    }

    fn body_json(response: &ControlResponse) -> Value {
        serde_json::from_str(&response.body).unwrap()
    }

    #[tokio::test]
    async fn post_reply_decodes_text_once() {
        let (fake, dispatcher) = setup(FakeService::owned_by("me"));
        let response = route(
            &dispatcher,
            &Method::Get,
            "/post_reply?comment_id=xyz&reply_text=Hello%20world%20%26%20a%3Db%2520",
            "",
        )
        .await;
        assert_eq!(response.status, 200);
        assert!(response.body.contains("reply1"));
        assert_eq!(
            fake.replies.lock().as_slice(),
            [("t1_xyz".to_string(), "Hello world & a=b%20".to_string())]
        );
    }

    #[tokio::test]
    async fn post_reply_requires_both_parameters() {
        let (fake, dispatcher) = setup(FakeService::owned_by("me"));
        for url in [
            "/post_reply",
            "/post_reply?comment_id=xyz",
            "/post_reply?reply_text=hi",
            "/post_reply?comment_id=&reply_text=hi",
        ] {
            let response = route(&dispatcher, &Method::Get, url, "").await;
            assert_eq!(response.status, 400, "{}", url);
        }
        assert!(fake.replies.lock().is_empty());
    }

    #[tokio::test]
    async fn post_reply_failure_is_500() {
        let mut fake = FakeService::owned_by("me");
        fake.reply_errors = vec![crate::reddit::ApiSubError {
            code: "DELETED_COMMENT".into(),
            message: "that comment has been deleted".into(),
            field: None,
        }];
        let (_, dispatcher) = setup(fake);
        let response = route(
            &dispatcher,
            &Method::Get,
            "/post_reply?comment_id=xyz&reply_text=hi",
            "",
        )
        .await;
        assert_eq!(response.status, 500);
        assert_eq!(response.body, "Failed to post reply");
    }

    #[tokio::test]
    async fn delete_own_comment_succeeds() {
        let (fake, dispatcher) = setup(FakeService::owned_by("me").with_author("abc123", "me"));
        let response = route(&dispatcher, &Method::Post, "/delete", r#"{"item_id":"abc123"}"#).await;
        assert_eq!(response.status, 200);
        assert_eq!(body_json(&response), json!({"success": true}));
        assert_eq!(fake.deleted.lock().len(), 1);
    }

    #[tokio::test]
    async fn delete_foreign_comment_fails() {
        let (fake, dispatcher) =
            setup(FakeService::owned_by("me").with_author("abc123", "somebody"));
        let response = route(&dispatcher, &Method::Post, "/delete", r#"{"item_id":"abc123"}"#).await;
        assert_eq!(response.status, 500);
        assert_eq!(
            body_json(&response),
            json!({"success": false, "error": "failed to delete item"})
        );
        assert!(fake.deleted.lock().is_empty());
    }

    #[tokio::test]
    async fn delete_validates_body() {
        let (_, dispatcher) = setup(FakeService::owned_by("me"));
        let missing = route(&dispatcher, &Method::Post, "/delete", "{}").await;
        assert_eq!(missing.status, 400);
        assert_eq!(body_json(&missing), json!({"error": "missing item_id"}));

        let garbage = route(&dispatcher, &Method::Post, "/delete", "not json").await;
        assert_eq!(garbage.status, 400);
    }

    #[tokio::test]
    async fn unknown_routes_are_rejected() {
        let (_, dispatcher) = setup(FakeService::owned_by("me"));
        assert_eq!(route(&dispatcher, &Method::Get, "/", "").await.status, 404);
        assert_eq!(route(&dispatcher, &Method::Get, "/delete", "").await.status, 405);
        assert_eq!(
            route(&dispatcher, &Method::Post, "/post_reply", "").await.status,
            405
        );
    }
}
