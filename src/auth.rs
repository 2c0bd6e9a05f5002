use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::RngCore;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use serde::Deserialize;
use tiny_http::{Header, Method, Response, Server};
use tokio::sync::oneshot;
use url::Url;

use crate::storage::TokenStore;

static HTML_SUCCESS: Lazy<String> = Lazy::new(|| {
    page(
        "Authorization Complete",
        "reply-relay is now connected to your Reddit account. You can close this tab and return to the terminal.",
    )
});

fn page(title: &str, message: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <title>{title}</title>
    <style>
      body {{
        margin: 0;
        min-height: 100vh;
        display: flex;
        align-items: center;
        justify-content: center;
        background: #11151d;
        color: #e8edf5;
        font-family: "Inter", "Segoe UI", -apple-system, sans-serif;
      }}
      .card {{
        background: #1c2230;
        padding: 2.5rem 3rem;
        border-radius: 16px;
        max-width: 480px;
        text-align: center;
      }}
      h1 {{ margin: 0 0 1rem; color: #52b4ff; }}
    </style>
  </head>
  <body>
    <main class="card">
      <h1>{title}</h1>
      <p>{message}</p>
    </main>
  </body>
</html>"#
    )
}

#[derive(Debug, Clone)]
pub struct Config {
    pub client_id: String,
    pub client_secret: String,
    pub scope: Vec<String>,
    pub user_agent: String,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    pub timeout: Duration,
    pub open_browser: bool,
}

impl Config {
    pub fn from_app(cfg: &crate::config::Config) -> Self {
        Self {
            client_id: cfg.reddit.client_id.clone(),
            client_secret: cfg.reddit.client_secret.clone(),
            scope: cfg.reddit.scopes.clone(),
            user_agent: cfg.reddit.user_agent.clone(),
            auth_url: cfg.reddit.auth_url.clone(),
            token_url: cfg.reddit.token_url.clone(),
            redirect_uri: cfg.reddit.redirect_uri.clone(),
            timeout: cfg.auth.timeout,
            open_browser: cfg.auth.open_browser,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("auth: no authorization callback within {0:?}")]
    Timeout(Duration),
    #[error("auth: token exchange failed: {0}")]
    ExchangeFailed(String),
    #[error("auth: listen on {addr}: {message}")]
    Listen { addr: String, message: String },
    #[error("auth: an authorization session is already active")]
    InProgress,
    #[error("auth: callback listener stopped before a token arrived")]
    Cancelled,
    #[error("auth: {0}")]
    Config(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Lifecycle of one authorization session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Pending,
    AwaitingCode,
    Exchanging,
    Complete,
    Failed,
}

/// Shared view of a session's state, readable while the listener runs.
#[derive(Debug, Clone)]
pub struct SessionStatus(Arc<Mutex<AuthState>>);

impl SessionStatus {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(AuthState::Pending)))
    }

    pub fn state(&self) -> AuthState {
        *self.0.lock()
    }

    fn set(&self, state: AuthState) {
        *self.0.lock() = state;
    }
}

/// Runs the authorization-code handshake at most once per coordinator and
/// persists the resulting refresh token.
pub struct Coordinator {
    cfg: Config,
    store: TokenStore,
    client: Client,
    active: Arc<AtomicBool>,
}

/// A live callback listener plus everything needed to wait for its result.
/// Dropping it tears the listener down.
pub struct PendingAuthorization {
    authorization_url: String,
    redirect_uri: String,
    state_token: String,
    status: SessionStatus,
    server: Arc<Server>,
    rx: Option<oneshot::Receiver<String>>,
    active: Arc<AtomicBool>,
}

impl Drop for PendingAuthorization {
    fn drop(&mut self) {
        self.server.unblock();
        self.active.store(false, Ordering::SeqCst);
    }
}

impl Coordinator {
    pub fn new(store: TokenStore, cfg: Config) -> Result<Self, AuthError> {
        if cfg.client_id.trim().is_empty() {
            return Err(AuthError::Config("client id is required".into()));
        }
        if cfg.user_agent.trim().is_empty() {
            return Err(AuthError::Config("user agent is required".into()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|err| AuthError::Config(format!("build http client: {}", err)))?;

        Ok(Self {
            cfg,
            store,
            client,
            active: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Returns the stored refresh token, or runs the browser handshake when
    /// there is none. A stored token short-circuits all network activity.
    pub async fn acquire_token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.store.load()? {
            tracing::info!(path = %self.store.path().display(), "using stored reddit token");
            return Ok(token);
        }
        self.authorize().await
    }

    /// Always runs the handshake, replacing any stored token on success.
    pub async fn authorize(&self) -> Result<String, AuthError> {
        let pending = self.begin()?;
        tracing::info!(url = %pending.authorization_url(), "please authorize the application in your browser");
        if self.cfg.open_browser {
            if let Err(err) = webbrowser::open(pending.authorization_url()) {
                tracing::warn!(error = %err, "could not open a browser; visit the URL manually");
            }
        }
        let token = pending.wait(self.cfg.timeout).await?;
        tracing::info!("reddit token obtained successfully");
        Ok(token)
    }

    /// Binds the callback listener and builds the authorization URL.
    pub fn begin(&self) -> Result<PendingAuthorization, AuthError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(AuthError::InProgress);
        }
        match self.start_listener() {
            Ok(pending) => Ok(pending),
            Err(err) => {
                self.active.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn start_listener(&self) -> Result<PendingAuthorization, AuthError> {
        let redirect = Url::parse(&self.cfg.redirect_uri)
            .map_err(|err| AuthError::Config(format!("redirect uri: {}", err)))?;
        let host = redirect.host_str().unwrap_or("localhost").to_string();
        let port = redirect.port_or_known_default().unwrap_or(0);
        let path = if redirect.path().is_empty() {
            "/".to_string()
        } else {
            redirect.path().to_string()
        };

        let listen_addr = format!("{}:{}", host, port);
        let server = Server::http(&listen_addr).map_err(|err| AuthError::Listen {
            addr: listen_addr.clone(),
            message: err.to_string(),
        })?;
        let server = Arc::new(server);

        // An ephemeral port only exists once bound, so the redirect has to follow it.
        let redirect_uri = match (port, server.server_addr().to_ip()) {
            (0, Some(actual)) => format!("http://{}{}", actual, path),
            _ => self.cfg.redirect_uri.clone(),
        };

        let state_token = random_string(24);
        let authorization_url = self.authorize_url(&redirect_uri, &state_token)?;
        let status = SessionStatus::new();

        let (tx, rx) = oneshot::channel();
        let callback = Callback {
            path,
            expected_state: state_token.clone(),
            redirect_uri: redirect_uri.clone(),
            cfg: self.cfg.clone(),
            client: self.client.clone(),
            store: self.store.clone(),
            status: status.clone(),
        };
        let listener = server.clone();
        thread::Builder::new()
            .name("oauth-callback".into())
            .spawn(move || callback.serve(&listener, tx))
            .map_err(|err| AuthError::Listen {
                addr: listen_addr.clone(),
                message: err.to_string(),
            })?;

        status.set(AuthState::AwaitingCode);
        tracing::debug!(addr = %listen_addr, "authorization callback listener started");

        Ok(PendingAuthorization {
            authorization_url,
            redirect_uri,
            state_token,
            status,
            server,
            rx: Some(rx),
            active: self.active.clone(),
        })
    }

    pub fn authorize_url(&self, redirect_uri: &str, state: &str) -> Result<String, AuthError> {
        let mut auth = Url::parse(&self.cfg.auth_url)
            .map_err(|err| AuthError::Config(format!("auth url: {}", err)))?;
        auth.query_pairs_mut()
            .append_pair("client_id", &self.cfg.client_id)
            .append_pair("response_type", "code")
            .append_pair("state", state)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("duration", "permanent")
            .append_pair("scope", &self.cfg.scope.join(" "));
        Ok(auth.to_string())
    }
}

impl PendingAuthorization {
    pub fn authorization_url(&self) -> &str {
        &self.authorization_url
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    pub fn state_token(&self) -> &str {
        &self.state_token
    }

    pub fn status(&self) -> SessionStatus {
        self.status.clone()
    }

    /// Suspends until the callback delivers a token or `timeout` elapses.
    /// Either way the listener is shut down afterwards.
    pub async fn wait(mut self, timeout: Duration) -> Result<String, AuthError> {
        let rx = self.rx.take().ok_or(AuthError::Cancelled)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(token)) => Ok(token),
            Ok(Err(_)) => {
                self.status.set(AuthState::Failed);
                Err(AuthError::Cancelled)
            }
            Err(_) => {
                self.status.set(AuthState::Failed);
                Err(AuthError::Timeout(timeout))
            }
        }
    }
}

struct Callback {
    path: String,
    expected_state: String,
    redirect_uri: String,
    cfg: Config,
    client: Client,
    store: TokenStore,
    status: SessionStatus,
}

impl Callback {
    fn serve(self, server: &Server, tx: oneshot::Sender<String>) {
        for request in server.incoming_requests() {
            if let Some(token) = self.handle(request) {
                self.status.set(AuthState::Complete);
                let _ = tx.send(token);
                break;
            }
        }
        tracing::debug!("authorization callback listener stopped");
    }

    /// Answers one request; yields the refresh token only on a completed exchange.
    fn handle(&self, req: tiny_http::Request) -> Option<String> {
        if req.method() != &Method::Get {
            respond(req, 405, "text/plain", "method not allowed".into());
            return None;
        }

        let url = match Url::parse(&format!("http://callback{}", req.url())) {
            Ok(url) => url,
            Err(_) => {
                respond(req, 400, "text/plain", "malformed request".into());
                return None;
            }
        };
        if url.path() != self.path {
            respond(req, 404, "text/plain", "not found".into());
            return None;
        }

        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        if params.get("state").map(String::as_str) != Some(self.expected_state.as_str()) {
            tracing::warn!("authorization callback with mismatched state");
            respond(req, 400, "text/plain", "state mismatch".into());
            return None;
        }

        if let Some(error) = params.get("error") {
            tracing::warn!(error = %error, "authorization denied by provider");
            self.status.set(AuthState::Failed);
            // The value comes from the query string; never interpolate it into markup.
            respond(
                req,
                401,
                "text/plain; charset=utf-8",
                format!("authorization denied: {}", error),
            );
            return None;
        }

        let code = match params.get("code") {
            Some(code) if !code.is_empty() => code.clone(),
            _ => {
                respond(req, 400, "text/plain", "authorization code not found".into());
                return None;
            }
        };

        self.status.set(AuthState::Exchanging);
        let outcome = self
            .exchange_code(&code)
            .and_then(|token| self.store.save(&token).map(|_| token).map_err(AuthError::from));
        match outcome {
            Ok(token) => {
                respond(req, 200, "text/html; charset=utf-8", HTML_SUCCESS.clone());
                Some(token)
            }
            Err(err) => {
                tracing::error!(error = %err, "authorization code exchange failed");
                self.status.set(AuthState::Failed);
                respond(
                    req,
                    500,
                    "text/html; charset=utf-8",
                    page("Authorization Failed", "error during authorization"),
                );
                None
            }
        }
    }

    fn exchange_code(&self, code: &str) -> Result<String, AuthError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
        ];
        let resp = self
            .client
            .post(&self.cfg.token_url)
            .header(USER_AGENT, self.cfg.user_agent.clone())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .basic_auth(&self.cfg.client_id, Some(self.cfg.client_secret.as_str()))
            .form(&form)
            .send()
            .map_err(|err| AuthError::ExchangeFailed(format!("token request: {}", err)))?;

        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<TokenError>(&body) {
                return Err(AuthError::ExchangeFailed(err.to_string()));
            }
            return Err(AuthError::ExchangeFailed(format!("{}: {}", status, body)));
        }

        let payload: TokenResponse = serde_json::from_str(&body)
            .map_err(|err| AuthError::ExchangeFailed(format!("decode token response: {}", err)))?;
        match payload.refresh_token {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(AuthError::ExchangeFailed(
                payload
                    .error
                    .unwrap_or_else(|| "missing refresh token".into()),
            )),
        }
    }
}

fn respond(req: tiny_http::Request, status: u16, content_type: &str, body: String) {
    let mut response = Response::from_string(body).with_status_code(status);
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], content_type.as_bytes()) {
        response = response.with_header(header);
    }
    if let Err(err) = req.respond(response) {
        tracing::debug!(error = %err, "failed to answer authorization callback");
    }
}

fn random_string(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenError {
    #[serde(default)]
    error: String,
    #[serde(default, rename = "error_description")]
    description: String,
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.error.is_empty() && self.description.is_empty() {
            return write!(f, "unknown token error");
        }
        if self.description.is_empty() {
            write!(f, "authorization error: {}", self.error)
        } else if self.error.is_empty() {
            write!(f, "authorization error: {}", self.description)
        } else {
            write!(
                f,
                "authorization error: {} ({})",
                self.error, self.description
            )
        }
    }
}
