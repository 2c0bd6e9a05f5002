use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Result};
use parking_lot::Mutex;
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://oauth.reddit.com/";

const REFRESH_SKEW: Duration = Duration::from_secs(30);
const LOW_RATE_REMAINING: f64 = 10.0;

pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Result<OAuthToken, RemoteError>;
}

#[derive(Debug, Clone)]
pub struct OAuthToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: Option<SystemTime>,
}

impl OAuthToken {
    fn is_fresh(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => SystemTime::now() + REFRESH_SKEW < expires_at,
            None => true,
        }
    }
}

/// Structured error reported by the provider inside a 200 response
/// (`{"json": {"errors": [[code, message, field]]}}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSubError {
    pub code: String,
    pub message: String,
    pub field: Option<String>,
}

impl ApiSubError {
    fn from_raw(raw: &[Value]) -> Self {
        let text = |idx: usize| {
            raw.get(idx).and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
        };
        Self {
            code: text(0).unwrap_or_else(|| "UNKNOWN".into()),
            message: text(1).unwrap_or_default(),
            field: text(2),
        }
    }
}

impl fmt::Display for ApiSubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}: {} ({})", self.code, self.message, field),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

fn join_sub_errors(errors: &[ApiSubError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("reddit: unauthorized")]
    Unauthorized,
    #[error("reddit: forbidden")]
    Forbidden,
    #[error("reddit: not found")]
    NotFound,
    #[error("reddit: rate limited: {0}")]
    RateLimited(String),
    #[error("reddit: api error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("reddit: {}", join_sub_errors(.0))]
    ApiErrors(Vec<ApiSubError>),
    #[error("reddit: token refresh failed: {0}")]
    Token(String),
    #[error("reddit: request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("reddit: decode {context}: {source}")]
    Decode {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("reddit: invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("reddit: {0}")]
    Invalid(String),
}

/// Trades the long-lived refresh token for short-lived access tokens,
/// caching each one until shortly before it expires.
pub struct RefreshTokenProvider {
    http: HttpClient,
    token_url: String,
    client_id: String,
    client_secret: String,
    user_agent: String,
    refresh_token: String,
    cached: Mutex<Option<OAuthToken>>,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub user_agent: String,
    pub token_url: String,
}

impl RefreshTokenProvider {
    pub fn new(creds: Credentials, http: HttpClient) -> Result<Self> {
        if creds.refresh_token.trim().is_empty() {
            bail!("reddit: refresh token required");
        }
        Ok(Self {
            http,
            token_url: creds.token_url,
            client_id: creds.client_id,
            client_secret: creds.client_secret,
            user_agent: creds.user_agent,
            refresh_token: creds.refresh_token,
            cached: Mutex::new(None),
        })
    }

    fn exchange(&self) -> Result<OAuthToken, RemoteError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", self.refresh_token.as_str()),
        ];
        let resp = self
            .http
            .post(&self.token_url)
            .header(USER_AGENT, self.user_agent.clone())
            .basic_auth(&self.client_id, Some(self.client_secret.as_str()))
            .form(&form)
            .send()?;
        let status = resp.status();
        let body = resp.text()?;
        if !status.is_success() {
            return Err(RemoteError::Token(format!("{}: {}", status, body)));
        }
        let payload: AccessTokenResponse =
            serde_json::from_str(&body).map_err(|source| RemoteError::Decode {
                context: "access token",
                source,
            })?;
        if payload.access_token.is_empty() {
            return Err(RemoteError::Token(
                payload.error.unwrap_or_else(|| "missing access token".into()),
            ));
        }
        let expires_in = if payload.expires_in == 0 {
            3600
        } else {
            payload.expires_in
        };
        Ok(OAuthToken {
            access_token: payload.access_token,
            token_type: payload.token_type.unwrap_or_else(|| "bearer".into()),
            expires_at: SystemTime::now().checked_add(Duration::from_secs(expires_in)),
        })
    }
}

impl TokenProvider for RefreshTokenProvider {
    fn token(&self) -> Result<OAuthToken, RemoteError> {
        let mut cached = self.cached.lock();
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.clone());
        }
        tracing::debug!("refreshing reddit access token");
        let token = self.exchange()?;
        *cached = Some(token.clone());
        Ok(token)
    }
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: u64,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub base_url: Option<String>,
    pub http_client: Option<HttpClient>,
}

#[derive(Debug, Clone, Default)]
pub struct ListingOptions {
    pub after: Option<String>,
    pub limit: Option<u32>,
    pub extra: Vec<(String, String)>,
}

impl ListingOptions {
    pub fn newest(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            extra: vec![("sort".into(), "new".into())],
            ..Self::default()
        }
    }

    fn into_params(self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(after) = self.after {
            params.push(("after".into(), after));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".into(), limit.to_string()));
        }
        params.extend(self.extra);
        params
    }
}

/// Blocking Reddit API client. Built once per process and shared read-only.
pub struct Client {
    token_provider: Arc<dyn TokenProvider>,
    http: HttpClient,
    user_agent: String,
    base_url: Url,
}

impl Client {
    pub fn new(token_provider: Arc<dyn TokenProvider>, config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("reddit client user agent required");
        }
        let base = config
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = Url::parse(&base)?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(Duration::from_secs(20))
                .build()?,
        };

        Ok(Client {
            token_provider,
            http,
            user_agent: config.user_agent,
            base_url,
        })
    }

    pub fn user_comments(
        &self,
        username: &str,
        opts: ListingOptions,
    ) -> Result<Listing<Comment>, RemoteError> {
        let path = format!("/user/{}/comments", trim_user_prefix(username));
        self.fetch_listing(&path, opts)
    }

    pub fn user_submissions(
        &self,
        username: &str,
        opts: ListingOptions,
    ) -> Result<Listing<Post>, RemoteError> {
        let path = format!("/user/{}/submitted", trim_user_prefix(username));
        self.fetch_listing(&path, opts)
    }

    /// Returns the post plus the raw comment listing; the nested reply shapes
    /// are normalized by the comment tree module.
    pub fn comments(&self, subreddit: &str, article: &str) -> Result<PostComments, RemoteError> {
        if article.trim().is_empty() {
            return Err(RemoteError::Invalid("post id is required".into()));
        }
        let base = subreddit.trim_start_matches("r/");
        let path = if base.is_empty() {
            format!("/comments/{}.json", article)
        } else {
            format!("/r/{}/comments/{}.json", base, article)
        };
        let resp = self.request(Method::GET, &path, &[], None)?;
        let mut payload: Vec<Value> = decode(resp, "comments payload")?;
        if payload.len() < 2 {
            return Err(RemoteError::Invalid(
                "comments payload missing elements".into(),
            ));
        }
        let comments = payload.swap_remove(1);
        let post_listing: ListingEnvelope<Post> = serde_json::from_value(payload.swap_remove(0))
            .map_err(|source| RemoteError::Decode {
                context: "post listing",
                source,
            })?;
        let post = post_listing
            .data
            .children
            .into_iter()
            .next()
            .map(|thing| thing.data)
            .ok_or_else(|| RemoteError::Invalid("post listing empty".into()))?;
        Ok(PostComments { post, comments })
    }

    pub fn comment(&self, id: &str) -> Result<Comment, RemoteError> {
        let fullname = fullname("t1", id);
        let params = vec![("id".to_string(), fullname)];
        let resp = self.request(Method::GET, "/api/info", &params, None)?;
        let listing: ListingEnvelope<Comment> = decode(resp, "comment info")?;
        listing
            .data
            .children
            .into_iter()
            .next()
            .map(|thing| thing.data)
            .ok_or(RemoteError::NotFound)
    }

    pub fn me(&self) -> Result<Identity, RemoteError> {
        let resp = self.request(Method::GET, "/api/v1/me", &[], None)?;
        let identity: Identity = decode(resp, "identity")?;
        if identity.name.is_empty() {
            return Err(RemoteError::Invalid("identity missing name".into()));
        }
        Ok(identity)
    }

    /// Walks every page of the authenticated user's subscriptions.
    pub fn subscriptions(&self) -> Result<Vec<Subreddit>, RemoteError> {
        let mut all = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let opts = ListingOptions {
                after: after.take(),
                limit: Some(100),
                ..ListingOptions::default()
            };
            let page: Listing<Subreddit> =
                self.fetch_listing("/subreddits/mine/subscriber", opts)?;
            all.extend(page.children.into_iter().map(|thing| thing.data));
            match page.after {
                Some(next) if !next.is_empty() => after = Some(next),
                _ => break,
            }
        }
        Ok(all)
    }

    pub fn vote(&self, fullname: &str, dir: i32) -> Result<(), RemoteError> {
        if !(-1..=1).contains(&dir) {
            return Err(RemoteError::Invalid(
                "vote direction must be -1, 0, or 1".into(),
            ));
        }
        let form = vec![
            ("id".to_string(), fullname.to_string()),
            ("dir".to_string(), dir.to_string()),
        ];
        self.request(Method::POST, "/api/vote", &[], Some(form))?;
        Ok(())
    }

    pub fn reply(&self, parent: &str, text: &str) -> Result<Comment, RemoteError> {
        if parent.trim().is_empty() {
            return Err(RemoteError::Invalid("reply parent is required".into()));
        }
        if text.trim().is_empty() {
            return Err(RemoteError::Invalid("reply text is required".into()));
        }
        let form = vec![
            ("parent".to_string(), parent.to_string()),
            ("text".to_string(), text.to_string()),
            ("api_type".to_string(), "json".to_string()),
        ];
        let resp = self.request(Method::POST, "/api/comment", &[], Some(form))?;
        let payload: CommentResponse = decode(resp, "comment response")?;
        check_api_errors(&payload.json.errors)?;
        payload
            .json
            .data
            .map(|data| data.things)
            .unwrap_or_default()
            .into_iter()
            .next()
            .map(|thing| thing.data)
            .ok_or_else(|| RemoteError::Invalid("comment response empty".into()))
    }

    pub fn delete(&self, fullname: &str) -> Result<(), RemoteError> {
        let form = vec![("id".to_string(), fullname.to_string())];
        self.request(Method::POST, "/api/del", &[], Some(form))?;
        Ok(())
    }

    fn fetch_listing<T>(&self, path: &str, opts: ListingOptions) -> Result<Listing<T>, RemoteError>
    where
        T: DeserializeOwned,
    {
        let params = opts.into_params();
        let resp = self.request(Method::GET, path, &params, None)?;
        let listing: ListingEnvelope<T> = decode(resp, "listing")?;
        Ok(listing.data)
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        form: Option<Vec<(String, String)>>,
    ) -> Result<Response, RemoteError> {
        let token = self.token_provider.token()?;
        let mut url = self.base_url.join(path.trim_start_matches('/'))?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }
        url.query_pairs_mut().append_pair("raw_json", "1");

        let mut req = self.http.request(method, url);
        req = req.header(USER_AGENT, self.user_agent.clone());
        req = req.header(
            AUTHORIZATION,
            format!("{} {}", bearer(&token.token_type), token.access_token),
        );
        if let Some(form_data) = form {
            req = req.header(CONTENT_TYPE, "application/x-www-form-urlencoded");
            req = req.form(&form_data);
        }

        let resp = req.send()?;
        if let Some((remaining, reset_secs)) = low_rate_limit(resp.headers()) {
            tracing::warn!(remaining, reset_secs, "reddit rate limit nearly exhausted");
        }
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        Err(match status.as_u16() {
            401 => RemoteError::Unauthorized,
            403 => RemoteError::Forbidden,
            404 => RemoteError::NotFound,
            429 => RemoteError::RateLimited(body),
            code => RemoteError::Api { status: code, body },
        })
    }
}

fn bearer(token_type: &str) -> &str {
    if token_type.eq_ignore_ascii_case("bearer") || token_type.is_empty() {
        "Bearer"
    } else {
        token_type
    }
}

fn decode<T: DeserializeOwned>(resp: Response, context: &'static str) -> Result<T, RemoteError> {
    let body = resp.text()?;
    serde_json::from_str(&body).map_err(|source| RemoteError::Decode { context, source })
}

fn check_api_errors(errors: &[Vec<Value>]) -> Result<(), RemoteError> {
    if errors.is_empty() {
        return Ok(());
    }
    Err(RemoteError::ApiErrors(
        errors.iter().map(|raw| ApiSubError::from_raw(raw)).collect(),
    ))
}

/// Remaining requests and seconds until reset, when the window is nearly used up.
fn low_rate_limit(headers: &HeaderMap) -> Option<(f64, f64)> {
    let remaining = header_float(headers, "x-ratelimit-remaining")?;
    if remaining >= LOW_RATE_REMAINING {
        return None;
    }
    let reset = header_float(headers, "x-ratelimit-reset").unwrap_or(0.0);
    Some((remaining, reset))
}

fn header_float(headers: &HeaderMap, key: &str) -> Option<f64> {
    headers
        .get(key)
        .and_then(|value| value.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
}

fn trim_user_prefix(username: &str) -> &str {
    username
        .trim()
        .trim_start_matches("/u/")
        .trim_start_matches("u/")
}

/// Prefixes a bare id with its thing kind (`t1_`, `t3_`, ...) unless it already has one.
pub fn fullname(kind: &str, id: &str) -> String {
    let prefix = format!("{}_", kind);
    if id.starts_with(&prefix) {
        id.to_string()
    } else {
        format!("{}{}", prefix, id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing<T> {
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub before: Option<String>,
    pub children: Vec<Thing<T>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thing<T> {
    pub kind: String,
    pub data: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subreddit: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub selftext: String,
    #[serde(default)]
    pub permalink: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub num_comments: i64,
    #[serde(default)]
    pub created_utc: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub subreddit: String,
    #[serde(default)]
    pub created_utc: f64,
}

#[derive(Debug, Clone)]
pub struct PostComments {
    pub post: Post,
    pub comments: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subreddit {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub display_name_prefixed: String,
    #[serde(default)]
    pub subreddit_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ListingEnvelope<T> {
    data: Listing<T>,
}

#[derive(Debug, Clone, Deserialize)]
struct CommentResponse {
    json: CommentResponseBody,
}

#[derive(Debug, Clone, Deserialize)]
struct CommentResponseBody {
    #[serde(default)]
    errors: Vec<Vec<Value>>,
    #[serde(default)]
    data: Option<CommentResponseData>,
}

#[derive(Debug, Clone, Deserialize)]
struct CommentResponseData {
    #[serde(default)]
    things: Vec<Thing<Comment>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fullname_is_idempotent() {
        assert_eq!(fullname("t1", "abc"), "t1_abc");
        assert_eq!(fullname("t1", "t1_abc"), "t1_abc");
        assert_eq!(fullname("t3", "t1_abc"), "t3_t1_abc");
    }

    #[test]
    fn sub_errors_keep_provider_codes() {
        let payload: CommentResponse = serde_json::from_value(json!({
            "json": {
                "errors": [["RATELIMIT", "you are doing that too much", "ratelimit"]],
            }
        }))
        .unwrap();
        let err = check_api_errors(&payload.json.errors).unwrap_err();
        match err {
            RemoteError::ApiErrors(items) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].code, "RATELIMIT");
                assert_eq!(items[0].field.as_deref(), Some("ratelimit"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn successful_reply_payload_decodes() {
        let payload: CommentResponse = serde_json::from_value(json!({
            "json": {
                "errors": [],
                "data": {"things": [{"kind": "t1", "data": {"id": "new1", "name": "t1_new1", "body": "hi"}}]}
            }
        }))
        .unwrap();
        assert!(check_api_errors(&payload.json.errors).is_ok());
        let things = payload.json.data.unwrap().things;
        assert_eq!(things[0].data.id, "new1");
    }

    #[test]
    fn low_rate_limit_only_when_window_nearly_spent() {
        let mut headers = HeaderMap::new();
        assert_eq!(low_rate_limit(&headers), None);

        headers.insert("x-ratelimit-used", "590".parse().unwrap());
        assert_eq!(low_rate_limit(&headers), None);

        headers.insert("x-ratelimit-remaining", "42.0".parse().unwrap());
        assert_eq!(low_rate_limit(&headers), None);

        headers.insert("x-ratelimit-remaining", "3.0".parse().unwrap());
        headers.insert("x-ratelimit-reset", "120".parse().unwrap());
        assert_eq!(low_rate_limit(&headers), Some((3.0, 120.0)));
    }

    #[test]
    fn listing_options_keep_paging_cursor_and_sort() {
        let params = ListingOptions {
            after: Some("t3_next".into()),
            ..ListingOptions::newest(25)
        }
        .into_params();
        assert_eq!(
            params,
            vec![
                ("after".to_string(), "t3_next".to_string()),
                ("limit".to_string(), "25".to_string()),
                ("sort".to_string(), "new".to_string()),
            ]
        );
    }

    #[test]
    fn user_prefix_is_trimmed() {
        assert_eq!(trim_user_prefix("u/someone"), "someone");
        assert_eq!(trim_user_prefix("/u/someone"), "someone");
        assert_eq!(trim_user_prefix("someone"), "someone");
    }

    #[test]
    fn token_freshness_respects_skew() {
        let stale = OAuthToken {
            access_token: "a".into(),
            token_type: "bearer".into(),
            expires_at: SystemTime::now().checked_add(Duration::from_secs(5)),
        };
        assert!(!stale.is_fresh());
        let fresh = OAuthToken {
            expires_at: SystemTime::now().checked_add(Duration::from_secs(600)),
            ..stale
        };
        assert!(fresh.is_fresh());
    }
}
