use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reply_relay::auth::{AuthState, Config, Coordinator};
use reply_relay::storage::{Options, TokenStore};
use tiny_http::{Response, Server};

/// Stands in for the provider's token endpoint: accepts only `code=good`
/// presented with the right Basic credentials.
fn mock_token_endpoint(exchanges: Arc<AtomicUsize>) -> String {
    let server = Server::http("127.0.0.1:0").expect("bind mock token endpoint");
    let addr = server.server_addr().to_ip().expect("ip listener");
    let expected_auth = format!("Basic {}", STANDARD.encode("client:secret"));

    thread::spawn(move || {
        for mut request in server.incoming_requests() {
            let auth = request
                .headers()
                .iter()
                .find(|h| h.field.equiv("Authorization"))
                .map(|h| h.value.as_str().to_string());
            let mut body = String::new();
            let _ = request.as_reader().read_to_string(&mut body);
            exchanges.fetch_add(1, Ordering::SeqCst);

            let accepted = auth.as_deref() == Some(expected_auth.as_str())
                && body.contains("grant_type=authorization_code")
                && body.contains("code=good")
                && body.contains("redirect_uri=");
            let (status, payload) = if accepted {
                (
                    200,
                    r#"{"access_token":"at","token_type":"bearer","expires_in":3600,"refresh_token":"rt-123","scope":"identity"}"#,
                )
            } else {
                (400, r#"{"error":"invalid_grant"}"#)
            };
            let _ = request.respond(Response::from_string(payload).with_status_code(status));
        }
    });

    format!("http://{}/api/v1/access_token", addr)
}

fn config(token_url: String) -> Config {
    Config {
        client_id: "client".into(),
        client_secret: "secret".into(),
        scope: vec!["identity".into(), "read".into()],
        user_agent: "reply-relay-test/0.1".into(),
        auth_url: "https://www.reddit.com/api/v1/authorize".into(),
        token_url,
        redirect_uri: "http://127.0.0.1:0/callback".into(),
        timeout: Duration::from_secs(10),
        open_browser: false,
    }
}

#[test]
fn callback_exchange_persists_exactly_one_token() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = TokenStore::open(Options {
        path: Some(dir.path().join("reddit_token.txt")),
    });
    let exchanges = Arc::new(AtomicUsize::new(0));
    let token_url = mock_token_endpoint(exchanges.clone());
    let coordinator = Coordinator::new(store.clone(), config(token_url)).expect("coordinator");

    let pending = coordinator.begin().expect("listener");
    let status = pending.status();
    let redirect = pending.redirect_uri().to_string();
    let state = pending.state_token().to_string();

    let browser = thread::spawn(move || {
        let http = reqwest::blocking::Client::new();
        let hit = |params: &[(&str, &str)]| {
            http.get(&redirect)
                .query(params)
                .send()
                .expect("callback request")
                .status()
                .as_u16()
        };
        let denied = http
            .get(&redirect)
            .query(&[("state", state.as_str()), ("error", "<script>x</script>")])
            .send()
            .expect("denied callback");
        let denied_type = denied
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let denied_status = denied.status().as_u16();
        let denied_body = denied.text().expect("denied body");

        let statuses = vec![
            hit(&[("state", state.as_str())]),
            hit(&[("state", "forged"), ("code", "good")]),
            denied_status,
            hit(&[("state", state.as_str()), ("code", "bad")]),
            hit(&[("state", state.as_str()), ("code", "good")]),
        ];
        (statuses, denied_type, denied_body)
    });

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let token = runtime
        .block_on(pending.wait(Duration::from_secs(10)))
        .expect("token");

    let (statuses, denied_type, denied_body) = browser.join().expect("browser thread");
    assert_eq!(statuses, vec![400, 400, 401, 500, 200]);
    assert!(denied_type.starts_with("text/plain"), "{}", denied_type);
    assert_eq!(denied_body, "authorization denied: <script>x</script>");
    assert_eq!(token, "rt-123");
    assert_eq!(status.state(), AuthState::Complete);
    assert_eq!(store.load().expect("load").as_deref(), Some("rt-123"));
    // Only the two requests carrying a code with a valid state reach the provider.
    assert_eq!(exchanges.load(Ordering::SeqCst), 2);
}

#[test]
fn stored_token_means_no_listener_and_no_exchange() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = TokenStore::open(Options {
        path: Some(dir.path().join("reddit_token.txt")),
    });
    store.save("already-here").expect("save");
    let exchanges = Arc::new(AtomicUsize::new(0));
    let token_url = mock_token_endpoint(exchanges.clone());
    let coordinator = Coordinator::new(store, config(token_url)).expect("coordinator");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let token = runtime
        .block_on(coordinator.acquire_token())
        .expect("token");
    assert_eq!(token, "already-here");
    assert_eq!(exchanges.load(Ordering::SeqCst), 0);
}
