use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_ENV_PREFIX: &str = "REPLY_RELAY";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub reddit: RedditConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedditConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
}

impl Default for RedditConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            user_agent: default_user_agent(),
            scopes: default_scopes(),
            redirect_uri: default_redirect_uri(),
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            api_base_url: default_api_base_url(),
        }
    }
}

fn default_user_agent() -> String {
    format!("reply-relay/{}", crate::VERSION)
}

pub fn default_scopes() -> Vec<String> {
    [
        "identity",
        "edit",
        "flair",
        "history",
        "modconfig",
        "modflair",
        "modlog",
        "modposts",
        "modwiki",
        "mysubreddits",
        "privatemessages",
        "read",
        "report",
        "save",
        "submit",
        "subscribe",
        "vote",
        "wikiedit",
        "wikiread",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_redirect_uri() -> String {
    "http://localhost:8080".into()
}

fn default_auth_url() -> String {
    "https://www.reddit.com/api/v1/authorize".into()
}

fn default_token_url() -> String {
    "https://www.reddit.com/api/v1/access_token".into()
}

fn default_api_base_url() -> String {
    crate::reddit::DEFAULT_BASE_URL.into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    #[serde(default = "default_auth_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_open_browser")]
    pub open_browser: bool,
    #[serde(default = "default_token_path")]
    pub token_path: PathBuf,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            timeout: default_auth_timeout(),
            open_browser: default_open_browser(),
            token_path: default_token_path(),
        }
    }
}

fn default_auth_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_open_browser() -> bool {
    true
}

fn default_token_path() -> PathBuf {
    PathBuf::from(crate::storage::DEFAULT_TOKEN_FILE)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            public_base_url: default_public_base_url(),
        }
    }
}

fn default_listen_addr() -> String {
    "localhost:8080".into()
}

fn default_public_base_url() -> String {
    "http://localhost:8080".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

pub fn default_workers() -> usize {
    5
}

impl Config {
    /// Checks the fields every network-facing command needs.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.reddit.client_id.trim().is_empty(),
            "config: reddit.client_id is required"
        );
        anyhow::ensure!(
            !self.reddit.user_agent.trim().is_empty(),
            "config: reddit.user_agent is required"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        let from_file = read_config_file(path)?;
        cfg = merge_config(cfg, from_file);
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    let overrides = env_overrides(prefix);
    for (key, value) in overrides {
        apply_env_value(&mut cfg, &key, value);
    }

    if cfg.dispatcher.workers == 0 {
        cfg.dispatcher.workers = default_workers();
    }

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if !other.reddit.client_id.is_empty() {
        base.reddit.client_id = other.reddit.client_id;
    }
    if !other.reddit.client_secret.is_empty() {
        base.reddit.client_secret = other.reddit.client_secret;
    }
    if !other.reddit.user_agent.is_empty() {
        base.reddit.user_agent = other.reddit.user_agent;
    }
    if !other.reddit.scopes.is_empty() {
        base.reddit.scopes = other.reddit.scopes;
    }
    if !other.reddit.redirect_uri.is_empty() {
        base.reddit.redirect_uri = other.reddit.redirect_uri;
    }
    if !other.reddit.auth_url.is_empty() {
        base.reddit.auth_url = other.reddit.auth_url;
    }
    if !other.reddit.token_url.is_empty() {
        base.reddit.token_url = other.reddit.token_url;
    }
    if !other.reddit.api_base_url.is_empty() {
        base.reddit.api_base_url = other.reddit.api_base_url;
    }

    base.auth.timeout = other.auth.timeout;
    base.auth.open_browser = other.auth.open_browser;
    if !other.auth.token_path.as_os_str().is_empty() {
        base.auth.token_path = other.auth.token_path;
    }

    if !other.server.listen_addr.is_empty() {
        base.server.listen_addr = other.server.listen_addr;
    }
    if !other.server.public_base_url.is_empty() {
        base.server.public_base_url = other.server.public_base_url;
    }

    if other.dispatcher.workers != 0 {
        base.dispatcher.workers = other.dispatcher.workers;
    }

    base
}

fn env_overrides(prefix: &str) -> HashMap<String, String> {
    let upper_prefix = format!("{}_", prefix.to_uppercase());
    env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix(&upper_prefix)
                .map(|stripped| (stripped.to_ascii_lowercase().replace("__", "."), value))
        })
        .collect()
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "reddit.client_id" => cfg.reddit.client_id = value,
        "reddit.client_secret" => cfg.reddit.client_secret = value,
        "reddit.user_agent" => cfg.reddit.user_agent = value,
        "reddit.redirect_uri" => cfg.reddit.redirect_uri = value,
        "reddit.auth_url" => cfg.reddit.auth_url = value,
        "reddit.token_url" => cfg.reddit.token_url = value,
        "reddit.api_base_url" => cfg.reddit.api_base_url = value,
        "reddit.scopes" => {
            cfg.reddit.scopes = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        "auth.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.auth.timeout = duration;
            }
        }
        "auth.open_browser" => {
            cfg.auth.open_browser = matches!(value.as_str(), "1" | "true" | "TRUE" | "True");
        }
        "auth.token_path" => cfg.auth.token_path = PathBuf::from(value),
        "server.listen_addr" => cfg.server.listen_addr = value,
        "server.public_base_url" => cfg.server.public_base_url = value,
        "dispatcher.workers" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.dispatcher.workers = parsed;
            }
        }
        _ => {}
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("reply-relay").join("config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn isolated() -> LoadOptions {
        LoadOptions {
            config_file: None,
            env_prefix: Some("REPLY_RELAY_TEST_UNSET".into()),
        }
    }

    #[test]
    fn defaults_cover_local_service() {
        let cfg = Config::default();
        assert_eq!(cfg.reddit.redirect_uri, "http://localhost:8080");
        assert_eq!(cfg.server.listen_addr, "localhost:8080");
        assert_eq!(cfg.dispatcher.workers, 5);
        assert_eq!(cfg.auth.token_path, PathBuf::from("reddit_token.txt"));
        assert!(cfg.reddit.scopes.iter().any(|s| s == "wikiread"));
        assert_eq!(cfg.reddit.scopes.len(), 19);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "reddit:\n  client_id: abc\n  client_secret: shh\nauth:\n  timeout: 30s\n  open_browser: false\ndispatcher:\n  workers: 2\n",
        )
        .unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("REPLY_RELAY_TEST_UNSET".into()),
        })
        .unwrap();
        assert_eq!(cfg.reddit.client_id, "abc");
        assert_eq!(cfg.reddit.client_secret, "shh");
        assert_eq!(cfg.auth.timeout, Duration::from_secs(30));
        assert!(!cfg.auth.open_browser);
        assert_eq!(cfg.dispatcher.workers, 2);
        assert_eq!(cfg.server.listen_addr, "localhost:8080");
    }

    #[test]
    fn env_values_override_defaults() {
        env::set_var("REPLY_RELAY_ENVTEST_REDDIT__CLIENT_ID", "from-env");
        env::set_var("REPLY_RELAY_ENVTEST_AUTH__TIMEOUT", "2m");
        env::set_var("REPLY_RELAY_ENVTEST_DISPATCHER__WORKERS", "0");
        let cfg = load(LoadOptions {
            config_file: None,
            env_prefix: Some("REPLY_RELAY_ENVTEST".into()),
        })
        .unwrap();
        assert_eq!(cfg.reddit.client_id, "from-env");
        assert_eq!(cfg.auth.timeout, Duration::from_secs(120));
        assert_eq!(cfg.dispatcher.workers, 5);
        env::remove_var("REPLY_RELAY_ENVTEST_REDDIT__CLIENT_ID");
        env::remove_var("REPLY_RELAY_ENVTEST_AUTH__TIMEOUT");
        env::remove_var("REPLY_RELAY_ENVTEST_DISPATCHER__WORKERS");
    }

    #[test]
    fn validate_requires_client_id() {
        let cfg = load(isolated()).unwrap();
        assert!(cfg.validate().is_err());
        let mut cfg = cfg;
        cfg.reddit.client_id = "id".into();
        assert!(cfg.validate().is_ok());
    }
}
