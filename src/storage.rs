use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

pub const DEFAULT_TOKEN_FILE: &str = "reddit_token.txt";

/// Persisted refresh token, one line of plaintext at a fixed path.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

impl TokenStore {
    pub fn open(opts: Options) -> Self {
        let path = opts
            .path
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TOKEN_FILE));
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the stored refresh token, or `None` when nothing usable is on disk.
    pub fn load(&self) -> Result<Option<String>> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("storage: read token file {}", self.path.display())
                })
            }
        };
        let token = data.trim();
        if token.is_empty() {
            return Ok(None);
        }
        Ok(Some(token.to_string()))
    }

    pub fn save(&self, token: &str) -> Result<()> {
        let token = token.trim();
        if token.is_empty() {
            bail!("storage: refusing to persist an empty token");
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("storage: create directory {}", parent.display())
                })?;
            }
        }
        fs::write(&self.path, token)
            .with_context(|| format!("storage: write token file {}", self.path.display()))
    }
}
