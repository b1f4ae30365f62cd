//! Client configuration: `<data_dir>/client.toml`, overridable from the CLI.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tether_stream_core::StreamConfig;

use crate::error::{ClientError, Result};

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:4300";
const CONFIG_FILE: &str = "client.toml";
const SEQ_FILE: &str = "last-seen.json";

#[derive(Debug, Default, Deserialize)]
struct ClientFile {
    server_url: Option<String>,
    auth_token: Option<String>,
    #[serde(default)]
    stream: StreamConfig,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base HTTP URL of the server, e.g. `http://127.0.0.1:4300`.
    pub server_url: String,
    pub auth_token: Option<String>,
    pub data_dir: PathBuf,
    pub stream: StreamConfig,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            server_url: server_url.into(),
            auth_token: None,
            data_dir: data_dir.into(),
            stream: StreamConfig::default(),
        }
    }

    /// Read `client.toml` from `data_dir` if present.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        let file = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            toml::from_str::<ClientFile>(&raw)
                .map_err(|e| ClientError::Config(format!("{}: {e}", path.display())))?
        } else {
            ClientFile::default()
        };
        Ok(Self {
            server_url: file
                .server_url
                .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string()),
            auth_token: file.auth_token,
            data_dir: data_dir.to_path_buf(),
            stream: file.stream,
        })
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        if token.is_some() {
            self.auth_token = token;
        }
        self
    }

    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    pub fn http_base(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    pub fn ws_url(&self) -> String {
        let base = self.http_base();
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{base}/ws")
    }

    pub fn seq_store_path(&self) -> PathBuf {
        self.data_dir.join(SEQ_FILE)
    }
}

/// `explicit` > `~/.tether`.
pub fn resolve_data_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(dir) => Ok(dir.to_path_buf()),
        None => dirs::home_dir()
            .map(|home| home.join(".tether"))
            .ok_or_else(|| ClientError::Config("home directory not found".into())),
    }
}
