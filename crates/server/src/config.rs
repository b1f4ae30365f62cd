//! Command-line arguments and the `[stream]` config file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tether_stream_core::StreamConfig;

#[derive(Debug, Clone, Parser)]
#[command(name = "tether-server", version, about = "Tether session stream server")]
pub struct ServerArgs {
    /// Address to listen on
    #[arg(long, env = "TETHER_BIND", default_value = "127.0.0.1:4300")]
    pub bind: SocketAddr,

    /// Data directory (logs, config). Defaults to ~/.tether
    #[arg(long, env = "TETHER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Require this bearer token on /ws and /api/*
    #[arg(long, env = "TETHER_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// TOML file with a [stream] table. Defaults to <data_dir>/server.toml
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Delay between streamed words of the loopback agent, in milliseconds
    #[arg(long, default_value_t = 20)]
    pub echo_delay_ms: u64,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    stream: StreamConfig,
}

/// Load `StreamConfig` from `explicit`, or from `fallback` when it exists.
/// An explicit path that does not exist is an error; a missing fallback is not.
pub fn load_stream_config(explicit: Option<&Path>, fallback: &Path) -> anyhow::Result<StreamConfig> {
    let path = match explicit {
        Some(path) => path,
        None if fallback.exists() => fallback,
        None => return Ok(StreamConfig::default()),
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let file: ConfigFile =
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    Ok(file.stream)
}
