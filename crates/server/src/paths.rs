//! Where the server keeps its files.
//!
//! The data directory is fixed once at startup (`--data-dir`, then
//! `TETHER_DATA_DIR`, then `~/.tether`) and read from here afterwards.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::Context;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

const DEFAULT_DIR_NAME: &str = ".tether";

fn resolve(explicit: Option<&Path>, env: Option<String>, home: Option<PathBuf>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| env.filter(|value| !value.is_empty()).map(PathBuf::from))
        .or_else(|| home.map(|home| home.join(DEFAULT_DIR_NAME)))
}

/// Resolve and record the data directory.
pub fn init_data_dir(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    let dir = resolve(
        explicit,
        std::env::var("TETHER_DATA_DIR").ok(),
        dirs::home_dir(),
    )
    .context("no --data-dir, no TETHER_DATA_DIR and no home directory")?;

    *DATA_DIR.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(dir.clone());
    Ok(dir)
}

/// Panics before `init_data_dir`; every caller runs after startup.
pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
        .expect("data_dir() called before init_data_dir()")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Default location of the `[stream]` config file.
pub fn config_path() -> PathBuf {
    data_dir().join("server.toml")
}

pub fn ensure_dirs() -> io::Result<()> {
    std::fs::create_dir_all(log_dir())
}
