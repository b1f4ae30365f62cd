//! Last-seen sequence numbers, persisted across client restarts.
//!
//! Used for restart detection: a server that reports a `current_seq` below
//! the stored value has restarted and lost its numbering.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PersistedSeqs {
    version: i32,
    sessions: HashMap<String, u64>,
}

impl Default for PersistedSeqs {
    fn default() -> Self {
        Self {
            version: 1,
            sessions: HashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SeqStore {
    path: Option<PathBuf>,
    state: PersistedSeqs,
    dirty: bool,
}

impl SeqStore {
    /// Load from `path`. A missing or unreadable file starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
                warn!(
                    component = "seq_store",
                    event = "seq_store.load.corrupt",
                    path = %path.display(),
                    error = %e,
                    "Ignoring unreadable last-seen store"
                );
                PersistedSeqs::default()
            }),
            Err(_) => PersistedSeqs::default(),
        };
        Self {
            path: Some(path),
            state,
            dirty: false,
        }
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<u64> {
        self.state.sessions.get(session_id).copied()
    }

    pub fn set(&mut self, session_id: &str, seq: u64) {
        if self.get(session_id) == Some(seq) {
            return;
        }
        self.state.sessions.insert(session_id.to_string(), seq);
        self.dirty = true;
    }

    pub fn remove(&mut self, session_id: &str) {
        if self.state.sessions.remove(session_id).is_some() {
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write to disk if anything changed since the last flush.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(path) = &self.path {
            save(path, &self.state)?;
        }
        self.dirty = false;
        Ok(())
    }
}

fn save(path: &Path, state: &PersistedSeqs) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec(state)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, data)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
