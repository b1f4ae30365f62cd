//! Shared router state

use std::sync::Arc;

use tether_stream_core::StreamConfig;

use crate::owner::OwnerHandle;

#[derive(Clone)]
pub struct AppState {
    pub owner: OwnerHandle,
    pub config: Arc<StreamConfig>,
}

impl AppState {
    pub fn new(owner: OwnerHandle, config: StreamConfig) -> Self {
        Self {
            owner,
            config: Arc::new(config),
        }
    }
}
