//! Tether client
//!
//! A reconnecting consumer of the session stream. `StreamClient::connect`
//! spawns the engine; the returned `ClientHandle` issues commands and the
//! event receiver yields ordered durable events, coalesced ephemeral
//! batches, turn acknowledgements and connection status changes.

pub mod coalescer;
pub mod config;
mod engine;
pub mod error;
pub mod handle;
pub mod resync;
pub mod seq_store;
pub mod session_sync;
pub mod transport;
pub mod watchdog;

pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use handle::{ClientEvent, ClientHandle, ConnectionStatus, LinkState, StreamClient, SyncPhase};
pub use seq_store::SeqStore;
