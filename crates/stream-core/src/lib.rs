//! Tether stream core
//!
//! Pure, synchronous building blocks shared by the server and client:
//! sequence rings and catch-up, turn dedupe, backoff and reconnect
//! state machines, keepalive bookkeeping. Nothing in here performs I/O
//! or owns a timer; callers drive these types from their event loops.

pub mod backoff;
pub mod catch_up;
pub mod config;
pub mod error;
pub mod keepalive;
pub mod reconnect;
pub mod ring;
pub mod tracker;
pub mod turn_cache;

pub use backoff::BackoffPolicy;
pub use catch_up::CatchUpOutcome;
pub use config::StreamConfig;
pub use error::StreamError;
pub use keepalive::{PingAction, PingTracker};
pub use reconnect::{Generation, ReconnectCoordinator, ReconnectPhase, ReconnectStep};
pub use ring::SequenceRing;
pub use tracker::{Observation, SequenceTracker};
pub use turn_cache::{PayloadFingerprint, SubmitOutcome, TurnDedupeCache, TurnRecord};
