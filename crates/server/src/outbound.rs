//! Outbound queue for one WebSocket connection.
//!
//! Every frame for a connection goes through one queue drained by a single
//! writer task. The queue tracks its depth so senders can shed ephemeral
//! frames under backpressure; durable and control frames are always queued.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tether_protocol::{SequencedEvent, ServerMessage};
use tokio::sync::mpsc;
use tracing::debug;

/// Frames that can be sent through the WebSocket
#[derive(Debug)]
pub enum OutboundMessage {
    Json(ServerMessage),
    Ping(Bytes),
    Pong(Bytes),
    /// Close the socket; sent when a newer connection replaces this one.
    Close,
}

#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    depth: Arc<AtomicUsize>,
    drop_threshold: usize,
}

pub struct OutboundReceiver {
    rx: mpsc::UnboundedReceiver<OutboundMessage>,
    depth: Arc<AtomicUsize>,
}

pub fn channel(drop_threshold: usize) -> (OutboundQueue, OutboundReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        OutboundQueue {
            tx,
            depth: depth.clone(),
            drop_threshold,
        },
        OutboundReceiver { rx, depth },
    )
}

impl OutboundQueue {
    /// Queue a frame regardless of depth. Returns false once the writer is gone.
    pub fn send(&self, message: OutboundMessage) -> bool {
        self.depth.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(message).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    pub fn send_json(&self, message: ServerMessage) -> bool {
        self.send(OutboundMessage::Json(message))
    }

    /// Queue an event frame. Ephemeral events are dropped when the queue is
    /// at or above the threshold.
    pub fn send_event(&self, event: SequencedEvent) -> bool {
        if !event.is_durable() && self.depth() >= self.drop_threshold {
            debug!(
                component = "outbound",
                event = "outbound.ephemeral.dropped",
                session_id = %event.session_id,
                name = %event.name,
                depth = self.depth(),
                "Dropped ephemeral frame under backpressure"
            );
            return false;
        }
        self.send_json(ServerMessage::Event(event))
    }

    pub fn close(&self) {
        let _ = self.send(OutboundMessage::Close);
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl OutboundReceiver {
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        let message = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(message)
    }
}
