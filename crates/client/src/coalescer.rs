//! Client-side batching of ephemeral events.
//!
//! Durable events flush whatever ephemeral batch is pending and are then
//! delivered on their own, immediately. Ephemeral events accumulate until
//! the interval elapses (counted from the first pending event) or a size
//! cap is exceeded. Nothing is ever reordered.

use std::time::Duration;

use tether_protocol::SequencedEvent;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Durable(SequencedEvent),
    Ephemeral(Vec<SequencedEvent>),
}

pub struct DeltaCoalescer<F>
where
    F: FnMut(Delivery),
{
    interval: Duration,
    max_events: usize,
    max_bytes: usize,
    pending: Vec<SequencedEvent>,
    pending_bytes: usize,
    first_pending_at: Option<Instant>,
    emit: F,
}

impl<F> DeltaCoalescer<F>
where
    F: FnMut(Delivery),
{
    pub fn new(interval: Duration, max_events: usize, max_bytes: usize, emit: F) -> Self {
        Self {
            interval,
            max_events: max_events.max(1),
            max_bytes,
            pending: Vec::new(),
            pending_bytes: 0,
            first_pending_at: None,
            emit,
        }
    }

    pub fn receive(&mut self, event: SequencedEvent, now: Instant) {
        if event.is_durable() {
            self.flush();
            (self.emit)(Delivery::Durable(event));
            return;
        }

        self.pending_bytes += estimated_size(&event);
        self.pending.push(event);
        self.first_pending_at.get_or_insert(now);

        if self.pending.len() >= self.max_events || self.pending_bytes >= self.max_bytes {
            self.flush();
        }
    }

    /// When the pending batch is due, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        self.first_pending_at.map(|first| first + self.interval)
    }

    pub fn on_tick(&mut self, now: Instant) {
        if self.deadline().is_some_and(|due| now >= due) {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        self.first_pending_at = None;
        self.pending_bytes = 0;
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        (self.emit)(Delivery::Ephemeral(batch));
    }
}

fn estimated_size(event: &SequencedEvent) -> usize {
    let payload = match event.payload.as_str() {
        Some(text) => text.len(),
        None => event.payload.to_string().len(),
    };
    event.name.len() + payload
}
