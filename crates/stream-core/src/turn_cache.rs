//! Idempotency cache for client turns.
//!
//! Maps a client-generated `client_turn_id` to its delivery stage and a
//! fingerprint of the payload. Bounded two ways: LRU capacity and a TTL
//! measured from the last time the turn was seen. Every touch moves the
//! entry to the back of the LRU order, so the front is always the entry
//! seen longest ago and expiry only ever needs to look there.
//!
//! An in-flight record can be evicted before its command completes; a
//! retry arriving after that is treated as a new turn.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tether_protocol::{TurnKind, TurnStage};
use tracing::debug;

/// Content fingerprint of a turn payload (hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PayloadFingerprint(String);

impl PayloadFingerprint {
    pub fn of_turn(kind: TurnKind, message: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(message.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// First sighting; record created at `accepted`. Dispatch downstream.
    Accept,
    /// Same payload seen before. Do not dispatch; echo the stage.
    Duplicate(TurnStage),
    /// Same id, different payload.
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRecord {
    pub client_turn_id: String,
    pub stage: TurnStage,
    pub fingerprint: PayloadFingerprint,
    pub last_seen_at: Instant,
}

struct Slot {
    record: TurnRecord,
    tick: u64,
}

pub struct TurnDedupeCache {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<String, Slot>,
    lru: BTreeMap<u64, String>,
    next_tick: u64,
}

impl TurnDedupeCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            next_tick: 0,
        }
    }

    pub fn submit(
        &mut self,
        client_turn_id: &str,
        fingerprint: PayloadFingerprint,
    ) -> SubmitOutcome {
        self.submit_at(client_turn_id, fingerprint, Instant::now())
    }

    pub fn submit_at(
        &mut self,
        client_turn_id: &str,
        fingerprint: PayloadFingerprint,
        now: Instant,
    ) -> SubmitOutcome {
        self.evict_expired(now);

        if let Some(slot) = self.entries.get(client_turn_id) {
            if slot.record.fingerprint != fingerprint {
                return SubmitOutcome::Conflict;
            }
            let stage = slot.record.stage;
            self.touch(client_turn_id, now);
            return SubmitOutcome::Duplicate(stage);
        }

        let tick = self.bump_tick();
        self.entries.insert(
            client_turn_id.to_string(),
            Slot {
                record: TurnRecord {
                    client_turn_id: client_turn_id.to_string(),
                    stage: TurnStage::Accepted,
                    fingerprint,
                    last_seen_at: now,
                },
                tick,
            },
        );
        self.lru.insert(tick, client_turn_id.to_string());
        self.evict_over_capacity();
        SubmitOutcome::Accept
    }

    /// Move a turn forward. Stages never regress. Returns the stage now held,
    /// or `None` if the turn is unknown (never seen, or already evicted).
    pub fn advance(&mut self, client_turn_id: &str, stage: TurnStage) -> Option<TurnStage> {
        self.advance_at(client_turn_id, stage, Instant::now())
    }

    pub fn advance_at(
        &mut self,
        client_turn_id: &str,
        stage: TurnStage,
        now: Instant,
    ) -> Option<TurnStage> {
        self.evict_expired(now);
        let slot = self.entries.get_mut(client_turn_id)?;
        if stage > slot.record.stage {
            slot.record.stage = stage;
        }
        let held = slot.record.stage;
        self.touch(client_turn_id, now);
        Some(held)
    }

    pub fn get(&self, client_turn_id: &str) -> Option<&TurnRecord> {
        self.entries.get(client_turn_id).map(|slot| &slot.record)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn bump_tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn touch(&mut self, client_turn_id: &str, now: Instant) {
        let tick = self.bump_tick();
        if let Some(slot) = self.entries.get_mut(client_turn_id) {
            self.lru.remove(&slot.tick);
            slot.tick = tick;
            slot.record.last_seen_at = now;
            self.lru.insert(tick, client_turn_id.to_string());
        }
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some((&tick, id)) = self.lru.first_key_value() {
            let expired = self
                .entries
                .get(id)
                .map(|slot| now.saturating_duration_since(slot.record.last_seen_at) >= self.ttl)
                .unwrap_or(true);
            if !expired {
                break;
            }
            self.remove_at(tick, "ttl");
        }
    }

    fn evict_over_capacity(&mut self) {
        while self.entries.len() > self.capacity {
            let Some((&tick, _)) = self.lru.first_key_value() else {
                break;
            };
            self.remove_at(tick, "capacity");
        }
    }

    fn remove_at(&mut self, tick: u64, reason: &'static str) {
        let Some(id) = self.lru.remove(&tick) else {
            return;
        };
        if let Some(slot) = self.entries.remove(&id) {
            if slot.record.stage != TurnStage::Completed {
                debug!(
                    component = "turn_cache",
                    event = "turn_cache.evicted_in_flight",
                    client_turn_id = %id,
                    stage = ?slot.record.stage,
                    reason,
                    "Evicted a turn that had not completed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(message: &str) -> PayloadFingerprint {
        PayloadFingerprint::of_turn(TurnKind::Prompt, message)
    }

    #[test]
    fn accept_then_duplicate_then_conflict() {
        let mut cache = TurnDedupeCache::new(256, Duration::from_secs(900));
        let hash_a = fp("fix the tests");
        let hash_b = fp("delete the tests");

        assert_eq!(cache.submit("t1", hash_a.clone()), SubmitOutcome::Accept);
        assert_eq!(
            cache.submit("t1", hash_a),
            SubmitOutcome::Duplicate(TurnStage::Accepted)
        );
        assert_eq!(cache.submit("t1", hash_b), SubmitOutcome::Conflict);
    }

    #[test]
    fn duplicate_reports_advanced_stage() {
        let mut cache = TurnDedupeCache::new(8, Duration::from_secs(900));
        cache.submit("t1", fp("a"));
        assert_eq!(
            cache.advance("t1", TurnStage::Dispatched),
            Some(TurnStage::Dispatched)
        );
        assert_eq!(
            cache.submit("t1", fp("a")),
            SubmitOutcome::Duplicate(TurnStage::Dispatched)
        );
    }

    #[test]
    fn stages_never_regress() {
        let mut cache = TurnDedupeCache::new(8, Duration::from_secs(900));
        cache.submit("t1", fp("a"));
        cache.advance("t1", TurnStage::Completed);
        assert_eq!(
            cache.advance("t1", TurnStage::Dispatched),
            Some(TurnStage::Completed)
        );
    }

    #[test]
    fn conflict_does_not_replace_the_original() {
        let mut cache = TurnDedupeCache::new(8, Duration::from_secs(900));
        cache.submit("t1", fp("a"));
        assert_eq!(cache.submit("t1", fp("b")), SubmitOutcome::Conflict);
        assert_eq!(cache.get("t1").unwrap().fingerprint, fp("a"));
        assert_eq!(cache.submit("t1", fp("b")), SubmitOutcome::Conflict);
    }

    #[test]
    fn repeated_submissions_dispatch_once() {
        let mut cache = TurnDedupeCache::new(8, Duration::from_secs(900));
        let dispatches = (0..5)
            .map(|_| cache.submit("t1", fp("same")))
            .filter(|outcome| *outcome == SubmitOutcome::Accept)
            .count();
        assert_eq!(dispatches, 1);
    }

    #[test]
    fn lru_capacity_evicts_least_recently_seen() {
        let mut cache = TurnDedupeCache::new(2, Duration::from_secs(900));
        let t0 = Instant::now();
        cache.submit_at("t1", fp("1"), t0);
        cache.submit_at("t2", fp("2"), t0 + Duration::from_secs(1));
        // Touch t1 so t2 becomes the eviction candidate.
        cache.submit_at("t1", fp("1"), t0 + Duration::from_secs(2));
        cache.submit_at("t3", fp("3"), t0 + Duration::from_secs(3));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("t1").is_some());
        assert!(cache.get("t2").is_none());
        assert!(cache.get("t3").is_some());
    }

    #[test]
    fn ttl_expiry_turns_a_retry_into_a_new_turn() {
        let ttl = Duration::from_secs(900);
        let mut cache = TurnDedupeCache::new(256, ttl);
        let t0 = Instant::now();
        cache.submit_at("t1", fp("a"), t0);
        assert_eq!(
            cache.submit_at("t1", fp("a"), t0 + ttl - Duration::from_secs(1)),
            SubmitOutcome::Duplicate(TurnStage::Accepted)
        );
        // TTL runs from the last sighting.
        let last_seen = t0 + ttl - Duration::from_secs(1);
        assert_eq!(
            cache.submit_at("t1", fp("a"), last_seen + ttl),
            SubmitOutcome::Accept
        );
    }

    #[test]
    fn advance_on_unknown_turn_is_none() {
        let mut cache = TurnDedupeCache::new(4, Duration::from_secs(900));
        assert_eq!(cache.advance("missing", TurnStage::Completed), None);
    }

    #[test]
    fn fingerprint_separates_kind_and_message() {
        assert_ne!(
            PayloadFingerprint::of_turn(TurnKind::Prompt, "go"),
            PayloadFingerprint::of_turn(TurnKind::Steer, "go")
        );
        assert_eq!(fp("go").as_str().len(), 64);
    }
}
