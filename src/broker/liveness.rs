//! Short-TTL memo of connection validity.
//!
//! Every place that might dispatch to a bound connection asks the same
//! question through [`LivenessCache::verdict`], so a record is judged the
//! same way by registration, relay, logout and the periodic sweep.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::registry::{ConnectionRecord, Verdict};
use super::state::ConnectionId;

#[derive(Debug, Clone, Copy)]
struct Cached {
    verdict: Verdict,
    checked_at: Instant,
}

#[derive(Debug)]
pub struct LivenessCache {
    ttl: Duration,
    stale_after: Duration,
    entries: HashMap<ConnectionId, Cached>,
}

impl LivenessCache {
    pub fn new(ttl: Duration, stale_after: Duration) -> Self {
        Self {
            ttl,
            stale_after,
            entries: HashMap::new(),
        }
    }

    /// Judge `record` at `now`, reusing a verdict younger than the TTL.
    pub fn verdict(&mut self, record: &ConnectionRecord, now: Instant) -> Verdict {
        if let Some(cached) = self.entries.get(&record.id) {
            if now.saturating_duration_since(cached.checked_at) < self.ttl {
                return cached.verdict;
            }
        }
        let verdict = self.probe(record, now);
        self.entries.insert(
            record.id,
            Cached {
                verdict,
                checked_at: now,
            },
        );
        verdict
    }

    #[cfg(test)]
    pub fn is_valid(&mut self, record: &ConnectionRecord, now: Instant) -> bool {
        self.verdict(record, now) == Verdict::Valid
    }

    /// Forget the cached verdict for a connection. Called whenever its
    /// record changes in a way the probe would notice.
    pub fn invalidate(&mut self, id: ConnectionId) {
        self.entries.remove(&id);
    }

    fn probe(&self, record: &ConnectionRecord, now: Instant) -> Verdict {
        if !record.transport_open() {
            return Verdict::Dead;
        }
        if now.saturating_duration_since(record.last_seen) > self.stale_after {
            return Verdict::Dead;
        }
        if record.is_closed_by_logout() {
            return Verdict::Excluded;
        }
        Verdict::Valid
    }
}
