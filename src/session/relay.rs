//! Session relay: push a session blob to every connection of a user and
//! retry until all of them acknowledge.
//!
//! A connection correlates relay acks by connection alone, so at most one
//! relay per user may be in flight. Overlapping [`SessionRelay::deliver`]
//! calls for the same user queue behind each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::broker::ack::collect_acks;
use crate::broker::handle::{BrokerHandle, HandleError};

/// Retry schedule for [`SessionRelay::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPolicy {
    pub max_attempts: u32,
    pub per_attempt_timeout: Duration,
    /// Pause between a failed attempt and the next one.
    pub backoff: Duration,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            per_attempt_timeout: Duration::from_secs(10),
            backoff: Duration::from_millis(500),
        }
    }
}

type UserLock = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug, Clone)]
pub struct SessionRelay {
    handle: BrokerHandle,
    policy: RelayPolicy,
    in_flight: Arc<Mutex<HashMap<String, UserLock>>>,
}

impl SessionRelay {
    pub fn new(handle: BrokerHandle, policy: RelayPolicy) -> Self {
        Self {
            handle,
            policy,
            in_flight: Arc::default(),
        }
    }

    pub async fn has_connections(&self, user_id: &str) -> Result<bool, HandleError> {
        Ok(!self.handle.connections_for(user_id).await?.is_empty())
    }

    fn user_lock(&self, user_id: &str) -> UserLock {
        let mut locks = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(user_id.to_owned()).or_default())
    }

    /// Drop the user's entry once nobody else holds or waits on it.
    fn release_user_lock(&self, user_id: &str, lock: UserLock) {
        let mut locks = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(user_id);
        }
    }

    /// Deliver `payload` to every valid connection of `user_id`.
    ///
    /// Returns `true` once every connection in one attempt's snapshot has
    /// acknowledged successfully. Returns `false` straight away when the
    /// user has no connections, and after the last attempt otherwise.
    /// Each attempt takes a fresh snapshot, so connections that joined or
    /// left in between are accounted for.
    pub async fn deliver(&self, user_id: &str, payload: &[u8]) -> Result<bool, HandleError> {
        let lock = self.user_lock(user_id);
        let result = {
            let _guard = lock.lock().await;
            self.deliver_exclusive(user_id, payload).await
        };
        self.release_user_lock(user_id, lock);
        result
    }

    async fn deliver_exclusive(&self, user_id: &str, payload: &[u8]) -> Result<bool, HandleError> {
        if !self.has_connections(user_id).await? {
            tracing::debug!(%user_id, "no connections, relay skipped");
            return Ok(false);
        }

        let attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            let pending = self.handle.dispatch_relay(user_id, payload.to_vec()).await?;
            if pending.is_empty() {
                tracing::debug!(%user_id, attempt, "connections gone before relay");
                return Ok(false);
            }
            let targets = pending.len();
            let tally = collect_acks(pending, self.policy.per_attempt_timeout).await;
            if tally.all_acknowledged() {
                tracing::info!(%user_id, attempt, connections = targets, "session relayed");
                return Ok(true);
            }

            tracing::warn!(
                %user_id,
                attempt,
                acknowledged = tally.acknowledged.len(),
                refused = tally.refused.len(),
                missing = tally.missing.len(),
                "relay not fully acknowledged"
            );
            if attempt < attempts {
                tokio::time::sleep(self.policy.backoff).await;
            }
        }

        tracing::warn!(%user_id, attempts, "relay gave up");
        Ok(false)
    }
}
