//! Waiting on per-connection acknowledgments.
//!
//! The broker loop hands out one [`PendingAck`] per connection it sent
//! to. Waiting happens off the loop, on the receivers alone, so a slow
//! or silent agent only ever delays the task that asked.

use std::collections::BTreeSet;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::oneshot;

use super::registry::Ack;
use super::state::ConnectionId;

/// Receiver for the next ack of one connection.
#[derive(Debug)]
pub struct PendingAck {
    pub connection_id: ConnectionId,
    pub ack: oneshot::Receiver<Ack>,
}

/// Outcome of waiting on a batch of [`PendingAck`]s.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AckTally {
    /// Acked with `success: true`.
    pub acknowledged: Vec<ConnectionId>,
    /// Acked with `success: false`, with the agent's message.
    pub refused: Vec<(ConnectionId, String)>,
    /// No ack before the deadline, or the connection went away.
    pub missing: Vec<ConnectionId>,
}

impl AckTally {
    pub fn all_acknowledged(&self) -> bool {
        self.refused.is_empty() && self.missing.is_empty()
    }

    /// Connections that answered at all, successfully or not.
    pub fn answered(&self) -> usize {
        self.acknowledged.len() + self.refused.len()
    }
}

/// Wait until every pending ack resolves or `timeout` elapses.
///
/// Only the wait is bounded; the messages already queued to the agents
/// are not recalled. A waiter whose sender is dropped (connection gone,
/// or a newer dispatch re-armed the slot) counts as missing immediately.
pub async fn collect_acks(pending: Vec<PendingAck>, timeout: Duration) -> AckTally {
    let mut outstanding: BTreeSet<ConnectionId> =
        pending.iter().map(|p| p.connection_id).collect();
    let mut waiting: FuturesUnordered<_> = pending
        .into_iter()
        .map(|p| async move { (p.connection_id, p.ack.await) })
        .collect();

    let deadline = tokio::time::Instant::now() + timeout;
    let mut tally = AckTally::default();

    loop {
        match tokio::time::timeout_at(deadline, waiting.next()).await {
            Ok(Some((id, Ok(ack)))) => {
                outstanding.remove(&id);
                if ack.success {
                    tally.acknowledged.push(id);
                } else {
                    tally.refused.push((id, ack.message));
                }
            }
            // Cancelled waiter: stays in `outstanding`.
            Ok(Some((_, Err(_)))) => {}
            Ok(None) | Err(_) => break,
        }
    }

    tally.missing = outstanding.into_iter().collect();
    tally
}
