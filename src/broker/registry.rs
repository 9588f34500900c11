//! Connection registry — bound agent connections indexed by node, user
//! and client.
//!
//! Records are owned by the registry and keyed by [`ConnectionId`]; the
//! three indices only hold ids. Every insert, removal and user move goes
//! through this type so the indices cannot drift apart.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tokio::sync::oneshot;

use crate::ipc::protocol::{ConnectionDescriptor, HierarchyAssignment, Message};

use super::connection::{Outbound, Outgoing};
use super::state::ConnectionId;

/// An acknowledgment received from an agent for a relay or logout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub success: bool,
    pub message: String,
}

/// The socket this record's connection writes to has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("transport closed")]
pub struct TransportClosed;

/// Hierarchy placement of a bound connection.
///
/// Filled from the registration message or from the hierarchy
/// collaborator. Never derived by the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hierarchy {
    pub domain_id: Option<String>,
    pub cluster_id: Option<String>,
    pub channel_id: Option<String>,
    pub is_domain_main: bool,
    pub is_cluster_main: bool,
    pub is_channel_main: bool,
}

impl From<&HierarchyAssignment> for Hierarchy {
    fn from(a: &HierarchyAssignment) -> Self {
        Self {
            domain_id: a.domain_id.clone(),
            cluster_id: a.cluster_id.clone(),
            channel_id: a.channel_id.clone(),
            is_domain_main: a.is_domain_main,
            is_cluster_main: a.is_cluster_main,
            is_channel_main: a.is_channel_main,
        }
    }
}

/// State attached to one bound agent connection.
#[derive(Debug)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub node_id: String,
    pub client_id: String,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub hierarchy: Hierarchy,
    /// Last inbound activity on the connection.
    pub last_seen: Instant,
    closed_by_logout: bool,
    outbound: Outbound,
    relay_ack: Option<oneshot::Sender<Ack>>,
    logout_ack: Option<oneshot::Sender<Ack>>,
}

impl ConnectionRecord {
    pub fn new(
        id: ConnectionId,
        node_id: String,
        client_id: String,
        outbound: Outbound,
        now: Instant,
    ) -> Self {
        Self {
            id,
            node_id,
            client_id,
            user_id: None,
            username: None,
            hierarchy: Hierarchy::default(),
            last_seen: now,
            closed_by_logout: false,
            outbound,
            relay_ack: None,
            logout_ack: None,
        }
    }

    /// Queue a message for the connection's writer task.
    pub fn send(&self, message: Message) -> Result<(), TransportClosed> {
        self.outbound
            .send(Outgoing::Message(message))
            .map_err(|_| TransportClosed)
    }

    /// Ask the writer task to close the socket, optionally telling the
    /// agent why first.
    pub fn close(&self, reason: Option<&str>) {
        let _ = self.outbound.send(Outgoing::Close {
            notice: reason.map(str::to_owned),
        });
    }

    /// Whether the writer task is still draining this connection's queue.
    pub fn transport_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Set the closed-by-logout mark. Returns `false` if it was already set.
    pub fn mark_closed_by_logout(&mut self) -> bool {
        !std::mem::replace(&mut self.closed_by_logout, true)
    }

    pub fn is_closed_by_logout(&self) -> bool {
        self.closed_by_logout
    }

    /// Arm the relay-ack slot, replacing (and thereby cancelling) any
    /// earlier waiter.
    pub fn expect_relay_ack(&mut self) -> oneshot::Receiver<Ack> {
        let (tx, rx) = oneshot::channel();
        self.relay_ack = Some(tx);
        rx
    }

    /// Deliver a relay ack to its waiter. Returns `false` if nobody was
    /// waiting (late or unsolicited ack).
    pub fn resolve_relay_ack(&mut self, ack: Ack) -> bool {
        match self.relay_ack.take() {
            Some(tx) => tx.send(ack).is_ok(),
            None => false,
        }
    }

    /// Drop any outstanding relay waiter.
    pub fn cancel_relay_ack(&mut self) {
        self.relay_ack = None;
    }

    pub fn expect_logout_ack(&mut self) -> oneshot::Receiver<Ack> {
        let (tx, rx) = oneshot::channel();
        self.logout_ack = Some(tx);
        rx
    }

    pub fn resolve_logout_ack(&mut self, ack: Ack) -> bool {
        match self.logout_ack.take() {
            Some(tx) => tx.send(ack).is_ok(),
            None => false,
        }
    }

    pub fn describe(&self) -> ConnectionDescriptor {
        ConnectionDescriptor {
            connection_id: self.id.get(),
            node_id: self.node_id.clone(),
            client_id: self.client_id.clone(),
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            domain_id: self.hierarchy.domain_id.clone(),
            cluster_id: self.hierarchy.cluster_id.clone(),
            channel_id: self.hierarchy.channel_id.clone(),
            closed_by_logout: self.closed_by_logout,
        }
    }
}

/// Verdict of a validity check, as seen by the registry.
///
/// `Dead` records are pruned when encountered; `Excluded` ones (closed
/// by logout, awaiting eviction) are skipped but kept so their pending
/// logout ack can still land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Excluded,
    Dead,
}

type Index = HashMap<String, HashSet<ConnectionId>>;

fn index_insert(index: &mut Index, key: &str, id: ConnectionId) {
    index.entry(key.to_owned()).or_default().insert(id);
}

fn index_remove(index: &mut Index, key: &str, id: ConnectionId) {
    if let Some(bucket) = index.get_mut(key) {
        bucket.remove(&id);
        if bucket.is_empty() {
            index.remove(key);
        }
    }
}

/// Records plus the by-node, by-user and by-client indices over them.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    records: HashMap<ConnectionId, ConnectionRecord>,
    by_node: Index,
    by_user: Index,
    by_client: Index,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record into every index its identifiers qualify for.
    ///
    /// Returns `false` (and drops `record`) if a record with the same id
    /// is already present.
    pub fn add(&mut self, record: ConnectionRecord) -> bool {
        if self.records.contains_key(&record.id) {
            return false;
        }
        let id = record.id;
        if !record.node_id.is_empty() {
            index_insert(&mut self.by_node, &record.node_id, id);
        }
        if let Some(user) = record.user_id.as_deref().filter(|u| !u.is_empty()) {
            index_insert(&mut self.by_user, user, id);
        }
        if !record.client_id.is_empty() {
            index_insert(&mut self.by_client, &record.client_id, id);
        }
        self.records.insert(id, record);
        true
    }

    /// Remove a record from all three indices. Absent ids are a no-op.
    pub fn remove(&mut self, id: ConnectionId) -> Option<ConnectionRecord> {
        let record = self.records.remove(&id)?;
        index_remove(&mut self.by_node, &record.node_id, id);
        if let Some(user) = record.user_id.as_deref() {
            index_remove(&mut self.by_user, user, id);
        }
        index_remove(&mut self.by_client, &record.client_id, id);
        Some(record)
    }

    /// Move a record to another `by_user` bucket. `None` (or an empty id)
    /// takes it out of `by_user` entirely. Node and client indices are
    /// untouched.
    pub fn move_user(&mut self, id: ConnectionId, new_user: Option<String>) -> bool {
        let Some(record) = self.records.get_mut(&id) else {
            return false;
        };
        let new_user = new_user.filter(|u| !u.is_empty());
        if let Some(old) = record.user_id.take() {
            index_remove(&mut self.by_user, &old, id);
        }
        if let Some(user) = new_user.as_deref() {
            index_insert(&mut self.by_user, user, id);
        }
        record.user_id = new_user;
        true
    }

    /// An existing valid record with exactly this (node, client, user)
    /// triple.
    pub fn find_duplicate(
        &self,
        node_id: &str,
        client_id: &str,
        user_id: Option<&str>,
        mut verdict: impl FnMut(&ConnectionRecord) -> Verdict,
    ) -> Option<ConnectionId> {
        self.by_client
            .get(client_id)?
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| r.node_id == node_id && r.user_id.as_deref() == user_id)
            .find(|r| verdict(r) == Verdict::Valid)
            .map(|r| r.id)
    }

    /// Snapshot of the valid connections bound to `user_id`.
    ///
    /// Dead records met along the way are removed from every index and
    /// returned in the second element so the caller can release them.
    pub fn connections_for(
        &mut self,
        user_id: &str,
        mut verdict: impl FnMut(&ConnectionRecord) -> Verdict,
    ) -> (Vec<ConnectionId>, Vec<ConnectionRecord>) {
        let Some(bucket) = self.by_user.get(user_id) else {
            return (Vec::new(), Vec::new());
        };
        let mut valid = Vec::new();
        let mut dead = Vec::new();
        for id in bucket {
            if let Some(record) = self.records.get(id) {
                match verdict(record) {
                    Verdict::Valid => valid.push(*id),
                    Verdict::Excluded => {}
                    Verdict::Dead => dead.push(*id),
                }
            }
        }
        valid.sort();
        let pruned = dead.into_iter().filter_map(|id| self.remove(id)).collect();
        (valid, pruned)
    }

    /// Ids of every record bound to `client_id`, valid or not.
    pub fn client_bindings(&self, client_id: &str) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .by_client
            .get(client_id)
            .map(|b| b.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionRecord> {
        self.records.get_mut(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn records(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[cfg(test)]
    pub fn node_bucket(&self, node_id: &str) -> Option<&HashSet<ConnectionId>> {
        self.by_node.get(node_id)
    }

    #[cfg(test)]
    pub fn user_bucket(&self, user_id: &str) -> Option<&HashSet<ConnectionId>> {
        self.by_user.get(user_id)
    }

    #[cfg(test)]
    pub fn client_bucket(&self, client_id: &str) -> Option<&HashSet<ConnectionId>> {
        self.by_client.get(client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn record(node: &str, client: &str, user: Option<&str>) -> (ConnectionRecord, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut r = ConnectionRecord::new(
            ConnectionId::new(),
            node.into(),
            client.into(),
            tx,
            Instant::now(),
        );
        r.user_id = user.map(str::to_owned);
        (r, rx)
    }

    fn all_valid(_: &ConnectionRecord) -> Verdict {
        Verdict::Valid
    }

    #[test]
    fn add_indexes_all_present_identifiers() {
        let mut reg = ConnectionRegistry::new();
        let (r, _rx) = record("n1", "c1", Some("u1"));
        let id = r.id;
        assert!(reg.add(r));
        assert!(reg.node_bucket("n1").unwrap().contains(&id));
        assert!(reg.user_bucket("u1").unwrap().contains(&id));
        assert!(reg.client_bucket("c1").unwrap().contains(&id));
    }

    #[test]
    fn add_skips_empty_user() {
        let mut reg = ConnectionRegistry::new();
        let (r, _rx) = record("n1", "c1", None);
        reg.add(r);
        let (r2, _rx2) = record("n2", "c2", Some(""));
        reg.add(r2);
        assert_eq!(reg.len(), 2);
        assert!(reg.user_bucket("").is_none());
    }

    #[test]
    fn add_twice_is_idempotent() {
        let mut reg = ConnectionRegistry::new();
        let (r, _rx) = record("n1", "c1", Some("u1"));
        let id = r.id;
        let (tx, _rx2) = mpsc::unbounded_channel();
        let mut again = ConnectionRecord::new(id, "n1".into(), "c1".into(), tx, Instant::now());
        again.user_id = Some("u1".into());

        assert!(reg.add(r));
        assert!(!reg.add(again));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.user_bucket("u1").unwrap().len(), 1);
    }

    #[test]
    fn remove_clears_every_index_and_empty_buckets() {
        let mut reg = ConnectionRegistry::new();
        let (r, _rx) = record("n1", "c1", Some("u1"));
        let id = r.id;
        reg.add(r);
        assert!(reg.remove(id).is_some());
        assert!(reg.node_bucket("n1").is_none());
        assert!(reg.user_bucket("u1").is_none());
        assert!(reg.client_bucket("c1").is_none());
    }

    #[test]
    fn remove_absent_is_noop() {
        let mut reg = ConnectionRegistry::new();
        assert!(reg.remove(ConnectionId::new()).is_none());
    }

    #[test]
    fn move_user_only_touches_user_index() {
        let mut reg = ConnectionRegistry::new();
        let (r, _rx) = record("n1", "c1", Some("u1"));
        let id = r.id;
        reg.add(r);

        assert!(reg.move_user(id, Some("u2".into())));
        assert!(reg.user_bucket("u1").is_none());
        assert!(reg.user_bucket("u2").unwrap().contains(&id));
        assert!(reg.node_bucket("n1").unwrap().contains(&id));
        assert!(reg.client_bucket("c1").unwrap().contains(&id));
        assert_eq!(reg.get(id).unwrap().user_id.as_deref(), Some("u2"));
    }

    #[test]
    fn move_user_to_none_leaves_by_user() {
        let mut reg = ConnectionRegistry::new();
        let (r, _rx) = record("n1", "c1", Some("u1"));
        let id = r.id;
        reg.add(r);
        reg.move_user(id, None);
        assert!(reg.user_bucket("u1").is_none());
        assert_eq!(reg.get(id).unwrap().user_id, None);
    }

    #[test]
    fn find_duplicate_requires_full_triple() {
        let mut reg = ConnectionRegistry::new();
        let (r, _rx) = record("n1", "c1", Some("u1"));
        let id = r.id;
        reg.add(r);

        assert_eq!(reg.find_duplicate("n1", "c1", Some("u1"), all_valid), Some(id));
        assert_eq!(reg.find_duplicate("n1", "c1", Some("u2"), all_valid), None);
        assert_eq!(reg.find_duplicate("n2", "c1", Some("u1"), all_valid), None);
        assert_eq!(reg.find_duplicate("n1", "c1", None, all_valid), None);
    }

    #[test]
    fn find_duplicate_ignores_invalid_records() {
        let mut reg = ConnectionRegistry::new();
        let (r, _rx) = record("n1", "c1", Some("u1"));
        reg.add(r);
        assert_eq!(
            reg.find_duplicate("n1", "c1", Some("u1"), |_| Verdict::Dead),
            None
        );
    }

    #[test]
    fn connections_for_prunes_dead_and_keeps_excluded() {
        let mut reg = ConnectionRegistry::new();
        let (alive, _a) = record("n1", "c1", Some("u1"));
        let (dead, _d) = record("n2", "c2", Some("u1"));
        let (excluded, _e) = record("n3", "c3", Some("u1"));
        let (alive_id, dead_id, excluded_id) = (alive.id, dead.id, excluded.id);
        reg.add(alive);
        reg.add(dead);
        reg.add(excluded);

        let (valid, pruned) = reg.connections_for("u1", |r| {
            if r.id == dead_id {
                Verdict::Dead
            } else if r.id == excluded_id {
                Verdict::Excluded
            } else {
                Verdict::Valid
            }
        });

        assert_eq!(valid, vec![alive_id]);
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].id, dead_id);
        assert!(!reg.contains(dead_id));
        assert!(reg.node_bucket("n2").is_none());
        assert!(reg.contains(excluded_id));
    }

    #[test]
    fn connections_for_unknown_user_is_empty() {
        let mut reg = ConnectionRegistry::new();
        let (valid, pruned) = reg.connections_for("nobody", all_valid);
        assert!(valid.is_empty() && pruned.is_empty());
    }

    #[test]
    fn closed_by_logout_mark_is_set_once() {
        let (mut r, _rx) = record("n1", "c1", Some("u1"));
        assert!(r.mark_closed_by_logout());
        assert!(!r.mark_closed_by_logout());
        assert!(r.is_closed_by_logout());
    }

    #[test]
    fn relay_ack_slot_replaced_by_newer_dispatch() {
        let (mut r, _rx) = record("n1", "c1", Some("u1"));
        let mut first = r.expect_relay_ack();
        let second = r.expect_relay_ack();
        // The first waiter is cancelled as soon as the slot is re-armed.
        assert!(first.try_recv().is_err());
        assert!(r.resolve_relay_ack(Ack {
            success: true,
            message: String::new(),
        }));
        drop(second);
        // No waiter left: a second ack is a no-op.
        assert!(!r.resolve_relay_ack(Ack {
            success: true,
            message: String::new(),
        }));
    }

    #[test]
    fn send_after_writer_gone_reports_transport_closed() {
        let (r, rx) = record("n1", "c1", None);
        drop(rx);
        assert!(!r.transport_open());
        assert_eq!(r.send(Message::Heartbeat), Err(TransportClosed));
    }
}
