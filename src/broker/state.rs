//! Broker state — attached sockets, the connection registry and the
//! liveness cache.
//!
//! Owned exclusively by the broker loop. All methods are synchronous
//! state transitions; the only I/O is queueing items on a connection's
//! outbound channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::ipc::protocol::{
    ConnectionDescriptor, HierarchyAssignment, Message, OriginConfig, OriginLogoutConfig,
    Registration, Role,
};

use super::ack::PendingAck;
use super::config::BrokerConfig;
use super::connection::{Outbound, Outgoing};
use super::liveness::LivenessCache;
use super::registry::{Ack, ConnectionRecord, ConnectionRegistry, Hierarchy, Verdict};

/// Unique identifier for a socket accepted by the broker.
///
/// Monotonically increasing counter. A bound [`ConnectionRecord`] shares
/// the id of the socket it was registered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Close reason for records found dead by a sweep or snapshot.
pub const STALE_REASON: &str = "stale";

/// A socket that completed (or is completing) the hello handshake.
#[derive(Debug)]
struct Attachment {
    role: Option<Role>,
    outbound: Outbound,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct BrokerState {
    attachments: HashMap<ConnectionId, Attachment>,
    registry: ConnectionRegistry,
    liveness: LivenessCache,
    stale_after: Duration,
    origin: OriginConfig,
    origin_logout: OriginLogoutConfig,
}

impl BrokerState {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            attachments: HashMap::new(),
            registry: ConnectionRegistry::new(),
            liveness: LivenessCache::new(config.liveness_ttl, config.stale_after),
            stale_after: config.stale_after,
            origin: config.origin.relay_config(),
            origin_logout: config.origin.logout_config(),
        }
    }

    // -- Sockets --

    pub fn attach(&mut self, id: ConnectionId, outbound: Outbound, now: Instant) {
        self.attachments.insert(
            id,
            Attachment {
                role: None,
                outbound,
                last_seen: now,
            },
        );
    }

    /// Forget a socket and drop any binding it held. Idempotent.
    pub fn detach(&mut self, id: ConnectionId) -> Option<ConnectionRecord> {
        self.attachments.remove(&id);
        self.liveness.invalidate(id);
        self.registry.remove(id)
    }

    pub fn is_attached(&self, id: ConnectionId) -> bool {
        self.attachments.contains_key(&id)
    }

    pub fn set_role(&mut self, id: ConnectionId, role: Role) {
        if let Some(a) = self.attachments.get_mut(&id) {
            a.role = Some(role);
        }
    }

    pub fn role(&self, id: ConnectionId) -> Option<Role> {
        self.attachments.get(&id).and_then(|a| a.role)
    }

    /// Record inbound activity on a socket and on its binding.
    pub fn touch(&mut self, id: ConnectionId, now: Instant) {
        if let Some(a) = self.attachments.get_mut(&id) {
            a.last_seen = now;
        }
        if let Some(r) = self.registry.get_mut(id) {
            r.last_seen = now;
        }
    }

    /// Queue a message on a socket. Returns `false` if it is gone.
    pub fn send_to(&self, id: ConnectionId, message: Message) -> bool {
        self.attachments
            .get(&id)
            .is_some_and(|a| a.outbound.send(Outgoing::Message(message)).is_ok())
    }

    /// Ask a socket's task to close, optionally with a `close_notice`.
    pub fn close(&self, id: ConnectionId, reason: Option<&str>) {
        if let Some(a) = self.attachments.get(&id) {
            let _ = a.outbound.send(Outgoing::Close {
                notice: reason.map(str::to_owned),
            });
        }
    }

    pub fn outbound(&self, id: ConnectionId) -> Option<Outbound> {
        self.attachments.get(&id).map(|a| a.outbound.clone())
    }

    // -- Registry queries --

    pub fn record(&self, id: ConnectionId) -> Option<&ConnectionRecord> {
        self.registry.get(id)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Valid connections bound to `user_id`, pruning dead ones.
    pub fn connections_for(&mut self, user_id: &str, now: Instant) -> Vec<ConnectionId> {
        let liveness = &mut self.liveness;
        let (valid, pruned) = self
            .registry
            .connections_for(user_id, |r| liveness.verdict(r, now));
        self.release(pruned);
        valid
    }

    /// Drop every dead binding of `client_id`.
    pub fn prune_client(&mut self, client_id: &str, now: Instant) {
        let dead: Vec<_> = self
            .registry
            .client_bindings(client_id)
            .into_iter()
            .filter(|id| self.verdict(*id, now) == Verdict::Dead)
            .collect();
        let pruned = dead
            .into_iter()
            .filter_map(|id| self.registry.remove(id))
            .collect();
        self.release(pruned);
    }

    pub fn find_duplicate(
        &mut self,
        node_id: &str,
        client_id: &str,
        user_id: Option<&str>,
        now: Instant,
    ) -> Option<ConnectionId> {
        let liveness = &mut self.liveness;
        self.registry
            .find_duplicate(node_id, client_id, user_id, |r| liveness.verdict(r, now))
    }

    /// Valid bindings of `client_id`, lowest id first.
    pub fn live_bindings(&mut self, client_id: &str, now: Instant) -> Vec<ConnectionId> {
        self.registry
            .client_bindings(client_id)
            .into_iter()
            .filter(|id| self.verdict(*id, now) == Verdict::Valid)
            .collect()
    }

    fn verdict(&mut self, id: ConnectionId, now: Instant) -> Verdict {
        match self.registry.get(id) {
            Some(r) => self.liveness.verdict(r, now),
            None => Verdict::Dead,
        }
    }

    // -- Registry mutations --

    /// Bind socket `id` as a new record described by `reg`. Returns
    /// `false` if the socket is gone or already bound.
    pub fn bind(&mut self, id: ConnectionId, reg: &Registration, now: Instant) -> bool {
        let Some(a) = self.attachments.get(&id) else {
            return false;
        };
        let mut record = ConnectionRecord::new(
            id,
            reg.node_id.clone(),
            reg.client_id.clone(),
            a.outbound.clone(),
            now,
        );
        record.user_id = reg.user_id.clone();
        record.username = reg.username.clone();
        record.hierarchy = Hierarchy {
            domain_id: reg.domain_id.clone(),
            cluster_id: reg.cluster_id.clone(),
            channel_id: reg.channel_id.clone(),
            ..Hierarchy::default()
        };
        self.liveness.invalidate(id);
        self.registry.add(record)
    }

    /// Switch an existing binding to the user in `reg`. Hierarchy ids
    /// are only overwritten where `reg` carries one. Returns the previous
    /// user id.
    pub fn rebind(&mut self, id: ConnectionId, reg: &Registration) -> Option<String> {
        let record = self.registry.get_mut(id)?;
        let previous = record.user_id.clone();
        record.username = reg.username.clone();
        if reg.domain_id.is_some() {
            record.hierarchy.domain_id = reg.domain_id.clone();
        }
        if reg.cluster_id.is_some() {
            record.hierarchy.cluster_id = reg.cluster_id.clone();
        }
        if reg.channel_id.is_some() {
            record.hierarchy.channel_id = reg.channel_id.clone();
        }
        // A relay in flight was for the old user.
        record.cancel_relay_ack();
        self.registry.move_user(id, reg.user_id.clone());
        self.liveness.invalidate(id);
        previous
    }

    /// Remove `ids` from the registry and close their sockets with
    /// `reason`. Returns how many were bound.
    pub fn evict(&mut self, ids: &[ConnectionId], reason: &str) -> usize {
        let mut removed = 0;
        for &id in ids {
            self.liveness.invalidate(id);
            if let Some(record) = self.registry.remove(id) {
                record.close(Some(reason));
                removed += 1;
            }
        }
        removed
    }

    fn release(&mut self, pruned: Vec<ConnectionRecord>) {
        for record in pruned {
            tracing::debug!(conn_id = %record.id, node_id = %record.node_id, "pruned dead connection");
            self.liveness.invalidate(record.id);
            record.close(Some(STALE_REASON));
        }
    }

    // -- Dispatch --

    /// Send `relay_session` to every valid connection of `user_id`.
    pub fn dispatch_relay(
        &mut self,
        user_id: &str,
        session_payload: &[u8],
        now: Instant,
    ) -> Vec<PendingAck> {
        let targets = self.connections_for(user_id, now);
        let mut pending = Vec::with_capacity(targets.len());
        let mut closed = Vec::new();
        for id in targets {
            let Some(record) = self.registry.get_mut(id) else {
                continue;
            };
            let message = Message::RelaySession {
                user_id: user_id.to_owned(),
                session_payload: session_payload.to_vec(),
                origin: self.origin.clone(),
            };
            match record.send(message) {
                Ok(()) => pending.push(PendingAck {
                    connection_id: id,
                    ack: record.expect_relay_ack(),
                }),
                Err(_) => closed.push(id),
            }
        }
        self.drop_closed(&closed);
        pending
    }

    /// Send `logout` to every valid connection of `user_id` and mark each
    /// one closed-by-logout once the send has been queued.
    pub fn dispatch_logout(&mut self, user_id: &str, now: Instant) -> Vec<PendingAck> {
        let targets = self.connections_for(user_id, now);
        let mut pending = Vec::with_capacity(targets.len());
        let mut closed = Vec::new();
        for id in targets {
            let Some(record) = self.registry.get_mut(id) else {
                continue;
            };
            let message = Message::Logout {
                user_id: user_id.to_owned(),
                username: record.username.clone().unwrap_or_else(|| user_id.to_owned()),
                origin_logout: self.origin_logout.clone(),
            };
            if record.send(message).is_err() {
                closed.push(id);
                continue;
            }
            record.mark_closed_by_logout();
            record.cancel_relay_ack();
            pending.push(PendingAck {
                connection_id: id,
                ack: record.expect_logout_ack(),
            });
            self.liveness.invalidate(id);
        }
        self.drop_closed(&closed);
        pending
    }

    fn drop_closed(&mut self, ids: &[ConnectionId]) {
        for &id in ids {
            tracing::debug!(conn_id = %id, "send failed, dropping binding");
            self.liveness.invalidate(id);
            self.registry.remove(id);
        }
    }

    pub fn resolve_relay_ack(&mut self, id: ConnectionId, ack: Ack) -> bool {
        self.registry
            .get_mut(id)
            .is_some_and(|r| r.resolve_relay_ack(ack))
    }

    pub fn resolve_logout_ack(&mut self, id: ConnectionId, ack: Ack) -> bool {
        self.registry
            .get_mut(id)
            .is_some_and(|r| r.resolve_logout_ack(ack))
    }

    // -- Hierarchy --

    /// Overwrite the hierarchy fields of a bound record whose node id
    /// matches the assignment. With `notify`, the agent is told.
    pub fn apply_hierarchy(
        &mut self,
        id: ConnectionId,
        assignment: &HierarchyAssignment,
        notify: bool,
    ) -> bool {
        let Some(record) = self.registry.get_mut(id) else {
            return false;
        };
        if record.node_id != assignment.node_id {
            return false;
        }
        record.hierarchy = Hierarchy::from(assignment);
        if notify {
            let _ = record.send(Message::HierarchyAssigned(assignment.clone()));
        }
        true
    }

    // -- Introspection and upkeep --

    /// Descriptors of bound connections, optionally for one user.
    pub fn describe(&self, user_id: Option<&str>) -> Vec<ConnectionDescriptor> {
        let mut out: Vec<_> = self
            .registry
            .records()
            .filter(|r| user_id.is_none_or(|u| r.user_id.as_deref() == Some(u)))
            .map(ConnectionRecord::describe)
            .collect();
        out.sort_by_key(|d| d.connection_id);
        out
    }

    /// Remove dead bindings and close sockets that have been silent past
    /// the stale threshold. Returns the number of bindings removed.
    ///
    /// Records closed by logout are left for the logout coordinator,
    /// which evicts them once its ack wait ends.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let bound: Vec<_> = self.registry.records().map(|r| r.id).collect();
        let dead: Vec<_> = bound
            .into_iter()
            .filter(|id| self.verdict(*id, now) == Verdict::Dead)
            .collect();
        let pruned: Vec<_> = dead
            .into_iter()
            .filter_map(|id| self.registry.remove(id))
            .collect();
        let removed = pruned.len();
        self.release(pruned);

        for (id, a) in &self.attachments {
            if !self.registry.contains(*id)
                && now.saturating_duration_since(a.last_seen) > self.stale_after
            {
                tracing::debug!(conn_id = %id, "closing idle socket");
                let _ = a.outbound.send(Outgoing::Close {
                    notice: Some(STALE_REASON.to_owned()),
                });
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn state() -> BrokerState {
        BrokerState::new(&BrokerConfig::default())
    }

    fn attach(s: &mut BrokerState, now: Instant) -> (ConnectionId, mpsc::UnboundedReceiver<Outgoing>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        s.attach(id, tx, now);
        s.set_role(id, Role::Agent);
        (id, rx)
    }

    fn reg(node: &str, client: &str, user: Option<&str>) -> Registration {
        Registration {
            node_id: node.into(),
            client_id: client.into(),
            user_id: user.map(str::to_owned),
            ..Registration::default()
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> Vec<Outgoing> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    #[test]
    fn connection_ids_are_ordered() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert!(a < b);
        assert_eq!(a.to_string(), format!("conn-{}", a.get()));
    }

    #[test]
    fn bind_then_detach_clears_registry() {
        let mut s = state();
        let now = Instant::now();
        let (id, _rx) = attach(&mut s, now);
        assert!(s.bind(id, &reg("n1", "c1", Some("u1")), now));
        assert_eq!(s.connections_for("u1", now), vec![id]);

        s.detach(id);
        assert!(s.connections_for("u1", now).is_empty());
        assert!(s.registry().client_bucket("c1").is_none());
        assert!(!s.is_attached(id));
    }

    #[test]
    fn bind_requires_attachment() {
        let mut s = state();
        assert!(!s.bind(ConnectionId::new(), &reg("n1", "c1", None), Instant::now()));
    }

    #[test]
    fn rebind_moves_user_and_keeps_hierarchy() {
        let mut s = state();
        let now = Instant::now();
        let (id, _rx) = attach(&mut s, now);
        let mut first = reg("n1", "c1", Some("u1"));
        first.domain_id = Some("d1".into());
        s.bind(id, &first, now);

        let previous = s.rebind(id, &reg("n1", "c1", Some("u2")));
        assert_eq!(previous.as_deref(), Some("u1"));
        assert!(s.connections_for("u1", now).is_empty());
        assert_eq!(s.connections_for("u2", now), vec![id]);
        assert_eq!(s.record(id).unwrap().hierarchy.domain_id.as_deref(), Some("d1"));
    }

    #[test]
    fn dispatch_relay_queues_message_and_arms_ack() {
        let mut s = state();
        let now = Instant::now();
        let (id, mut rx) = attach(&mut s, now);
        s.bind(id, &reg("n1", "c1", Some("u1")), now);

        let mut pending = s.dispatch_relay("u1", b"tok-123", now);
        assert_eq!(pending.len(), 1);
        match drain(&mut rx).as_slice() {
            [Outgoing::Message(Message::RelaySession { session_payload, .. })] => {
                assert_eq!(session_payload, b"tok-123");
            }
            other => panic!("expected relay_session, got {other:?}"),
        }

        assert!(s.resolve_relay_ack(
            id,
            Ack {
                success: true,
                message: String::new()
            }
        ));
        assert!(pending[0].ack.try_recv().unwrap().success);
    }

    #[test]
    fn dispatch_logout_marks_and_excludes() {
        let mut s = state();
        let now = Instant::now();
        let (id, mut rx) = attach(&mut s, now);
        let mut r = reg("n1", "c1", Some("u1"));
        r.username = Some("alice".into());
        s.bind(id, &r, now);

        let pending = s.dispatch_logout("u1", now);
        assert_eq!(pending.len(), 1);
        match drain(&mut rx).as_slice() {
            [Outgoing::Message(Message::Logout { username, .. })] => assert_eq!(username, "alice"),
            other => panic!("expected logout, got {other:?}"),
        }
        assert!(s.record(id).unwrap().is_closed_by_logout());
        // Excluded from further snapshots but still bound.
        assert!(s.connections_for("u1", now).is_empty());
        assert!(s.record(id).is_some());
        // A second logout finds nothing to send to.
        assert!(s.dispatch_logout("u1", now).is_empty());
    }

    #[test]
    fn dispatch_to_closed_transport_drops_binding() {
        let mut s = state();
        let now = Instant::now();
        let (id, rx) = attach(&mut s, now);
        s.bind(id, &reg("n1", "c1", Some("u1")), now);
        drop(rx);
        assert!(s.dispatch_relay("u1", b"x", now).is_empty());
        assert!(s.record(id).is_none());
    }

    #[test]
    fn evict_closes_with_reason() {
        let mut s = state();
        let now = Instant::now();
        let (id, mut rx) = attach(&mut s, now);
        s.bind(id, &reg("n1", "c1", Some("u1")), now);
        assert_eq!(s.evict(&[id, ConnectionId::new()], "logged out"), 1);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [Outgoing::Close { notice: Some(n) }] if n == "logged out"
        ));
        assert_eq!(s.evict(&[id], "logged out"), 0);
    }

    #[test]
    fn apply_hierarchy_requires_matching_node() {
        let mut s = state();
        let now = Instant::now();
        let (id, mut rx) = attach(&mut s, now);
        s.bind(id, &reg("n1", "c1", Some("u1")), now);

        let mut a = HierarchyAssignment {
            node_id: "n2".into(),
            domain_id: Some("d1".into()),
            ..HierarchyAssignment::default()
        };
        assert!(!s.apply_hierarchy(id, &a, true));

        a.node_id = "n1".into();
        a.is_domain_main = true;
        assert!(s.apply_hierarchy(id, &a, true));
        let h = &s.record(id).unwrap().hierarchy;
        assert_eq!(h.domain_id.as_deref(), Some("d1"));
        assert!(h.is_domain_main);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [Outgoing::Message(Message::HierarchyAssigned(_))]
        ));
        // Index membership is untouched.
        assert_eq!(s.registry().len(), 1);
    }

    #[test]
    fn sweep_removes_silent_bindings() {
        let mut s = state();
        let now = Instant::now();
        let (quiet, mut quiet_rx) = attach(&mut s, now);
        let (busy, _busy_rx) = attach(&mut s, now);
        s.bind(quiet, &reg("n1", "c1", Some("u1")), now);
        s.bind(busy, &reg("n2", "c2", Some("u1")), now);

        let later = now + Duration::from_secs(100);
        s.touch(busy, later);
        assert_eq!(s.sweep(later), 1);
        assert!(s.record(quiet).is_none());
        assert!(s.record(busy).is_some());
        assert!(drain(&mut quiet_rx)
            .iter()
            .any(|o| matches!(o, Outgoing::Close { notice: Some(n) } if n == STALE_REASON)));
    }

    #[test]
    fn sweep_closes_idle_unbound_sockets() {
        let mut s = state();
        let now = Instant::now();
        let (_id, mut rx) = attach(&mut s, now);
        s.sweep(now + Duration::from_secs(100));
        assert!(matches!(drain(&mut rx).as_slice(), [Outgoing::Close { .. }]));
    }

    #[test]
    fn describe_filters_by_user() {
        let mut s = state();
        let now = Instant::now();
        let (a, _ra) = attach(&mut s, now);
        let (b, _rb) = attach(&mut s, now);
        s.bind(a, &reg("n1", "c1", Some("u1")), now);
        s.bind(b, &reg("n2", "c2", Some("u2")), now);

        assert_eq!(s.describe(None).len(), 2);
        let only = s.describe(Some("u2"));
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].node_id, "n2");
    }
}
