//! Registration handshake: binding, duplicates, conflicts and user
//! switches.
//!
//! Runs on the broker loop, so concurrent registrations for the same
//! client are serialized and the first one wins.

use std::time::Instant;

use crate::ipc::protocol::{Message, Registration};

use super::state::{BrokerState, ConnectionId};

pub const INVALID_REGISTRATION: &str = "invalid_registration";
pub const DUPLICATE_REASON: &str = "duplicate, using existing connection";
pub const CONFLICT_REASON: &str = "client already bound to a different node";
pub const REBOUND_REASON: &str = "re-registered on existing connection";
pub const ALREADY_BOUND_REASON: &str = "connection already bound to another client";
pub const CLOSING_REASON: &str = "connection is closing after logout";

/// What a registration did to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// A new record was created for the registering socket.
    Bound {
        connection_id: ConnectionId,
        user_id: Option<String>,
    },
    /// An existing binding of the same client and node switched user.
    Rebound {
        connection_id: ConnectionId,
        previous_user: Option<String>,
        user_id: Option<String>,
    },
    /// The identical triple is already bound; nothing changed.
    Duplicate { existing: ConnectionId },
    Rejected { reason: &'static str },
    /// Missing node or client id.
    Invalid,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn normalize(mut reg: Registration) -> Registration {
    reg.user_id = non_empty(reg.user_id);
    reg.username = non_empty(reg.username);
    reg.domain_id = non_empty(reg.domain_id);
    reg.cluster_id = non_empty(reg.cluster_id);
    reg.channel_id = non_empty(reg.channel_id);
    reg
}

/// Handle a `register` message arriving on socket `conn`.
///
/// Replies are queued on the relevant sockets before returning.
pub fn register(
    state: &mut BrokerState,
    conn: ConnectionId,
    reg: Registration,
    now: Instant,
) -> RegistrationOutcome {
    let reg = normalize(reg);
    if reg.node_id.is_empty() || reg.client_id.is_empty() {
        state.send_to(
            conn,
            Message::Error {
                id: None,
                reason: INVALID_REGISTRATION.into(),
            },
        );
        return RegistrationOutcome::Invalid;
    }

    if let Some(own) = state.record(conn) {
        let rejection = if own.client_id != reg.client_id || own.node_id != reg.node_id {
            Some((ALREADY_BOUND_REASON, own.node_id.clone()))
        } else if own.is_closed_by_logout() {
            Some((CLOSING_REASON, own.node_id.clone()))
        } else {
            None
        };
        if let Some((reason, node_id)) = rejection {
            reject(state, conn, &reg, reason, Some(node_id));
            return RegistrationOutcome::Rejected { reason };
        }
    }

    state.prune_client(&reg.client_id, now);

    if let Some(existing) =
        state.find_duplicate(&reg.node_id, &reg.client_id, reg.user_id.as_deref(), now)
    {
        tracing::debug!(conn_id = %conn, %existing, client_id = %reg.client_id, "duplicate registration");
        state.send_to(existing, success(&reg));
        if existing != conn {
            state.close(conn, Some(DUPLICATE_REASON));
        }
        return RegistrationOutcome::Duplicate { existing };
    }

    let bindings = state.live_bindings(&reg.client_id, now);

    if let Some(other) = bindings
        .iter()
        .filter_map(|id| state.record(*id))
        .find(|r| r.node_id != reg.node_id)
    {
        let existing_node = other.node_id.clone();
        tracing::warn!(
            conn_id = %conn,
            client_id = %reg.client_id,
            node_id = %reg.node_id,
            existing_node_id = %existing_node,
            "conflicting registration rejected"
        );
        reject(state, conn, &reg, CONFLICT_REASON, Some(existing_node));
        state.close(conn, None);
        return RegistrationOutcome::Rejected {
            reason: CONFLICT_REASON,
        };
    }

    if let Some(&existing) = bindings.first() {
        let previous_user = state.rebind(existing, &reg);
        tracing::info!(
            conn_id = %existing,
            client_id = %reg.client_id,
            from = ?previous_user,
            to = ?reg.user_id,
            "connection re-registered"
        );
        state.send_to(existing, success(&reg));
        if existing != conn {
            state.close(conn, Some(REBOUND_REASON));
        }
        return RegistrationOutcome::Rebound {
            connection_id: existing,
            previous_user,
            user_id: reg.user_id,
        };
    }

    if !state.bind(conn, &reg, now) {
        return RegistrationOutcome::Invalid;
    }
    tracing::info!(
        conn_id = %conn,
        node_id = %reg.node_id,
        client_id = %reg.client_id,
        user_id = ?reg.user_id,
        "connection bound"
    );
    state.send_to(conn, success(&reg));
    RegistrationOutcome::Bound {
        connection_id: conn,
        user_id: reg.user_id,
    }
}

fn success(reg: &Registration) -> Message {
    Message::RegistrationSuccess {
        client_id: reg.client_id.clone(),
        user_id: reg.user_id.clone(),
    }
}

fn reject(
    state: &BrokerState,
    conn: ConnectionId,
    reg: &Registration,
    reason: &str,
    existing_node_id: Option<String>,
) {
    state.send_to(
        conn,
        Message::RegistrationRejected {
            client_id: reg.client_id.clone(),
            reason: reason.into(),
            existing_node_id,
        },
    );
}
