//! Inbound message dispatch.
//!
//! Runs on the broker loop. Each handler mutates [`BrokerState`] and
//! queues replies directly on the sockets concerned. Work that has to
//! wait on something outside the loop (session relay, logout, the
//! session store) is returned as a [`Followup`] for the loop to spawn.

use std::time::Instant;

use crate::ipc::protocol::{Message, PROTOCOL_VERSION, Role, Status};

use super::connection::Outbound;
use super::registration::{self, RegistrationOutcome};
use super::registry::Ack;
use super::state::{BrokerState, ConnectionId};

/// A control request that needs the session service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    RelayNow {
        user_id: String,
    },
    Logout {
        user_id: String,
    },
    StoreSession {
        user_id: String,
        username: String,
        session_payload: Vec<u8>,
    },
}

/// Asynchronous work triggered by an inbound message.
#[derive(Debug)]
pub enum Followup {
    /// Push the user's cached session to their connections.
    AutoRelay { user_id: String },
    /// Ask the hierarchy collaborator to place a freshly bound node.
    AssignHierarchy {
        connection_id: ConnectionId,
        node_id: String,
        client_id: String,
    },
    /// Run a control request and answer on `reply_to`.
    Control {
        reply_to: Outbound,
        id: u32,
        request: ControlRequest,
    },
}

/// Dispatch one inbound message from socket `conn`.
///
/// Enforces:
/// - `hello` exactly once, with a matching protocol version
/// - agent-only and control-only messages per role (`unexpected_message`)
/// - broker-originated variants → `unknown_type`
pub fn handle_message(
    state: &mut BrokerState,
    conn: ConnectionId,
    message: Message,
    now: Instant,
) -> Vec<Followup> {
    state.touch(conn, now);

    if let Message::Hello { version, role } = message {
        handle_hello(state, conn, version, role);
        return Vec::new();
    }

    match (state.role(conn), message) {
        // Server-originated messages should never be sent by peers.
        (
            _,
            Message::HelloAck { .. }
            | Message::RegistrationSuccess { .. }
            | Message::RegistrationRejected { .. }
            | Message::RelaySession { .. }
            | Message::Logout { .. }
            | Message::CloseNotice { .. }
            | Message::Error { .. },
        ) => {
            error(state, conn, None, "unknown_type");
            Vec::new()
        }
        (_, Message::Response { id, .. }) => {
            error(state, conn, Some(id), "unknown_type");
            Vec::new()
        }

        // -- Agent --
        (Some(Role::Agent), Message::Register(reg)) => {
            let node_id = reg.node_id.clone();
            let client_id = reg.client_id.clone();
            match registration::register(state, conn, reg, now) {
                RegistrationOutcome::Bound {
                    connection_id,
                    user_id,
                } => {
                    let mut followups = vec![Followup::AssignHierarchy {
                        connection_id,
                        node_id,
                        client_id,
                    }];
                    if let Some(user_id) = user_id {
                        followups.push(Followup::AutoRelay { user_id });
                    }
                    followups
                }
                RegistrationOutcome::Rebound {
                    user_id: Some(user_id),
                    ..
                } => vec![Followup::AutoRelay { user_id }],
                _ => Vec::new(),
            }
        }
        (Some(_), Message::Heartbeat) => Vec::new(),
        (Some(Role::Agent), Message::RelayAck { success, message }) => {
            if !state.resolve_relay_ack(conn, Ack { success, message }) {
                tracing::debug!(conn_id = %conn, "relay ack with no waiter, ignored");
            }
            Vec::new()
        }
        (Some(Role::Agent), Message::LogoutAck { success, message }) => {
            if !state.resolve_logout_ack(conn, Ack { success, message }) {
                tracing::debug!(conn_id = %conn, "logout ack with no waiter, ignored");
            }
            Vec::new()
        }
        (Some(Role::Agent), Message::HierarchyAssigned(assignment)) => {
            if !state.apply_hierarchy(conn, &assignment, false) {
                tracing::debug!(
                    conn_id = %conn,
                    node_id = %assignment.node_id,
                    "hierarchy confirmation does not match binding, ignored"
                );
            }
            Vec::new()
        }

        // -- Control --
        (Some(Role::Control), Message::ListConnections { id, user_id }) => {
            let connections = state.describe(user_id.as_deref());
            state.send_to(
                conn,
                Message::Response {
                    id,
                    status: Status::Ok,
                    error: None,
                    connections: Some(connections),
                    outcome: None,
                    delivered: None,
                    missing: None,
                },
            );
            Vec::new()
        }
        (Some(Role::Control), Message::RelayNow { id, user_id }) => {
            control(state, conn, id, ControlRequest::RelayNow { user_id })
        }
        (Some(Role::Control), Message::LogoutUser { id, user_id }) => {
            control(state, conn, id, ControlRequest::Logout { user_id })
        }
        (
            Some(Role::Control),
            Message::StoreSession {
                id,
                user_id,
                username,
                session_payload,
            },
        ) => control(
            state,
            conn,
            id,
            ControlRequest::StoreSession {
                user_id,
                username,
                session_payload,
            },
        ),

        // Valid message, wrong role (or no hello yet).
        (
            _,
            Message::ListConnections { id, .. }
            | Message::RelayNow { id, .. }
            | Message::LogoutUser { id, .. }
            | Message::StoreSession { id, .. },
        ) => {
            error(state, conn, Some(id), "unexpected_message");
            Vec::new()
        }
        (_, other) => {
            tracing::debug!(conn_id = %conn, msg_type = other.kind(), "unexpected message for role");
            error(state, conn, None, "unexpected_message");
            Vec::new()
        }
    }
}

fn handle_hello(state: &mut BrokerState, conn: ConnectionId, version: u32, role: Role) {
    if state.role(conn).is_some() {
        error(state, conn, None, "unexpected_message");
        return;
    }
    if version != PROTOCOL_VERSION {
        state.send_to(
            conn,
            Message::HelloAck {
                status: Status::Error,
                error: Some("version_mismatch".into()),
            },
        );
        state.close(conn, None);
        return;
    }
    state.set_role(conn, role);
    tracing::debug!(conn_id = %conn, ?role, "handshake complete");
    state.send_to(
        conn,
        Message::HelloAck {
            status: Status::Ok,
            error: None,
        },
    );
}

fn control(
    state: &BrokerState,
    conn: ConnectionId,
    id: u32,
    request: ControlRequest,
) -> Vec<Followup> {
    match state.outbound(conn) {
        Some(reply_to) => vec![Followup::Control {
            reply_to,
            id,
            request,
        }],
        None => Vec::new(),
    }
}

fn error(state: &BrokerState, conn: ConnectionId, id: Option<u32>, reason: &str) {
    state.send_to(
        conn,
        Message::Error {
            id,
            reason: reason.into(),
        },
    );
}
