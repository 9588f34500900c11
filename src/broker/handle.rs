//! Cloneable handle onto the broker loop.
//!
//! The loop is the only owner of the connection registry. Connection
//! tasks, the session relay, the logout coordinator and control requests
//! all reach it by submitting a [`BrokerCommand`]; the ones that need an
//! answer carry a oneshot reply channel.

use tokio::sync::{mpsc, oneshot};

use crate::ipc::protocol::{ConnectionDescriptor, HierarchyAssignment, Message};

use super::ack::PendingAck;
use super::connection::Outbound;
use super::state::ConnectionId;

/// Work item for the broker loop.
#[derive(Debug)]
pub enum BrokerCommand {
    Attach {
        connection_id: ConnectionId,
        outbound: Outbound,
    },
    Inbound {
        connection_id: ConnectionId,
        message: Message,
    },
    Detach {
        connection_id: ConnectionId,
    },
    ConnectionsFor {
        user_id: String,
        reply: oneshot::Sender<Vec<ConnectionId>>,
    },
    DispatchRelay {
        user_id: String,
        session_payload: Vec<u8>,
        reply: oneshot::Sender<Vec<PendingAck>>,
    },
    DispatchLogout {
        user_id: String,
        reply: oneshot::Sender<Vec<PendingAck>>,
    },
    Evict {
        connection_ids: Vec<ConnectionId>,
        reason: String,
        reply: oneshot::Sender<usize>,
    },
    ApplyHierarchy {
        connection_id: ConnectionId,
        assignment: HierarchyAssignment,
        reply: oneshot::Sender<bool>,
    },
    ListConnections {
        user_id: Option<String>,
        reply: oneshot::Sender<Vec<ConnectionDescriptor>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    #[error("broker loop closed")]
    BrokerGone,
    #[error("broker dropped the reply")]
    ReplyDropped,
}

#[derive(Debug, Clone)]
pub struct BrokerHandle {
    tx: mpsc::UnboundedSender<BrokerCommand>,
}

impl BrokerHandle {
    pub fn new(tx: mpsc::UnboundedSender<BrokerCommand>) -> Self {
        Self { tx }
    }

    fn submit(&self, command: BrokerCommand) -> Result<(), HandleError> {
        self.tx.send(command).map_err(|_| HandleError::BrokerGone)
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> BrokerCommand,
    ) -> Result<T, HandleError> {
        let (reply, rx) = oneshot::channel();
        self.submit(command(reply))?;
        rx.await.map_err(|_| HandleError::ReplyDropped)
    }

    pub fn attach(&self, connection_id: ConnectionId, outbound: Outbound) -> Result<(), HandleError> {
        self.submit(BrokerCommand::Attach {
            connection_id,
            outbound,
        })
    }

    pub fn inbound(&self, connection_id: ConnectionId, message: Message) -> Result<(), HandleError> {
        self.submit(BrokerCommand::Inbound {
            connection_id,
            message,
        })
    }

    /// Fire-and-forget: a gone loop has nothing left to clean up.
    pub fn detach(&self, connection_id: ConnectionId) {
        let _ = self.submit(BrokerCommand::Detach { connection_id });
    }

    /// Valid connections currently bound to `user_id`.
    pub async fn connections_for(&self, user_id: &str) -> Result<Vec<ConnectionId>, HandleError> {
        self.call(|reply| BrokerCommand::ConnectionsFor {
            user_id: user_id.to_owned(),
            reply,
        })
        .await
    }

    /// Send `relay_session` to every valid connection of `user_id` and
    /// return one ack waiter per connection reached.
    pub async fn dispatch_relay(
        &self,
        user_id: &str,
        session_payload: Vec<u8>,
    ) -> Result<Vec<PendingAck>, HandleError> {
        self.call(|reply| BrokerCommand::DispatchRelay {
            user_id: user_id.to_owned(),
            session_payload,
            reply,
        })
        .await
    }

    /// Send `logout` to every valid connection of `user_id`, marking each
    /// closed-by-logout, and return one ack waiter per connection reached.
    pub async fn dispatch_logout(&self, user_id: &str) -> Result<Vec<PendingAck>, HandleError> {
        self.call(|reply| BrokerCommand::DispatchLogout {
            user_id: user_id.to_owned(),
            reply,
        })
        .await
    }

    /// Remove connections from the registry and close their sockets.
    /// Returns how many were still present.
    pub async fn evict(
        &self,
        connection_ids: Vec<ConnectionId>,
        reason: &str,
    ) -> Result<usize, HandleError> {
        self.call(|reply| BrokerCommand::Evict {
            connection_ids,
            reason: reason.to_owned(),
            reply,
        })
        .await
    }

    pub async fn apply_hierarchy(
        &self,
        connection_id: ConnectionId,
        assignment: HierarchyAssignment,
    ) -> Result<bool, HandleError> {
        self.call(|reply| BrokerCommand::ApplyHierarchy {
            connection_id,
            assignment,
            reply,
        })
        .await
    }

    pub async fn list_connections(
        &self,
        user_id: Option<String>,
    ) -> Result<Vec<ConnectionDescriptor>, HandleError> {
        self.call(|reply| BrokerCommand::ListConnections { user_id, reply })
            .await
    }
}
