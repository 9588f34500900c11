//! Control-socket client for one-shot CLI commands.
//!
//! Connects as `Role::Control`, performs the handshake, and sends one
//! request per method call. Requests are numbered from 1; the broker
//! echoes the id in its `response`.

use std::path::{Path, PathBuf};

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use crate::ipc::codec::LengthPrefixedCodec;
use crate::ipc::protocol::{ConnectionDescriptor, Message, PROTOCOL_VERSION, Role, Status};

use super::ClientError;

/// Counts reported by a logout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogoutCounts {
    pub delivered: u32,
    pub missing: u32,
}

pub struct BrokerClient {
    framed: Framed<UnixStream, LengthPrefixedCodec>,
    next_id: u32,
}

impl BrokerClient {
    /// Connect to the control socket and perform the handshake.
    pub async fn connect(socket_path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|e| ClientError::Broker(format!("connect {}: {e}", socket_path.display())))?;
        let mut framed = Framed::new(stream, LengthPrefixedCodec::new());

        framed
            .send(Message::Hello {
                version: PROTOCOL_VERSION,
                role: Role::Control,
            })
            .await
            .map_err(|e| ClientError::Broker(format!("send hello: {e}")))?;

        match framed.next().await {
            Some(Ok(Message::HelloAck {
                status: Status::Ok, ..
            })) => {}
            Some(Ok(Message::HelloAck {
                status: Status::Error,
                error,
            })) => {
                return Err(ClientError::Broker(format!(
                    "handshake rejected: {}",
                    error.unwrap_or_default()
                )));
            }
            other => {
                return Err(ClientError::Broker(format!(
                    "unexpected handshake response: {other:?}"
                )));
            }
        }

        Ok(Self { framed, next_id: 1 })
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Send one request and wait for its `response`.
    async fn request(&mut self, op: &str, message: Message) -> Result<Message, ClientError> {
        self.framed
            .send(message)
            .await
            .map_err(|e| ClientError::Broker(format!("send {op}: {e}")))?;

        match self.framed.next().await {
            Some(Ok(
                response @ Message::Response {
                    status: Status::Ok, ..
                },
            )) => Ok(response),
            Some(Ok(Message::Response { error, .. })) => Err(ClientError::Broker(format!(
                "{op} failed: {}",
                error.unwrap_or_default()
            ))),
            Some(Ok(Message::Error { reason, .. })) => {
                Err(ClientError::Broker(format!("{op} failed: {reason}")))
            }
            other => Err(ClientError::Broker(format!(
                "unexpected {op} response: {other:?}"
            ))),
        }
    }

    pub async fn list_connections(
        &mut self,
        user_id: Option<String>,
    ) -> Result<Vec<ConnectionDescriptor>, ClientError> {
        let id = self.next_id();
        match self
            .request("list_connections", Message::ListConnections { id, user_id })
            .await?
        {
            Message::Response { connections, .. } => Ok(connections.unwrap_or_default()),
            _ => Ok(Vec::new()),
        }
    }

    /// Ask the broker to relay the user's session now. Returns the
    /// outcome name (`delivered`, `not_delivered`, ...).
    pub async fn relay_now(&mut self, user_id: &str) -> Result<String, ClientError> {
        let id = self.next_id();
        match self
            .request(
                "relay_now",
                Message::RelayNow {
                    id,
                    user_id: user_id.to_owned(),
                },
            )
            .await?
        {
            Message::Response {
                outcome: Some(outcome),
                ..
            } => Ok(outcome),
            other => Err(ClientError::Broker(format!(
                "relay_now response without outcome: {other:?}"
            ))),
        }
    }

    pub async fn logout_user(&mut self, user_id: &str) -> Result<LogoutCounts, ClientError> {
        let id = self.next_id();
        match self
            .request(
                "logout_user",
                Message::LogoutUser {
                    id,
                    user_id: user_id.to_owned(),
                },
            )
            .await?
        {
            Message::Response {
                delivered, missing, ..
            } => Ok(LogoutCounts {
                delivered: delivered.unwrap_or(0),
                missing: missing.unwrap_or(0),
            }),
            _ => Ok(LogoutCounts {
                delivered: 0,
                missing: 0,
            }),
        }
    }

    pub async fn store_session(
        &mut self,
        user_id: &str,
        username: &str,
        session_payload: Vec<u8>,
    ) -> Result<(), ClientError> {
        let id = self.next_id();
        self.request(
            "store_session",
            Message::StoreSession {
                id,
                user_id: user_id.to_owned(),
                username: username.to_owned(),
                session_payload,
            },
        )
        .await?;
        Ok(())
    }
}

/// Resolve the control socket path from `$XDG_RUNTIME_DIR`.
pub fn resolve_socket_path() -> Result<PathBuf, ClientError> {
    crate::broker::resolve_socket_path()
        .map_err(|_| ClientError::Broker("$XDG_RUNTIME_DIR not set".into()))
}
