//! Per-connection task — framed I/O, handshake, command forwarding.
//!
//! Each accepted socket (agent TCP or local control) spawns a task that:
//! 1. Attaches an outbound queue to the broker loop.
//! 2. Reads the first frame, which must be `hello`, and forwards it.
//! 3. Selects between inbound frames (forwarded to the loop as-is) and
//!    outbound items queued by the loop (written to the socket).
//! 4. Detaches on exit so the loop can drop any binding the socket held.
//!
//! The task never touches broker state; replies come back through the
//! outbound queue like every other broker-originated message.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::ipc::codec::{CodecError, DecodeResult, FrameCodec, decode_frame};
use crate::ipc::protocol::Message;

use super::handle::{BrokerHandle, HandleError};
use super::registration::INVALID_REGISTRATION;
use super::state::ConnectionId;

/// Item queued by the broker loop for a connection's writer.
#[derive(Debug)]
pub enum Outgoing {
    Message(Message),
    /// Close the socket. With a notice, `close_notice` is written first.
    Close { notice: Option<String> },
}

/// Error reason for a known message type whose fields do not decode.
pub const MALFORMED_MESSAGE: &str = "malformed_message";

/// Sending half of a connection's outbound queue.
pub type Outbound = mpsc::UnboundedSender<Outgoing>;

/// Connection-level errors.
#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error("unexpected EOF during handshake")]
    HandshakeEof,
    #[error("first message must be hello, got {0}")]
    NotHello(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] rmp_serde::decode::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Broker(#[from] HandleError),
}

/// Spawn a connection handler task.
///
/// The task runs until the peer disconnects, the broker closes the
/// socket, or a protocol error occurs. It always detaches on exit.
pub fn spawn_connection<S>(stream: S, conn_id: ConnectionId, handle: BrokerHandle)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        if handle.attach(conn_id, outbound).is_err() {
            return;
        }
        if let Err(e) = handle_connection(stream, conn_id, &handle, outbound_rx).await {
            tracing::debug!(%conn_id, error = %e, "connection closed");
        }
        handle.detach(conn_id);
    });
}

async fn handle_connection<S>(
    stream: S,
    conn_id: ConnectionId,
    handle: &BrokerHandle,
    mut outbound_rx: mpsc::UnboundedReceiver<Outgoing>,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, FrameCodec::new());

    // -- Handshake: first message must be hello --
    let first_frame = framed
        .next()
        .await
        .ok_or(ConnectionError::HandshakeEof)??;

    match decode_frame(&first_frame) {
        DecodeResult::Ok(hello @ Message::Hello { .. }) => handle.inbound(conn_id, hello)?,
        DecodeResult::Ok(other) => {
            return Err(ConnectionError::NotHello(other.kind().to_owned()));
        }
        DecodeResult::UnknownType(envelope) | DecodeResult::Invalid(envelope) => {
            return Err(ConnectionError::NotHello(envelope.msg_type));
        }
        DecodeResult::Malformed(e) => return Err(ConnectionError::MalformedFrame(e)),
    }

    // -- Main loop: inbound frames + outbound queue --
    loop {
        tokio::select! {
            frame = framed.next() => {
                let raw = match frame {
                    Some(Ok(raw)) => raw,
                    Some(Err(e)) => return Err(ConnectionError::Codec(e)),
                    None => return Ok(()),
                };
                match decode_frame(&raw) {
                    DecodeResult::Ok(msg) => handle.inbound(conn_id, msg)?,
                    DecodeResult::UnknownType(envelope) => {
                        tracing::debug!(%conn_id, msg_type = %envelope.msg_type, "unknown message type");
                        framed
                            .send(Message::Error {
                                id: envelope.id,
                                reason: "unknown_type".into(),
                            })
                            .await?;
                    }
                    DecodeResult::Invalid(envelope) => {
                        tracing::debug!(%conn_id, msg_type = %envelope.msg_type, "invalid message fields");
                        let reason = if envelope.msg_type == "register" {
                            INVALID_REGISTRATION
                        } else {
                            MALFORMED_MESSAGE
                        };
                        framed
                            .send(Message::Error {
                                id: envelope.id,
                                reason: reason.into(),
                            })
                            .await?;
                    }
                    DecodeResult::Malformed(e) => return Err(ConnectionError::MalformedFrame(e)),
                }
            }
            item = outbound_rx.recv() => {
                match item {
                    Some(Outgoing::Message(msg)) => framed.send(msg).await?,
                    Some(Outgoing::Close { notice }) => {
                        if let Some(reason) = notice {
                            framed.send(Message::CloseNotice { reason }).await?;
                        }
                        return Ok(());
                    }
                    // The loop dropped our queue: broker shutting down.
                    None => return Ok(()),
                }
            }
        }
    }
}
