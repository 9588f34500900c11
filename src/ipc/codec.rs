//! Length-prefixed MessagePack codecs for tokio I/O.
//!
//! Framing: `[4 bytes: payload length, big-endian u32][N bytes: MessagePack payload]`.
//! The same framing is used on the agent TCP listener and on the local
//! control socket.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{MAX_PAYLOAD_SIZE, MESSAGE_TYPES, Message, RawEnvelope};

/// Codec error type.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("payload too large: {0} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge(usize),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("MessagePack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("MessagePack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Split one complete frame off `src`, if one is buffered.
///
/// `pending_len` remembers a consumed header across calls so a frame
/// may arrive in arbitrarily small pieces.
fn split_frame(
    pending_len: &mut Option<usize>,
    src: &mut BytesMut,
) -> Result<Option<BytesMut>, CodecError> {
    let payload_len = match *pending_len {
        Some(len) => len,
        None => {
            if src.len() < 4 {
                return Ok(None);
            }
            let len = src.get_u32() as usize;
            if len > MAX_PAYLOAD_SIZE {
                return Err(CodecError::PayloadTooLarge(len));
            }
            *pending_len = Some(len);
            len
        }
    };

    if src.len() < payload_len {
        src.reserve(payload_len - src.len());
        return Ok(None);
    }

    *pending_len = None;
    Ok(Some(src.split_to(payload_len)))
}

/// Serialize `item` as a named MessagePack map and append it as one frame.
fn put_frame(item: &Message, dst: &mut BytesMut) -> Result<(), CodecError> {
    let payload = rmp_serde::to_vec_named(item)?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }
    dst.reserve(4 + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.extend_from_slice(&payload);
    Ok(())
}

/// Typed codec: frames in, [`Message`] values out.
///
/// Used by the peers of the broker (the control client and tests that
/// play the agent role). The broker itself reads with [`FrameCodec`] so
/// it can answer unknown message types instead of dropping the socket.
#[derive(Debug, Default)]
pub struct LengthPrefixedCodec {
    pending_len: Option<usize>,
}

impl LengthPrefixedCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LengthPrefixedCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match split_frame(&mut self.pending_len, src)? {
            Some(payload) => Ok(Some(rmp_serde::from_slice(&payload)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for LengthPrefixedCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        put_frame(&item, dst)
    }
}

/// Frame-level codec: yields raw payloads and leaves decoding to
/// [`decode_frame`].
#[derive(Debug, Default)]
pub struct FrameCodec {
    pending_len: Option<usize>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        split_frame(&mut self.pending_len, src)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        put_frame(&item, dst)
    }
}

/// Result of attempting to decode a raw frame into a protocol message.
#[derive(Debug)]
pub enum DecodeResult {
    /// A known message variant.
    Ok(Message),
    /// Valid map with an unrecognized `type`.
    UnknownType(RawEnvelope),
    /// Known `type` whose fields do not fit it.
    Invalid(RawEnvelope),
    /// Not even a `{type}` map.
    Malformed(rmp_serde::decode::Error),
}

/// Two-phase decode: try [`Message`], then fall back to [`RawEnvelope`].
pub fn decode_frame(payload: &[u8]) -> DecodeResult {
    match rmp_serde::from_slice::<Message>(payload) {
        Ok(msg) => DecodeResult::Ok(msg),
        Err(_) => match rmp_serde::from_slice::<RawEnvelope>(payload) {
            Ok(envelope) if MESSAGE_TYPES.contains(&envelope.msg_type.as_str()) => {
                DecodeResult::Invalid(envelope)
            }
            Ok(envelope) => DecodeResult::UnknownType(envelope),
            Err(e) => DecodeResult::Malformed(e),
        },
    }
}
