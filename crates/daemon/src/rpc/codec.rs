//! Frame layout: `[u16 LE method][u32 LE payload length][payload]`.
//!
//! [`FrameCodec`] plugs the layout into `tokio_util::codec`, so reads keep
//! partial frames in the framed buffer and can be raced in `select!`.

use super::{ClientMessage, ServerMessage, TransportError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

pub const HEADER_LEN: usize = 6;

/// Largest payload accepted from a peer.
pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Build a complete frame.
pub fn encode_frame(method: u16, payload: &[u8]) -> Result<Bytes, TransportError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(TransportError::TooLarge(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u16_le(method);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Split an in-memory frame into method and payload.
pub fn split_frame(frame: &[u8]) -> Result<(u16, &[u8]), TransportError> {
    if frame.len() < HEADER_LEN {
        return Err(TransportError::Truncated);
    }
    let method = u16::from_le_bytes([frame[0], frame[1]]);
    let len = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]) as usize;
    let payload = frame
        .get(HEADER_LEN..HEADER_LEN + len)
        .ok_or(TransportError::Truncated)?;
    Ok((method, payload))
}

/// Take one complete frame off the front of `src`, if there is one.
fn take_frame(src: &mut BytesMut) -> Result<Option<(u16, Bytes)>, TransportError> {
    if src.len() < HEADER_LEN {
        src.reserve(HEADER_LEN - src.len());
        return Ok(None);
    }
    let method = u16::from_le_bytes([src[0], src[1]]);
    let len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(TransportError::TooLarge(len));
    }
    if src.len() < HEADER_LEN + len {
        src.reserve(HEADER_LEN + len - src.len());
        return Ok(None);
    }
    src.advance(HEADER_LEN);
    Ok(Some((method, src.split_to(len).freeze())))
}

/// Message type carried by one direction of the transport.
pub trait WireMessage: Sized {
    fn decode_frame(method: u16, payload: &[u8]) -> Result<Self, TransportError>;
}

impl WireMessage for ClientMessage {
    fn decode_frame(method: u16, payload: &[u8]) -> Result<Self, TransportError> {
        ClientMessage::decode(method, payload)
    }
}

impl WireMessage for ServerMessage {
    fn decode_frame(method: u16, payload: &[u8]) -> Result<Self, TransportError> {
        ServerMessage::decode(method, payload)
    }
}

/// Decodes messages of type `M` and encodes the opposite direction.
///
/// Frames with an unknown method, the wrong direction or a bad payload are
/// skipped; only a broken frame layout ends the stream.
#[derive(Debug)]
pub struct FrameCodec<M> {
    _message: PhantomData<fn() -> M>,
}

impl<M> Default for FrameCodec<M> {
    fn default() -> Self {
        Self {
            _message: PhantomData,
        }
    }
}

/// Codec for the server end of a connection.
pub type ServerCodec = FrameCodec<ClientMessage>;

/// Codec for the client end of a connection.
pub type ClientCodec = FrameCodec<ServerMessage>;

impl<M: WireMessage> Decoder for FrameCodec<M> {
    type Item = M;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<M>, TransportError> {
        while let Some((method, payload)) = take_frame(src)? {
            match M::decode_frame(method, &payload) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => warn!(method, error = %e, "skipping frame"),
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<M>, TransportError> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(TransportError::Truncated),
        }
    }
}

/// Pre-encoded frames, as produced once for a broadcast.
impl<M> Encoder<Bytes> for FrameCodec<M> {
    type Error = TransportError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), TransportError> {
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

impl Encoder<ServerMessage> for ServerCodec {
    type Error = TransportError;

    fn encode(&mut self, message: ServerMessage, dst: &mut BytesMut) -> Result<(), TransportError> {
        dst.extend_from_slice(&message.to_frame()?);
        Ok(())
    }
}

impl Encoder<ClientMessage> for ClientCodec {
    type Error = TransportError;

    fn encode(&mut self, message: ClientMessage, dst: &mut BytesMut) -> Result<(), TransportError> {
        dst.extend_from_slice(&message.to_frame()?);
        Ok(())
    }
}
