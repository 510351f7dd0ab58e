//! RPC packet framing
//!
//! ```text
//! byte 0     flags: 0x08 stream, 0x04 end/error, 0x03 body type
//! bytes 1-4  body length (u32, big endian)
//! bytes 5-8  request number (i32, big endian)
//! ```
//!
//! Nine zero bytes end the whole connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::NodeError;

pub const HEADER_LEN: usize = 9;

/// Upper bound for one packet body.
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

const FLAG_STREAM: u8 = 0b1000;
const FLAG_END_OR_ERROR: u8 = 0b0100;
const BODY_TYPE_MASK: u8 = 0b0011;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyType {
    Binary = 0,
    Utf8 = 1,
    Json = 2,
}

impl BodyType {
    fn from_flags(flags: u8) -> Result<Self, NodeError> {
        match flags & BODY_TYPE_MASK {
            0 => Ok(BodyType::Binary),
            1 => Ok(BodyType::Utf8),
            2 => Ok(BodyType::Json),
            other => Err(NodeError::Protocol(format!("unknown body type {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub stream: bool,
    pub end_or_error: bool,
    pub body_type: BodyType,
    pub request: i32,
    pub body: Bytes,
}

impl Packet {
    fn flags(&self) -> u8 {
        let mut flags = self.body_type as u8;
        if self.stream {
            flags |= FLAG_STREAM;
        }
        if self.end_or_error {
            flags |= FLAG_END_OR_ERROR;
        }
        flags
    }
}

/// Decoded unit of the RPC layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcFrame {
    Packet(Packet),
    Goodbye,
}

#[derive(Debug, Default)]
pub struct RpcCodec;

impl Decoder for RpcCodec {
    type Item = RpcFrame;
    type Error = NodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        if src[..HEADER_LEN].iter().all(|b| *b == 0) {
            src.advance(HEADER_LEN);
            return Ok(Some(RpcFrame::Goodbye));
        }

        let flags = src[0];
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > MAX_BODY_LEN {
            return Err(NodeError::Protocol(format!(
                "packet body of {} bytes exceeds {}",
                len, MAX_BODY_LEN
            )));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let body_type = BodyType::from_flags(flags)?;
        let request = i32::from_be_bytes([src[5], src[6], src[7], src[8]]);
        src.advance(HEADER_LEN);
        let body = src.split_to(len).freeze();
        Ok(Some(RpcFrame::Packet(Packet {
            stream: flags & FLAG_STREAM != 0,
            end_or_error: flags & FLAG_END_OR_ERROR != 0,
            body_type,
            request,
            body,
        })))
    }
}

impl Encoder<RpcFrame> for RpcCodec {
    type Error = NodeError;

    fn encode(&mut self, item: RpcFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RpcFrame::Goodbye => dst.put_bytes(0, HEADER_LEN),
            RpcFrame::Packet(packet) => {
                if packet.body.len() > MAX_BODY_LEN {
                    return Err(NodeError::Protocol(format!(
                        "refusing to send {} byte body",
                        packet.body.len()
                    )));
                }
                dst.reserve(HEADER_LEN + packet.body.len());
                dst.put_u8(packet.flags());
                dst.put_u32(packet.body.len() as u32);
                dst.put_i32(packet.request);
                dst.put_slice(&packet.body);
            }
        }
        Ok(())
    }
}
