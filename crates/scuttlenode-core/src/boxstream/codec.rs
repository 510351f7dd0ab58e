//! Box stream framing

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crypto_secretbox::aead::{AeadInPlace, KeyInit};
use crypto_secretbox::{Key, Nonce, Tag, XSalsa20Poly1305};
use tokio_util::codec::{Decoder, Encoder};

use super::handshake::BoxKeys;
use crate::error::{NodeError, NodeResult};

/// Encrypted header: 16 byte MAC + 2 byte length + 16 byte body MAC.
pub const BOX_HEADER_LEN: usize = 34;

/// Largest body carried by one box.
pub const MAX_BOX_BODY: usize = 4096;

const TAG_LEN: usize = 16;
const HEADER_PLAIN_LEN: usize = 18;

/// One unit of a box stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoxFrame {
    /// Plaintext; the encoder splits it into boxes as needed
    Data(Bytes),
    /// End of stream
    Goodbye,
}

fn increment(nonce: &mut [u8; 24]) {
    for byte in nonce.iter_mut().rev() {
        let (value, overflow) = byte.overflowing_add(1);
        *byte = value;
        if !overflow {
            break;
        }
    }
}

fn next_nonce(nonce: &[u8; 24]) -> [u8; 24] {
    let mut next = *nonce;
    increment(&mut next);
    next
}

/// Writes box frames with one direction's key and nonce.
pub struct BoxEncoder {
    cipher: XSalsa20Poly1305,
    nonce: [u8; 24],
}

impl BoxEncoder {
    pub fn new(keys: BoxKeys) -> Self {
        Self {
            cipher: XSalsa20Poly1305::new(Key::from_slice(&keys.key)),
            nonce: keys.nonce,
        }
    }

    fn seal(&self, nonce: &[u8; 24], buf: &mut [u8]) -> NodeResult<Tag> {
        self.cipher
            .encrypt_in_place_detached(Nonce::from_slice(nonce), b"", buf)
            .map_err(|_| NodeError::Crypto("box encryption failed".to_string()))
    }

    fn encode_header(&mut self, plain: &mut [u8; HEADER_PLAIN_LEN], dst: &mut BytesMut) -> NodeResult<()> {
        let nonce = self.nonce;
        let tag = self.seal(&nonce, plain)?;
        dst.put_slice(&tag);
        dst.put_slice(plain);
        increment(&mut self.nonce);
        Ok(())
    }

    fn encode_chunk(&mut self, chunk: &[u8], dst: &mut BytesMut) -> NodeResult<()> {
        let mut body = chunk.to_vec();
        let body_tag = self.seal(&next_nonce(&self.nonce), &mut body)?;

        let mut header = [0u8; HEADER_PLAIN_LEN];
        header[..2].copy_from_slice(&(chunk.len() as u16).to_be_bytes());
        header[2..].copy_from_slice(&body_tag);
        dst.reserve(BOX_HEADER_LEN + body.len());
        self.encode_header(&mut header, dst)?;
        dst.put_slice(&body);
        increment(&mut self.nonce);
        Ok(())
    }
}

impl Encoder<BoxFrame> for BoxEncoder {
    type Error = NodeError;

    fn encode(&mut self, item: BoxFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            BoxFrame::Data(data) => {
                for chunk in data.chunks(MAX_BOX_BODY) {
                    self.encode_chunk(chunk, dst)?;
                }
                Ok(())
            }
            BoxFrame::Goodbye => self.encode_header(&mut [0u8; HEADER_PLAIN_LEN], dst),
        }
    }
}

/// Reads box frames with one direction's key and nonce.
pub struct BoxDecoder {
    cipher: XSalsa20Poly1305,
    nonce: [u8; 24],
    /// Length and MAC of a body whose header was already opened
    pending: Option<(usize, [u8; TAG_LEN])>,
    finished: bool,
}

impl BoxDecoder {
    pub fn new(keys: BoxKeys) -> Self {
        Self {
            cipher: XSalsa20Poly1305::new(Key::from_slice(&keys.key)),
            nonce: keys.nonce,
            pending: None,
            finished: false,
        }
    }

    fn open(&mut self, tag: &[u8], buf: &mut [u8], what: &str) -> NodeResult<()> {
        self.cipher
            .decrypt_in_place_detached(Nonce::from_slice(&self.nonce), b"", buf, Tag::from_slice(tag))
            .map_err(|_| NodeError::Protocol(format!("box {} failed to authenticate", what)))?;
        increment(&mut self.nonce);
        Ok(())
    }
}

impl Decoder for BoxDecoder {
    type Item = BoxFrame;
    type Error = NodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.finished {
            src.clear();
            return Ok(None);
        }

        let (len, body_tag) = match self.pending {
            Some(pending) => pending,
            None => {
                if src.len() < BOX_HEADER_LEN {
                    return Ok(None);
                }
                let mut header = [0u8; HEADER_PLAIN_LEN];
                header.copy_from_slice(&src[TAG_LEN..BOX_HEADER_LEN]);
                let mut tag = [0u8; TAG_LEN];
                tag.copy_from_slice(&src[..TAG_LEN]);
                src.advance(BOX_HEADER_LEN);
                self.open(&tag, &mut header, "header")?;

                if header.iter().all(|b| *b == 0) {
                    self.finished = true;
                    return Ok(Some(BoxFrame::Goodbye));
                }
                let len = u16::from_be_bytes([header[0], header[1]]) as usize;
                if len > MAX_BOX_BODY {
                    return Err(NodeError::Protocol(format!(
                        "box body of {} bytes exceeds {}",
                        len, MAX_BOX_BODY
                    )));
                }
                let mut body_tag = [0u8; TAG_LEN];
                body_tag.copy_from_slice(&header[2..]);
                self.pending = Some((len, body_tag));
                (len, body_tag)
            }
        };

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        let mut body = src.split_to(len);
        self.open(&body_tag, &mut body, "body")?;
        self.pending = None;
        Ok(Some(BoxFrame::Data(body.freeze())))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.pending.is_none() => Ok(None),
            None => Err(NodeError::Protocol("box stream truncated".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> BoxKeys {
        BoxKeys {
            key: [3; 32],
            nonce: [0xff; 24],
        }
    }

    #[test]
    fn test_nonce_increment_carries() {
        let mut nonce = [0u8; 24];
        nonce[23] = 0xff;
        increment(&mut nonce);
        assert_eq!(nonce[23], 0);
        assert_eq!(nonce[22], 1);

        let mut max = [0xff; 24];
        increment(&mut max);
        assert_eq!(max, [0; 24]);
    }

    #[test]
    fn test_chunks_and_goodbye() {
        let mut encoder = BoxEncoder::new(keys());
        let mut decoder = BoxDecoder::new(keys());
        let mut wire = BytesMut::new();
        let payload = Bytes::from((0..5000u32).map(|i| i as u8).collect::<Vec<_>>());

        encoder.encode(BoxFrame::Data(payload.clone()), &mut wire).unwrap();
        encoder.encode(BoxFrame::Goodbye, &mut wire).unwrap();
        assert_eq!(wire.len(), 2 * BOX_HEADER_LEN + 5000 + BOX_HEADER_LEN);

        let first = decoder.decode(&mut wire).unwrap().unwrap();
        let second = decoder.decode(&mut wire).unwrap().unwrap();
        match (first, second) {
            (BoxFrame::Data(a), BoxFrame::Data(b)) => {
                assert_eq!(a.len(), MAX_BOX_BODY);
                assert_eq!([a, b].concat(), payload.to_vec());
            }
            other => panic!("unexpected frames {:?}", other),
        }
        assert_eq!(decoder.decode(&mut wire).unwrap(), Some(BoxFrame::Goodbye));
        assert_eq!(decoder.decode(&mut wire).unwrap(), None);
    }

    #[test]
    fn test_partial_input_waits() {
        let mut encoder = BoxEncoder::new(keys());
        let mut decoder = BoxDecoder::new(keys());
        let mut wire = BytesMut::new();
        encoder.encode(BoxFrame::Data(Bytes::from_static(b"hello")), &mut wire).unwrap();

        let mut partial = wire.split_to(BOX_HEADER_LEN + 2);
        assert_eq!(decoder.decode(&mut partial).unwrap(), None);
        partial.unsplit(wire);
        assert_eq!(
            decoder.decode(&mut partial).unwrap(),
            Some(BoxFrame::Data(Bytes::from_static(b"hello")))
        );
    }

    #[test]
    fn test_flipped_bit_is_protocol_error() {
        let mut encoder = BoxEncoder::new(keys());
        let mut decoder = BoxDecoder::new(keys());
        let mut wire = BytesMut::new();
        encoder.encode(BoxFrame::Data(Bytes::from_static(b"hello")), &mut wire).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 1;
        assert!(matches!(decoder.decode(&mut wire), Err(NodeError::Protocol(_))));
    }

    #[test]
    fn test_truncated_eof_is_protocol_error() {
        let mut encoder = BoxEncoder::new(keys());
        let mut decoder = BoxDecoder::new(keys());
        let mut wire = BytesMut::new();
        encoder.encode(BoxFrame::Data(Bytes::from_static(b"hello")), &mut wire).unwrap();
        wire.truncate(wire.len() - 2);
        assert!(matches!(decoder.decode_eof(&mut wire), Err(NodeError::Protocol(_))));
    }
}
