//! Boxed stream: secret handshake plus encrypted framing
//!
//! A connection starts with the four-message secret handshake, which proves
//! both long-term identities and derives one key/nonce pair per direction.
//! Afterwards every write is split into boxes of at most 4096 bytes:
//!
//! ```text
//! ┌───────────────────────────────┬──────────────────────┐
//! │ header box (34 bytes)         │ body box (len bytes)  │
//! │ secretbox(len ‖ body_mac, n)  │ secretbox(body, n+1)  │
//! └───────────────────────────────┴──────────────────────┘
//! ```
//!
//! A header box holding 18 zero bytes ends the stream.

mod codec;
mod handshake;

pub use codec::{BoxDecoder, BoxEncoder, BoxFrame, BOX_HEADER_LEN, MAX_BOX_BODY};
pub use handshake::{client_handshake, server_handshake, BoxKeys, HandshakeOutcome};

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::{NodeError, NodeResult};

/// 32-byte key that keeps separate networks from talking to each other.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkKey([u8; 32]);

impl NetworkKey {
    /// The main network.
    pub const MAIN: NetworkKey = NetworkKey([
        0xd4, 0xa1, 0xcb, 0x88, 0xa6, 0x6f, 0x02, 0xf8, 0xdb, 0x63, 0x5c, 0xe2, 0x64, 0x41, 0xcc,
        0x5d, 0xac, 0x1b, 0x08, 0x42, 0x0c, 0xea, 0xac, 0x23, 0x08, 0x39, 0xb7, 0x55, 0x84, 0x5a,
        0x9f, 0xfb,
    ]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> NodeResult<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| NodeError::Validation(format!("network key is not hex: {}", e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            NodeError::Validation(format!("network key must be 32 bytes, got {}", b.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl Default for NetworkKey {
    fn default() -> Self {
        Self::MAIN
    }
}

impl fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkKey({})", self.to_hex())
    }
}

pub type BoxReader<S> = FramedRead<ReadHalf<S>, BoxDecoder>;
pub type BoxWriter<S> = FramedWrite<WriteHalf<S>, BoxEncoder>;

/// Wrap a handshaken transport in box framing.
pub fn box_stream<S>(stream: S, outcome: &HandshakeOutcome) -> (BoxReader<S>, BoxWriter<S>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read, write) = tokio::io::split(stream);
    (
        FramedRead::new(read, BoxDecoder::new(outcome.decrypt.clone())),
        FramedWrite::new(write, BoxEncoder::new(outcome.encrypt.clone())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};

    #[test]
    fn test_network_key_hex() {
        let hex = NetworkKey::MAIN.to_hex();
        assert_eq!(hex, "d4a1cb88a66f02f8db635ce26441cc5dac1b08420ceaac230839b755845a9ffb");
        assert_eq!(NetworkKey::from_hex(&hex).unwrap(), NetworkKey::MAIN);
        assert!(NetworkKey::from_hex("00").is_err());
    }

    #[tokio::test]
    async fn test_handshake_then_boxed_exchange() {
        let client_id = Identity::generate();
        let server_id = Identity::generate();
        let server_pub = server_id.public();
        let (mut client_io, mut server_io) = tokio::io::duplex(64 * 1024);
        let key = NetworkKey::MAIN;

        let server = tokio::spawn(async move {
            let outcome = server_handshake(&mut server_io, &key, &server_id).await.unwrap();
            (outcome, server_io)
        });
        let client_outcome = client_handshake(&mut client_io, &key, &client_id, &server_pub)
            .await
            .unwrap();
        let (server_outcome, server_io) = server.await.unwrap();

        assert_eq!(client_outcome.remote, server_pub);
        assert_eq!(server_outcome.remote, client_id.public());

        let (_client_rx, mut client_tx) = box_stream(client_io, &client_outcome);
        let (mut server_rx, _server_tx) = box_stream(server_io, &server_outcome);

        let big = Bytes::from(vec![7u8; 10_000]);
        client_tx.send(BoxFrame::Data(big.clone())).await.unwrap();
        client_tx.send(BoxFrame::Goodbye).await.unwrap();

        let mut received = Vec::new();
        while let Some(frame) = server_rx.next().await {
            match frame.unwrap() {
                BoxFrame::Data(chunk) => {
                    assert!(chunk.len() <= MAX_BOX_BODY);
                    received.extend_from_slice(&chunk);
                }
                BoxFrame::Goodbye => break,
            }
        }
        assert_eq!(received, big.to_vec());
    }
}
