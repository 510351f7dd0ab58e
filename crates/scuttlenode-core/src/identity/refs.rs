//! Typed textual handles for identities, feeds, messages and blobs
//!
//! | kind     | format                  |
//! |----------|-------------------------|
//! | identity | `@<base64>.ed25519`     |
//! | feed     | `@<base64>.ed25519`     |
//! | message  | `%<base64>.sha256`      |
//! | blob     | `&<base64>.sha256`      |
//!
//! `FeedRef` and `IdentityRef` share key bytes but are different types: an
//! identity signs, a feed is the log named after it.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::NodeError;

const ED25519_SUFFIX: &str = ".ed25519";
const SHA256_SUFFIX: &str = ".sha256";

fn decode_32(body: &str, what: &str) -> Result<[u8; 32], NodeError> {
    let bytes = STANDARD
        .decode(body)
        .map_err(|e| NodeError::Validation(format!("invalid base64 in {}: {}", what, e)))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        NodeError::Validation(format!("{} must be 32 bytes, got {}", what, b.len()))
    })
}

fn parse_sigil<'a>(s: &'a str, sigil: char, suffix: &str, what: &str) -> Result<&'a str, NodeError> {
    s.strip_prefix(sigil)
        .and_then(|rest| rest.strip_suffix(suffix))
        .ok_or_else(|| {
            NodeError::Validation(format!(
                "{} must look like {}<base64>{}, got {:?}",
                what, sigil, suffix, s
            ))
        })
}

/// Public half of an ed25519 identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityRef([u8; 32]);

impl IdentityRef {
    /// Build from raw key bytes, checking they form a valid ed25519 point.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, NodeError> {
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| NodeError::Validation(format!("invalid ed25519 public key: {}", e)))?;
        Ok(Self(bytes))
    }

    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self(key.to_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, NodeError> {
        VerifyingKey::from_bytes(&self.0)
            .map_err(|e| NodeError::Crypto(format!("invalid ed25519 public key: {}", e)))
    }

    /// The main feed named after this identity.
    pub fn main_feed(&self) -> FeedRef {
        FeedRef(*self)
    }
}

impl fmt::Display for IdentityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}{}", STANDARD.encode(self.0), ED25519_SUFFIX)
    }
}

impl fmt::Debug for IdentityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityRef({})", self)
    }
}

impl FromStr for IdentityRef {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = parse_sigil(s, '@', ED25519_SUFFIX, "identity ref")?;
        Self::from_bytes(decode_32(body, "identity ref")?)
    }
}

/// A feed, named by the identity that signs it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedRef(IdentityRef);

impl FeedRef {
    pub fn identity(&self) -> IdentityRef {
        self.0
    }

    /// Opaque hash of this feed used as the ban-list key.
    pub fn ban_hash(&self) -> BanHash {
        let digest = Sha256::digest(self.to_string().as_bytes());
        BanHash(digest.into())
    }
}

impl From<IdentityRef> for FeedRef {
    fn from(id: IdentityRef) -> Self {
        FeedRef(id)
    }
}

impl fmt::Display for FeedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for FeedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeedRef({})", self.0)
    }
}

impl FromStr for FeedRef {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = parse_sigil(s, '@', ED25519_SUFFIX, "feed ref")?;
        Ok(FeedRef(IdentityRef::from_bytes(decode_32(body, "feed ref")?)?))
    }
}

/// Hash of a message's canonical bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageRef([u8; 32]);

impl MessageRef {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}{}", STANDARD.encode(self.0), SHA256_SUFFIX)
    }
}

impl fmt::Debug for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageRef({})", self)
    }
}

impl FromStr for MessageRef {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = parse_sigil(s, '%', SHA256_SUFFIX, "message ref")?;
        Ok(MessageRef(decode_32(body, "message ref")?))
    }
}

/// Hash of a blob's bytes. Blobs themselves are not stored by the core.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobRef([u8; 32]);

impl BlobRef {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "&{}{}", STANDARD.encode(self.0), SHA256_SUFFIX)
    }
}

impl fmt::Debug for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobRef({})", self)
    }
}

impl FromStr for BlobRef {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = parse_sigil(s, '&', SHA256_SUFFIX, "blob ref")?;
        Ok(BlobRef(decode_32(body, "blob ref")?))
    }
}

/// 32-byte ban-list key derived from a feed ref.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BanHash([u8; 32]);

impl BanHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, NodeError> {
        let bytes = hex::decode(s)
            .map_err(|e| NodeError::Validation(format!("invalid ban hash hex: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| NodeError::Validation("ban hash must be 32 bytes".to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for BanHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BanHash({})", self.to_hex())
    }
}

macro_rules! string_serde {
    ($($ty:ty),*) => {$(
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    )*};
}

string_serde!(IdentityRef, FeedRef, MessageRef, BlobRef);
