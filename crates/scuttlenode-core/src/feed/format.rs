//! Feed formats: turning raw bytes into verified messages and back
//!
//! Only the classic JSON format is implemented. [`Formats`] tries each
//! registered format in turn so others can be added without touching
//! callers.
//!
//! ## Classic canonical form
//!
//! ```text
//! {
//!   "previous": "%...sha256" | null,
//!   "author": "@...ed25519",
//!   "sequence": 2,
//!   "timestamp": 1449201682755,
//!   "hash": "sha256",
//!   "content": { ... },
//!   "signature": "...sig.ed25519"
//! }
//! ```
//!
//! Two-space indentation, keys in this order. The signature covers the same
//! text without the `signature` field.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::Signature;
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

use super::message::{Content, Message, UnsignedMessage};
use crate::error::{NodeError, NodeResult};
use crate::identity::{verify_signature, Identity, IdentityRef, MessageRef};

/// Largest raw message reference peers accept.
pub const MAX_MESSAGE_SIZE: usize = 8192;

const SIGNATURE_SUFFIX: &str = ".sig.ed25519";

/// A way of encoding, signing and verifying messages.
pub trait FeedFormat: Send + Sync {
    /// Identifier used in `ebt.replicate` arguments.
    fn name(&self) -> &'static str;

    /// Parse canonical bytes and check the signature under the declared author.
    fn verify(&self, raw: &[u8]) -> NodeResult<Message>;

    /// Parse bytes read back from local storage; the signature is not rechecked.
    fn load(&self, raw: &[u8]) -> NodeResult<Message>;

    /// Produce canonical bytes for `unsigned` and sign them.
    fn sign(&self, unsigned: &UnsignedMessage, identity: &Identity) -> NodeResult<Message>;
}

/// The classic (`ed25519` + JSON) feed format.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClassicFormat;

impl ClassicFormat {
    fn parse(&self, raw: &[u8], check_signature: bool) -> NodeResult<Message> {
        if raw.len() > MAX_MESSAGE_SIZE {
            return Err(NodeError::Validation(format!(
                "message is {} bytes, limit is {}",
                raw.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| NodeError::Validation(format!("message is not JSON: {}", e)))?;
        let Value::Object(mut map) = value else {
            return Err(NodeError::Validation("message must be a JSON object".to_string()));
        };
        check_key_order(&map)?;

        // Reference peers send compact JSON bodies; the id and signature are
        // always over the indented form.
        let canonical = serde_json::to_string_pretty(&map)?;

        let signature_text = map
            .remove("signature")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| NodeError::Validation("signature must be a string".to_string()))?;

        let author: IdentityRef = field_str(&map, "author")?.parse()?;
        let previous = match map.get("previous") {
            Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.parse::<MessageRef>()?),
            _ => return Err(NodeError::Validation("previous must be null or a message ref".to_string())),
        };
        let sequence = map
            .get("sequence")
            .and_then(Value::as_u64)
            .filter(|s| *s >= 1)
            .ok_or_else(|| NodeError::Validation("sequence must be a positive integer".to_string()))?;
        let timestamp = map
            .get("timestamp")
            .and_then(Value::as_f64)
            .ok_or_else(|| NodeError::Validation("timestamp must be a number".to_string()))?;
        if field_str(&map, "hash")? != "sha256" {
            return Err(NodeError::Validation("hash must be \"sha256\"".to_string()));
        }
        let content = match map.get("content") {
            Some(v @ Value::Object(_)) => Content::from_value(v),
            Some(Value::String(s)) => Content::Unknown(s.as_bytes().to_vec()),
            _ => return Err(NodeError::Validation("content must be an object or string".to_string())),
        };

        if sequence == 1 && previous.is_some() {
            return Err(NodeError::Validation("first message must not have previous".to_string()));
        }
        if sequence > 1 && previous.is_none() {
            return Err(NodeError::Validation(format!(
                "message {} is missing previous",
                sequence
            )));
        }

        if check_signature {
            let signature = decode_signature(&signature_text)?;
            let signed = serde_json::to_string_pretty(&map)?;
            if !verify_signature(&author, signed.as_bytes(), &signature) {
                return Err(NodeError::Validation(format!(
                    "invalid signature on message {} by {}",
                    sequence, author
                )));
            }
        }

        Ok(Message {
            id: message_id(&canonical),
            previous,
            sequence,
            author,
            feed: author.main_feed(),
            timestamp,
            content,
            raw: canonical.into_bytes(),
        })
    }
}

impl FeedFormat for ClassicFormat {
    fn name(&self) -> &'static str {
        "classic"
    }

    fn verify(&self, raw: &[u8]) -> NodeResult<Message> {
        self.parse(raw, true)
    }

    fn load(&self, raw: &[u8]) -> NodeResult<Message> {
        self.parse(raw, false)
    }

    fn sign(&self, unsigned: &UnsignedMessage, identity: &Identity) -> NodeResult<Message> {
        if unsigned.author != identity.public() {
            return Err(NodeError::Crypto(format!(
                "cannot sign as {} with key of {}",
                unsigned.author,
                identity.public()
            )));
        }

        let mut map = Map::new();
        map.insert(
            "previous".into(),
            unsigned
                .previous
                .map(|p| Value::from(p.to_string()))
                .unwrap_or(Value::Null),
        );
        map.insert("author".into(), Value::from(unsigned.author.to_string()));
        map.insert("sequence".into(), Value::from(unsigned.sequence));
        map.insert("timestamp".into(), timestamp_value(unsigned.timestamp)?);
        map.insert("hash".into(), Value::from("sha256"));
        map.insert("content".into(), unsigned.content.clone());

        let signed = serde_json::to_string_pretty(&map)?;
        let signature = identity.sign(signed.as_bytes());
        map.insert(
            "signature".into(),
            Value::from(format!("{}{}", STANDARD.encode(signature.to_bytes()), SIGNATURE_SUFFIX)),
        );

        let raw = serde_json::to_vec_pretty(&map)?;
        self.parse(&raw, false)
    }
}

/// All formats this node understands.
#[derive(Clone)]
pub struct Formats {
    formats: Vec<Arc<dyn FeedFormat>>,
}

impl Formats {
    pub fn new(formats: Vec<Arc<dyn FeedFormat>>) -> Self {
        Self { formats }
    }

    /// The default format, used when publishing.
    pub fn default_format(&self) -> &Arc<dyn FeedFormat> {
        &self.formats[0]
    }

    /// Verify with each format, returning the first success.
    pub fn verify(&self, raw: &[u8]) -> NodeResult<Message> {
        let mut last_err = None;
        for format in &self.formats {
            match format.verify(raw) {
                Ok(msg) => return Ok(msg),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| NodeError::Validation("no feed formats configured".to_string())))
    }

    pub fn load(&self, raw: &[u8]) -> NodeResult<Message> {
        let mut last_err = None;
        for format in &self.formats {
            match format.load(raw) {
                Ok(msg) => return Ok(msg),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| NodeError::Validation("no feed formats configured".to_string())))
    }
}

impl Default for Formats {
    fn default() -> Self {
        Self::new(vec![Arc::new(ClassicFormat)])
    }
}

impl std::fmt::Debug for Formats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.formats.iter().map(|f| f.name()).collect();
        f.debug_struct("Formats").field("formats", &names).finish()
    }
}

/// Message id: SHA-256 over the canonical text with every UTF-16 code unit
/// narrowed to one byte. This matches reference peers for non-ASCII content.
fn message_id(canonical: &str) -> MessageRef {
    let bytes: Vec<u8> = canonical.encode_utf16().map(|unit| unit as u8).collect();
    MessageRef::from_bytes(Sha256::digest(&bytes).into())
}

fn check_key_order(map: &Map<String, Value>) -> NodeResult<()> {
    const ORDER_A: [&str; 7] = ["previous", "author", "sequence", "timestamp", "hash", "content", "signature"];
    const ORDER_B: [&str; 7] = ["author", "previous", "sequence", "timestamp", "hash", "content", "signature"];
    let keys: Vec<&str> = map.keys().map(String::as_str).collect();
    if keys == ORDER_A || keys == ORDER_B {
        Ok(())
    } else {
        Err(NodeError::Validation(format!("unexpected message fields {:?}", keys)))
    }
}

fn field_str<'a>(map: &'a Map<String, Value>, key: &str) -> NodeResult<&'a str> {
    map.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| NodeError::Validation(format!("{} must be a string", key)))
}

fn decode_signature(text: &str) -> NodeResult<Signature> {
    let body = text
        .strip_suffix(SIGNATURE_SUFFIX)
        .ok_or_else(|| NodeError::Validation("signature must end with .sig.ed25519".to_string()))?;
    let bytes = STANDARD
        .decode(body)
        .map_err(|e| NodeError::Validation(format!("invalid signature base64: {}", e)))?;
    let bytes: [u8; 64] = bytes
        .try_into()
        .map_err(|_| NodeError::Validation("signature must be 64 bytes".to_string()))?;
    Ok(Signature::from_bytes(&bytes))
}

fn timestamp_value(ts: f64) -> NodeResult<Value> {
    if ts.fract() == 0.0 && ts.abs() < 9.0e15 {
        return Ok(Value::from(ts as i64));
    }
    Number::from_f64(ts)
        .map(Value::Number)
        .ok_or_else(|| NodeError::Validation(format!("timestamp {} is not a finite number", ts)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unsigned(identity: &Identity, sequence: u64, previous: Option<MessageRef>) -> UnsignedMessage {
        UnsignedMessage {
            previous,
            sequence,
            author: identity.public(),
            timestamp: 1_700_000_000_000.0,
            content: json!({"type": "post", "text": "hello"}),
        }
    }

    #[test]
    fn test_sign_then_verify() {
        let identity = Identity::generate();
        let format = ClassicFormat;
        let signed = format.sign(&unsigned(&identity, 1, None), &identity).unwrap();
        let verified = format.verify(&signed.raw).unwrap();
        assert_eq!(verified, signed);
        assert_eq!(verified.sequence, 1);
        assert_eq!(verified.author, identity.public());
        assert_eq!(verified.feed, identity.public().main_feed());
    }

    #[test]
    fn test_canonical_layout() {
        let identity = Identity::generate();
        let signed = ClassicFormat.sign(&unsigned(&identity, 1, None), &identity).unwrap();
        let text = String::from_utf8(signed.raw).unwrap();
        assert!(text.starts_with("{\n  \"previous\": null,\n  \"author\": \"@"));
        assert!(text.contains("\n  \"hash\": \"sha256\",\n"));
        assert!(text.contains("\"timestamp\": 1700000000000,"));
        assert!(text.trim_end().ends_with(".sig.ed25519\"\n}"));
    }

    #[test]
    fn test_compact_body_verifies_to_same_id() {
        let identity = Identity::generate();
        let signed = ClassicFormat.sign(&unsigned(&identity, 1, None), &identity).unwrap();
        let value: Value = serde_json::from_slice(&signed.raw).unwrap();
        let compact = serde_json::to_vec(&value).unwrap();
        let verified = ClassicFormat.verify(&compact).unwrap();
        assert_eq!(verified.id, signed.id);
        assert_eq!(verified.raw, signed.raw);
    }

    #[test]
    fn test_tampered_content_fails() {
        let identity = Identity::generate();
        let signed = ClassicFormat.sign(&unsigned(&identity, 1, None), &identity).unwrap();
        let tampered = String::from_utf8(signed.raw).unwrap().replace("hello", "jello");
        assert!(matches!(
            ClassicFormat.verify(tampered.as_bytes()),
            Err(NodeError::Validation(_))
        ));
        // Loading from trusted storage skips the signature check.
        assert!(ClassicFormat.load(tampered.as_bytes()).is_ok());
    }

    #[test]
    fn test_rejects_first_message_with_previous() {
        let identity = Identity::generate();
        let bogus = MessageRef::from_bytes([1; 32]);
        let result = ClassicFormat.sign(&unsigned(&identity, 1, Some(bogus)), &identity);
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_signing_for_someone_else() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        assert!(ClassicFormat.sign(&unsigned(&alice, 1, None), &bob).is_err());
    }

    #[test]
    fn test_rejects_wrong_key_order() {
        let identity = Identity::generate();
        let signed = ClassicFormat.sign(&unsigned(&identity, 1, None), &identity).unwrap();
        let value: Value = serde_json::from_slice(&signed.raw).unwrap();
        let mut reordered = Map::new();
        reordered.insert("sequence".into(), value["sequence"].clone());
        for (k, v) in value.as_object().unwrap() {
            if k != "sequence" {
                reordered.insert(k.clone(), v.clone());
            }
        }
        let raw = serde_json::to_vec_pretty(&reordered).unwrap();
        assert!(ClassicFormat.verify(&raw).is_err());
    }

    #[test]
    fn test_oversized_message_rejected() {
        let identity = Identity::generate();
        let mut msg = unsigned(&identity, 1, None);
        msg.content = json!({"type": "post", "text": "x".repeat(MAX_MESSAGE_SIZE)});
        assert!(ClassicFormat.sign(&msg, &identity).is_err());
    }

    #[test]
    fn test_fractional_timestamp_preserved() {
        let identity = Identity::generate();
        let mut msg = unsigned(&identity, 1, None);
        msg.timestamp = 1449201682755.001;
        let signed = ClassicFormat.sign(&msg, &identity).unwrap();
        assert_eq!(signed.timestamp, 1449201682755.001);
        assert!(ClassicFormat.verify(&signed.raw).is_ok());
    }

    #[test]
    fn test_formats_tries_each() {
        let identity = Identity::generate();
        let formats = Formats::default();
        let signed = formats
            .default_format()
            .sign(&unsigned(&identity, 1, None), &identity)
            .unwrap();
        assert_eq!(formats.verify(&signed.raw).unwrap().id, signed.id);
        assert!(formats.verify(b"garbage").is_err());
    }
}
