//! Message model
//!
//! A [`Message`] keeps both its parsed fields and the exact canonical bytes
//! that were signed, so it can be forwarded without re-serialization.

use serde_json::Value;

use crate::error::{NodeError, NodeResult};
use crate::identity::{FeedRef, IdentityRef, MessageRef};

/// Typed content. Anything the node does not interpret stays opaque.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    /// `{"type": "contact", ...}`
    Contact(ContactContent),
    /// Any other content, kept as its JSON bytes
    Unknown(Vec<u8>),
}

impl Content {
    /// Interpret a content JSON value.
    ///
    /// Malformed `contact` content is not an error; it is kept as unknown
    /// content just like any other type the node does not understand.
    pub fn from_value(value: &Value) -> Self {
        if value.get("type").and_then(Value::as_str) == Some("contact") {
            if let Some(contact) = ContactContent::from_value(value) {
                return Content::Contact(contact);
            }
        }
        Content::Unknown(serde_json::to_vec(value).unwrap_or_default())
    }

    pub fn as_contact(&self) -> Option<&ContactContent> {
        match self {
            Content::Contact(c) => Some(c),
            Content::Unknown(_) => None,
        }
    }
}

/// What a contact message says about its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactAction {
    Follow,
    Unfollow,
    Block,
    Unblock,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContactContent {
    pub contact: IdentityRef,
    pub actions: Vec<ContactAction>,
}

impl ContactContent {
    pub fn follow(contact: IdentityRef) -> Self {
        Self {
            contact,
            actions: vec![ContactAction::Follow],
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        let contact: IdentityRef = value.get("contact")?.as_str()?.parse().ok()?;
        let mut actions = Vec::new();
        match value.get("following").and_then(Value::as_bool) {
            Some(true) => actions.push(ContactAction::Follow),
            Some(false) => actions.push(ContactAction::Unfollow),
            None => {}
        }
        match value.get("blocking").and_then(Value::as_bool) {
            Some(true) => actions.push(ContactAction::Block),
            Some(false) => actions.push(ContactAction::Unblock),
            None => {}
        }
        if actions.is_empty() {
            return None;
        }
        Some(Self { contact, actions })
    }

    /// JSON content for publishing.
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("type".into(), Value::from("contact"));
        map.insert("contact".into(), Value::from(self.contact.to_string()));
        for action in &self.actions {
            match action {
                ContactAction::Follow => map.insert("following".into(), Value::Bool(true)),
                ContactAction::Unfollow => map.insert("following".into(), Value::Bool(false)),
                ContactAction::Block => map.insert("blocking".into(), Value::Bool(true)),
                ContactAction::Unblock => map.insert("blocking".into(), Value::Bool(false)),
            };
        }
        Value::Object(map)
    }
}

/// A verified message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageRef,
    pub previous: Option<MessageRef>,
    pub sequence: u64,
    pub author: IdentityRef,
    pub feed: FeedRef,
    /// Declared by the author; untrusted.
    pub timestamp: f64,
    pub content: Content,
    /// Canonical bytes, exactly as signed.
    pub raw: Vec<u8>,
}

impl Message {
    /// Parse the content out of the canonical bytes.
    pub fn content_value(&self) -> NodeResult<Value> {
        let value: Value = serde_json::from_slice(&self.raw)?;
        value
            .get("content")
            .cloned()
            .ok_or_else(|| NodeError::Validation("message has no content".to_string()))
    }

    /// The message as `{key, value, timestamp}` - the envelope reference
    /// peers send when `keys` is requested.
    pub fn to_keyed_value(&self, received_at_ms: i64) -> NodeResult<Value> {
        let value: Value = serde_json::from_slice(&self.raw)?;
        let mut map = serde_json::Map::new();
        map.insert("key".into(), Value::from(self.id.to_string()));
        map.insert("value".into(), value);
        map.insert("timestamp".into(), Value::from(received_at_ms));
        Ok(Value::Object(map))
    }
}

/// A message that has not been signed yet.
#[derive(Debug, Clone)]
pub struct UnsignedMessage {
    pub previous: Option<MessageRef>,
    pub sequence: u64,
    pub author: IdentityRef,
    pub timestamp: f64,
    /// Content JSON; an object, or a string for encrypted content.
    pub content: Value,
}

impl UnsignedMessage {
    /// Check the content bytes a user asked to publish.
    pub fn parse_content(content: &[u8]) -> NodeResult<Value> {
        let value: Value = serde_json::from_slice(content)
            .map_err(|e| NodeError::Validation(format!("content is not valid JSON: {}", e)))?;
        match &value {
            Value::Object(_) | Value::String(_) => Ok(value),
            _ => Err(NodeError::Validation(
                "content must be a JSON object or string".to_string(),
            )),
        }
    }
}
