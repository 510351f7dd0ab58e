//! Append rules for a single feed
//!
//! A [`Feed`] is loaded from storage at the start of a transaction, extended
//! with verified or freshly signed messages, and then drained back into
//! storage with [`Feed::pop_appended`] and [`Feed::pop_derived`].
//!
//! ```text
//! ┌─────────────┐    ┌─────────────┐    ┌─────────────┐
//! │  Message 1  │───▶│  Message 2  │───▶│  Message 3  │
//! │  seq: 1     │    │  seq: 2     │    │  seq: 3     │
//! │  prev: ∅    │    │  prev: %m1  │    │  prev: %m2  │
//! └─────────────┘    └─────────────┘    └─────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::format::FeedFormat;
use super::message::{ContactAction, Message, UnsignedMessage};
use crate::error::{NodeError, NodeResult};
use crate::identity::{FeedRef, Identity, IdentityRef, MessageRef};

/// Latest message of a feed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedTip {
    pub sequence: u64,
    pub id: MessageRef,
    pub author: IdentityRef,
}

impl From<&Message> for FeedTip {
    fn from(msg: &Message) -> Self {
        Self {
            sequence: msg.sequence,
            id: msg.id,
            author: msg.author,
        }
    }
}

/// Graph change carried by an accepted contact message.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactToSave {
    pub author: IdentityRef,
    pub target: IdentityRef,
    pub actions: Vec<ContactAction>,
}

/// Outcome of [`Feed::append_verified`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Same message as the current tip; nothing changed.
    AlreadyPresent,
}

/// One feed: its tip plus the messages appended during this transaction.
#[derive(Debug)]
pub struct Feed {
    feed: FeedRef,
    tip: Option<FeedTip>,
    appended: Vec<Message>,
    derived: Vec<ContactToSave>,
}

impl Feed {
    /// An empty feed.
    pub fn new(feed: FeedRef) -> Self {
        Self {
            feed,
            tip: None,
            appended: Vec::new(),
            derived: Vec::new(),
        }
    }

    /// A feed whose latest stored message is `tip`.
    pub fn with_tip(feed: FeedRef, tip: FeedTip) -> Self {
        Self {
            feed,
            tip: Some(tip),
            appended: Vec::new(),
            derived: Vec::new(),
        }
    }

    pub fn feed_ref(&self) -> FeedRef {
        self.feed
    }

    /// Sequence of the latest message, `None` for an empty feed.
    pub fn sequence(&self) -> Option<u64> {
        self.tip.map(|t| t.sequence)
    }

    /// Id of the latest message.
    pub fn tip_ref(&self) -> Option<MessageRef> {
        self.tip.map(|t| t.id)
    }

    pub fn tip(&self) -> Option<&FeedTip> {
        self.tip.as_ref()
    }

    /// Append a message that a feed format already verified.
    pub fn append_verified(&mut self, msg: Message) -> NodeResult<AppendOutcome> {
        if msg.feed != self.feed {
            return Err(NodeError::Validation(format!(
                "message belongs to feed {} not {}",
                msg.feed, self.feed
            )));
        }

        match self.tip {
            None => {
                if msg.sequence != 1 {
                    return Err(NodeError::Validation(format!(
                        "first message of {} must have sequence 1, got {}",
                        self.feed, msg.sequence
                    )));
                }
                if msg.previous.is_some() {
                    return Err(NodeError::Validation(
                        "first message must not reference a previous message".to_string(),
                    ));
                }
            }
            Some(tip) => {
                if msg.sequence == tip.sequence && msg.id == tip.id {
                    return Ok(AppendOutcome::AlreadyPresent);
                }
                if msg.sequence <= tip.sequence {
                    return Err(NodeError::Validation(format!(
                        "feed {} already has sequence {}, got {}",
                        self.feed, tip.sequence, msg.sequence
                    )));
                }
                if msg.author != tip.author {
                    return Err(NodeError::Validation(format!(
                        "author {} does not match feed author {}",
                        msg.author, tip.author
                    )));
                }
                if msg.sequence != tip.sequence + 1 {
                    return Err(NodeError::Validation(format!(
                        "expected sequence {}, got {}",
                        tip.sequence + 1,
                        msg.sequence
                    )));
                }
                if msg.previous != Some(tip.id) {
                    return Err(NodeError::Validation(format!(
                        "message {} does not follow {}",
                        msg.sequence, tip.id
                    )));
                }
            }
        }

        if let Some(contact) = msg.content.as_contact() {
            self.derived.push(ContactToSave {
                author: msg.author,
                target: contact.contact,
                actions: contact.actions.clone(),
            });
        }
        self.tip = Some(FeedTip::from(&msg));
        self.appended.push(msg);
        Ok(AppendOutcome::Appended)
    }

    /// Build, sign and append the next message of this feed.
    pub fn create_message(
        &mut self,
        content: Value,
        now: DateTime<Utc>,
        identity: &Identity,
        format: &dyn FeedFormat,
    ) -> NodeResult<MessageRef> {
        if identity.public().main_feed() != self.feed {
            return Err(NodeError::Validation(format!(
                "identity {} cannot publish to feed {}",
                identity.public(),
                self.feed
            )));
        }
        let unsigned = UnsignedMessage {
            previous: self.tip_ref(),
            sequence: self.sequence().map_or(1, |s| s + 1),
            author: identity.public(),
            timestamp: now.timestamp_millis() as f64,
            content,
        };
        let msg = format.sign(&unsigned, identity)?;
        let id = msg.id;
        self.append_verified(msg)?;
        Ok(id)
    }

    /// Messages appended since the feed was loaded, in order.
    pub fn pop_appended(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.appended)
    }

    /// Derived graph changes queued by appended contact messages.
    pub fn pop_derived(&mut self) -> Vec<ContactToSave> {
        std::mem::take(&mut self.derived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::format::ClassicFormat;
    use crate::feed::message::ContactContent;
    use serde_json::json;

    fn sign(identity: &Identity, sequence: u64, previous: Option<MessageRef>) -> Message {
        ClassicFormat
            .sign(
                &UnsignedMessage {
                    previous,
                    sequence,
                    author: identity.public(),
                    timestamp: 0.0,
                    content: json!({"type": "test", "n": sequence}),
                },
                identity,
            )
            .unwrap()
    }

    #[test]
    fn test_append_chain() {
        let identity = Identity::generate();
        let mut feed = Feed::new(identity.public().main_feed());
        let m1 = sign(&identity, 1, None);
        let m2 = sign(&identity, 2, Some(m1.id));
        assert_eq!(feed.append_verified(m1.clone()).unwrap(), AppendOutcome::Appended);
        assert_eq!(feed.append_verified(m2.clone()).unwrap(), AppendOutcome::Appended);
        assert_eq!(feed.sequence(), Some(2));
        assert_eq!(feed.tip_ref(), Some(m2.id));
        assert_eq!(feed.pop_appended(), vec![m1, m2]);
        assert!(feed.pop_appended().is_empty());
    }

    #[test]
    fn test_wrong_previous_rejected_and_tip_kept() {
        let identity = Identity::generate();
        let mut feed = Feed::new(identity.public().main_feed());
        let m1 = sign(&identity, 1, None);
        let m2 = sign(&identity, 2, Some(m1.id));
        feed.append_verified(m1).unwrap();
        feed.append_verified(m2.clone()).unwrap();

        let m3 = sign(&identity, 3, Some(MessageRef::from_bytes([9; 32])));
        let err = feed.append_verified(m3).unwrap_err();
        assert!(matches!(err, NodeError::Validation(_)));
        assert_eq!(feed.tip_ref(), Some(m2.id));
        assert_eq!(feed.sequence(), Some(2));
    }

    #[test]
    fn test_first_message_must_be_sequence_one() {
        let identity = Identity::generate();
        let m1 = sign(&identity, 1, None);
        let m2 = sign(&identity, 2, Some(m1.id));
        let mut feed = Feed::new(identity.public().main_feed());
        assert!(feed.append_verified(m2).is_err());
        assert_eq!(feed.sequence(), None);
    }

    #[test]
    fn test_gap_rejected() {
        let identity = Identity::generate();
        let m1 = sign(&identity, 1, None);
        let m3 = sign(&identity, 3, Some(m1.id));
        let mut feed = Feed::new(identity.public().main_feed());
        feed.append_verified(m1).unwrap();
        assert!(feed.append_verified(m3).is_err());
    }

    #[test]
    fn test_duplicate_tip_is_idempotent() {
        let identity = Identity::generate();
        let m1 = sign(&identity, 1, None);
        let mut feed = Feed::new(identity.public().main_feed());
        feed.append_verified(m1.clone()).unwrap();
        feed.pop_appended();
        assert_eq!(feed.append_verified(m1).unwrap(), AppendOutcome::AlreadyPresent);
        assert!(feed.pop_appended().is_empty());
    }

    #[test]
    fn test_fork_at_tip_rejected() {
        let identity = Identity::generate();
        let m1 = sign(&identity, 1, None);
        let other = ClassicFormat
            .sign(
                &UnsignedMessage {
                    previous: None,
                    sequence: 1,
                    author: identity.public(),
                    timestamp: 5.0,
                    content: json!({"type": "fork"}),
                },
                &identity,
            )
            .unwrap();
        let mut feed = Feed::new(identity.public().main_feed());
        feed.append_verified(m1).unwrap();
        assert!(feed.append_verified(other).is_err());
    }

    #[test]
    fn test_other_feed_rejected() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let mut feed = Feed::new(alice.public().main_feed());
        assert!(feed.append_verified(sign(&bob, 1, None)).is_err());
    }

    #[test]
    fn test_create_message_extends_feed() {
        let identity = Identity::generate();
        let mut feed = Feed::new(identity.public().main_feed());
        let now = Utc::now();
        let first = feed
            .create_message(json!({"type": "x"}), now, &identity, &ClassicFormat)
            .unwrap();
        let second = feed
            .create_message(json!({"type": "y"}), now, &identity, &ClassicFormat)
            .unwrap();
        let appended = feed.pop_appended();
        assert_eq!(appended.len(), 2);
        assert_eq!(appended[0].id, first);
        assert_eq!(appended[1].previous, Some(first));
        assert_eq!(appended[1].id, second);
        assert_eq!(appended[1].sequence, 2);
    }

    #[test]
    fn test_contact_queues_derived_effect() {
        let identity = Identity::generate();
        let target = Identity::generate().public();
        let mut feed = Feed::new(identity.public().main_feed());
        feed.create_message(
            ContactContent::follow(target).to_value(),
            Utc::now(),
            &identity,
            &ClassicFormat,
        )
        .unwrap();
        let derived = feed.pop_derived();
        assert_eq!(
            derived,
            vec![ContactToSave {
                author: identity.public(),
                target,
                actions: vec![ContactAction::Follow],
            }]
        );
        assert!(feed.pop_derived().is_empty());
    }
}
