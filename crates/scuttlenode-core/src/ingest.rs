//! Ingestion of messages received from peers
//!
//! Verification runs before the write transaction is opened. Inside the
//! transaction the ban list is checked, the message is appended to its feed
//! and everything is persisted and indexed. Subscribers are notified only
//! after the commit.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{NodeError, NodeResult};
use crate::feed::{AppendOutcome, Message};
use crate::pubsub::MessageBroker;
use crate::storage::Storage;
use crate::wanted::WantedFeedsCache;

/// What happened to an ingested message.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Stored(Message),
    /// Already stored at that position; nothing changed.
    Duplicate,
}

/// Verifies, stores and announces raw messages.
#[derive(Clone)]
pub struct RawMessageHandler {
    storage: Storage,
    broker: MessageBroker,
    wanted: Option<Arc<WantedFeedsCache>>,
}

impl RawMessageHandler {
    pub fn new(storage: Storage, broker: MessageBroker) -> Self {
        Self {
            storage,
            broker,
            wanted: None,
        }
    }

    /// Invalidate `cache` whenever a contact message is stored.
    pub fn with_wanted_cache(mut self, cache: Arc<WantedFeedsCache>) -> Self {
        self.wanted = Some(cache);
        self
    }

    /// Verify and store one raw message.
    pub fn handle(&self, raw: &[u8]) -> NodeResult<IngestOutcome> {
        let msg = self.storage.formats().verify(raw)?;
        self.handle_verified(msg)
    }

    /// Store a message whose signature was already checked.
    pub fn handle_verified(&self, msg: Message) -> NodeResult<IngestOutcome> {
        let feed_ref = msg.feed;
        let sequence = msg.sequence;
        let id = msg.id;

        let stored = self.storage.update(|tx| {
            if tx.ban_list().contains_feed(&feed_ref)? {
                return Err(NodeError::Validation(format!("feed {} is banned", feed_ref)));
            }

            let feeds = tx.feeds();
            let mut feed = feeds.load_or_new(&feed_ref)?;
            if feed.sequence().is_some_and(|tip| sequence <= tip) {
                return match feeds.get_message(&feed_ref, sequence)? {
                    Some(existing) if existing.id == id => Ok(None),
                    _ => Err(NodeError::Validation(format!(
                        "feed {} already has a different message at sequence {}",
                        feed_ref, sequence
                    ))),
                };
            }

            match feed.append_verified(msg)? {
                AppendOutcome::AlreadyPresent => Ok(None),
                AppendOutcome::Appended => Ok(feeds.save(&mut feed)?.pop()),
            }
        })?;

        match stored {
            Some(msg) => {
                trace!(feed = %feed_ref, seq = sequence, "Ingested message");
                if msg.content.as_contact().is_some() {
                    if let Some(cache) = &self.wanted {
                        debug!(author = %msg.author, "Contact message stored, refreshing wanted feeds");
                        cache.invalidate();
                    }
                }
                self.broker.publish(std::slice::from_ref(&msg));
                Ok(IngestOutcome::Stored(msg))
            }
            None => Ok(IngestOutcome::Duplicate),
        }
    }

    pub fn broker(&self) -> &MessageBroker {
        &self.broker
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}
