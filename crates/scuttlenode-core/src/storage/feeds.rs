//! Feed storage - raw messages keyed by feed and sequence
//!
//! Saving a feed also maintains the message-id index, the receive log and
//! the contact graph, so every accepted message is indexed in the same
//! transaction that stores it.

use redb::{ReadableTable, TableDefinition};
use tracing::debug;

use super::{GraphRepository, ReceiveLogRepository, Tx};
use crate::error::{NodeError, NodeResult};
use crate::feed::{Feed, FeedTip, Formats, Message};
use crate::identity::{FeedRef, MessageRef};

/// Raw messages (key: (feed ref, sequence), value: canonical bytes)
pub(crate) const FEEDS_TABLE: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("feeds");

/// Latest stored sequence per feed (key: feed ref)
pub(crate) const FEED_HEADS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("feed_heads");

/// Message id lookup (key: message ref, value: (feed ref, sequence))
pub(crate) const MESSAGE_INDEX_TABLE: TableDefinition<&str, (&str, u64)> =
    TableDefinition::new("message_index");

/// Feed repository bound to one transaction.
pub struct FeedRepository<'a> {
    tx: Tx<'a>,
    formats: &'a Formats,
}

impl<'a> FeedRepository<'a> {
    pub(crate) fn new(tx: Tx<'a>, formats: &'a Formats) -> Self {
        Self { tx, formats }
    }

    /// Latest stored sequence of a feed, `None` if nothing is stored.
    pub fn sequence(&self, feed: &FeedRef) -> NodeResult<Option<u64>> {
        let key = feed.to_string();
        with_table!(self.tx, FEED_HEADS_TABLE, |heads| {
            Ok(heads.get(key.as_str())?.map(|v| v.value()))
        })
    }

    /// Load a feed with its current tip, `None` if nothing is stored.
    pub fn get_feed(&self, feed: &FeedRef) -> NodeResult<Option<Feed>> {
        let Some(sequence) = self.sequence(feed)? else {
            return Ok(None);
        };
        let tip = self.get_message(feed, sequence)?.ok_or_else(|| {
            NodeError::Storage(format!("feed {} head {} has no message", feed, sequence))
        })?;
        Ok(Some(Feed::with_tip(*feed, FeedTip::from(&tip))))
    }

    /// Load a feed, or start an empty one.
    pub fn load_or_new(&self, feed: &FeedRef) -> NodeResult<Feed> {
        Ok(self.get_feed(feed)?.unwrap_or_else(|| Feed::new(*feed)))
    }

    /// Persist everything appended to `feed` and index it.
    ///
    /// Returns the newly stored messages in feed order.
    pub fn save(&self, feed: &mut Feed) -> NodeResult<Vec<Message>> {
        let txn = self.tx.write()?;
        let messages = feed.pop_appended();
        let derived = feed.pop_derived();
        if messages.is_empty() {
            return Ok(messages);
        }

        let feed_key = feed.feed_ref().to_string();
        {
            let mut feeds = txn.open_table(FEEDS_TABLE)?;
            let mut index = txn.open_table(MESSAGE_INDEX_TABLE)?;
            let mut heads = txn.open_table(FEED_HEADS_TABLE)?;
            for msg in &messages {
                let id = msg.id.to_string();
                feeds.insert((feed_key.as_str(), msg.sequence), msg.raw.as_slice())?;
                index.insert(id.as_str(), (feed_key.as_str(), msg.sequence))?;
                heads.insert(feed_key.as_str(), msg.sequence)?;
            }
        }

        let receive_log = ReceiveLogRepository::new(self.tx, self.formats);
        for msg in &messages {
            if let Some(seq) = receive_log.put(&msg.id)? {
                debug!(feed = %feed_key, seq = msg.sequence, receive_log_seq = seq, "Stored message");
            }
        }

        let graph = GraphRepository::new(self.tx);
        for contact in &derived {
            graph.apply(contact)?;
        }

        Ok(messages)
    }

    /// Message at `sequence` of `feed`.
    pub fn get_message(&self, feed: &FeedRef, sequence: u64) -> NodeResult<Option<Message>> {
        let key = feed.to_string();
        let raw = with_table!(self.tx, FEEDS_TABLE, |feeds| {
            feeds
                .get((key.as_str(), sequence))?
                .map(|v| v.value().to_vec())
        });
        raw.map(|raw| self.formats.load(&raw)).transpose()
    }

    /// Look a message up by id.
    pub fn get_message_by_id(&self, id: &MessageRef) -> NodeResult<Option<Message>> {
        let key = id.to_string();
        let locator = with_table!(self.tx, MESSAGE_INDEX_TABLE, |index| {
            index.get(key.as_str())?.map(|v| {
                let (feed, seq) = v.value();
                (feed.to_string(), seq)
            })
        });
        match locator {
            Some((feed, seq)) => self.get_message(&feed.parse()?, seq),
            None => Ok(None),
        }
    }

    /// Messages with sequence `>= from`, ascending, at most `limit`.
    pub fn messages_from(
        &self,
        feed: &FeedRef,
        from: u64,
        limit: Option<usize>,
    ) -> NodeResult<Vec<Message>> {
        let key = feed.to_string();
        let limit = limit.unwrap_or(usize::MAX);
        let raws: Vec<Vec<u8>> = with_table!(self.tx, FEEDS_TABLE, |feeds| {
            let mut raws = Vec::new();
            for entry in feeds.range((key.as_str(), from)..=(key.as_str(), u64::MAX))? {
                if raws.len() >= limit {
                    break;
                }
                let (_, value) = entry?;
                raws.push(value.value().to_vec());
            }
            raws
        });
        raws.iter().map(|raw| self.formats.load(raw)).collect()
    }

    /// Walk a feed from its tip towards sequence 1 while `visit` returns true.
    pub fn walk_back(
        &self,
        feed: &FeedRef,
        mut visit: impl FnMut(Message) -> NodeResult<bool>,
    ) -> NodeResult<()> {
        let key = feed.to_string();
        with_table!(self.tx, FEEDS_TABLE, |feeds| {
            for entry in feeds.range((key.as_str(), 0)..=(key.as_str(), u64::MAX))?.rev() {
                let (_, value) = entry?;
                let msg = self.formats.load(value.value())?;
                if !visit(msg)? {
                    break;
                }
            }
        });
        Ok(())
    }

    /// Every stored feed with its latest sequence.
    pub fn list_feeds(&self) -> NodeResult<Vec<(FeedRef, u64)>> {
        let entries: Vec<(String, u64)> = with_table!(self.tx, FEED_HEADS_TABLE, |heads| {
            let mut entries = Vec::new();
            for entry in heads.iter()? {
                let (key, value) = entry?;
                entries.push((key.value().to_string(), value.value()));
            }
            entries
        });
        entries
            .into_iter()
            .map(|(feed, seq)| Ok((feed.parse()?, seq)))
            .collect()
    }

    /// Remove a feed with all its messages, index entries and contact edges.
    ///
    /// Receive log sequences already assigned to these messages are not
    /// reused; they simply stop resolving.
    pub fn delete_feed(&self, feed: &FeedRef) -> NodeResult<usize> {
        let txn = self.tx.write()?;
        let feed_key = feed.to_string();

        let ids: Vec<(u64, MessageRef)> = {
            let feeds = txn.open_table(FEEDS_TABLE)?;
            let mut ids = Vec::new();
            for entry in feeds.range((feed_key.as_str(), 0)..=(feed_key.as_str(), u64::MAX))? {
                let (key, value) = entry?;
                let (_, seq) = key.value();
                ids.push((seq, self.formats.load(value.value())?.id));
            }
            ids
        };

        {
            let mut feeds = txn.open_table(FEEDS_TABLE)?;
            let mut index = txn.open_table(MESSAGE_INDEX_TABLE)?;
            let mut heads = txn.open_table(FEED_HEADS_TABLE)?;
            for (seq, id) in &ids {
                feeds.remove((feed_key.as_str(), *seq))?;
                index.remove(id.to_string().as_str())?;
            }
            heads.remove(feed_key.as_str())?;
        }

        let receive_log = ReceiveLogRepository::new(self.tx, self.formats);
        for (_, id) in &ids {
            receive_log.forget(id)?;
        }
        GraphRepository::new(self.tx).remove_author(&feed.identity())?;

        Ok(ids.len())
    }
}
