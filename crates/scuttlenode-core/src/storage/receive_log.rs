//! Receive log - a local, monotonic index of every accepted message
//!
//! Sequences start at 0 and are handed out densely from a persisted
//! counter. A sequence is never reused: when a feed is deleted its entries
//! stop resolving but the counter does not move back, so a message that is
//! accepted again later gets a fresh, larger sequence.

use redb::{ReadableTable, TableDefinition};

use super::{FeedRepository, Tx};
use crate::error::{NodeError, NodeResult};
use crate::feed::{Formats, Message};
use crate::identity::MessageRef;

/// Sequence to message id (key: receive log sequence, value: message ref)
pub(crate) const RECEIVE_LOG_SEQ_TO_ID: TableDefinition<u64, &str> =
    TableDefinition::new("receive_log_seq_to_id");

/// Message id to its sequences (key: (message ref, sequence))
pub(crate) const RECEIVE_LOG_ID_TO_SEQS: TableDefinition<(&str, u64), ()> =
    TableDefinition::new("receive_log_id_to_seqs");

/// Counters (key: name)
pub(crate) const RECEIVE_LOG_META: TableDefinition<&str, u64> =
    TableDefinition::new("receive_log_meta");

const NEXT_SEQUENCE_KEY: &str = "next_sequence";

/// A message together with its receive log sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveLogEntry {
    pub sequence: u64,
    pub message: Message,
}

pub struct ReceiveLogRepository<'a> {
    tx: Tx<'a>,
    formats: &'a Formats,
}

impl<'a> ReceiveLogRepository<'a> {
    pub(crate) fn new(tx: Tx<'a>, formats: &'a Formats) -> Self {
        Self { tx, formats }
    }

    /// The sequence the next accepted message will get.
    pub fn next_sequence(&self) -> NodeResult<u64> {
        with_table!(self.tx, RECEIVE_LOG_META, |meta| {
            Ok(meta.get(NEXT_SEQUENCE_KEY)?.map(|v| v.value()).unwrap_or(0))
        })
    }

    /// Index a message. Returns the new sequence, or `None` if the id is
    /// already indexed.
    pub fn put(&self, id: &MessageRef) -> NodeResult<Option<u64>> {
        if !self.get_sequences(id)?.is_empty() {
            return Ok(None);
        }
        let next = self.next_sequence()?;
        let txn = self.tx.write()?;
        let key = id.to_string();
        {
            let mut seq_to_id = txn.open_table(RECEIVE_LOG_SEQ_TO_ID)?;
            let mut id_to_seqs = txn.open_table(RECEIVE_LOG_ID_TO_SEQS)?;
            let mut meta = txn.open_table(RECEIVE_LOG_META)?;
            seq_to_id.insert(next, key.as_str())?;
            id_to_seqs.insert((key.as_str(), next), ())?;
            meta.insert(NEXT_SEQUENCE_KEY, next + 1)?;
        }
        Ok(Some(next))
    }

    /// Make sure later allocations start after `sequence`.
    ///
    /// Used when importing from an external log whose numbering should be
    /// preserved.
    pub fn reserve_sequences_up_to(&self, sequence: u64) -> NodeResult<()> {
        let next = self.next_sequence()?;
        if sequence.saturating_add(1) <= next {
            return Ok(());
        }
        let txn = self.tx.write()?;
        let mut meta = txn.open_table(RECEIVE_LOG_META)?;
        meta.insert(NEXT_SEQUENCE_KEY, sequence.saturating_add(1))?;
        Ok(())
    }

    /// All sequences assigned to `id`, ascending. The last one is canonical.
    pub fn get_sequences(&self, id: &MessageRef) -> NodeResult<Vec<u64>> {
        let key = id.to_string();
        with_table!(self.tx, RECEIVE_LOG_ID_TO_SEQS, |id_to_seqs| {
            let mut seqs = Vec::new();
            for entry in id_to_seqs.range((key.as_str(), 0)..=(key.as_str(), u64::MAX))? {
                let (k, _) = entry?;
                seqs.push(k.value().1);
            }
            Ok(seqs)
        })
    }

    /// Whether `sequence` is still a live assignment of `id`.
    fn is_assigned(&self, id: &str, sequence: u64) -> NodeResult<bool> {
        with_table!(self.tx, RECEIVE_LOG_ID_TO_SEQS, |id_to_seqs| {
            Ok(id_to_seqs.get((id, sequence))?.is_some())
        })
    }

    /// The message stored under `sequence`.
    pub fn get(&self, sequence: u64) -> NodeResult<Message> {
        let id = with_table!(self.tx, RECEIVE_LOG_SEQ_TO_ID, |seq_to_id| {
            seq_to_id.get(sequence)?.map(|v| v.value().to_string())
        });
        let not_found = || NodeError::NotFound(format!("receive log sequence {}", sequence));
        let id = id.ok_or_else(not_found)?;
        if !self.is_assigned(&id, sequence)? {
            return Err(not_found());
        }
        let id: MessageRef = id.parse()?;
        FeedRepository::new(self.tx, self.formats)
            .get_message_by_id(&id)?
            .ok_or_else(|| NodeError::NotFound(format!("message {} at sequence {}", id, sequence)))
    }

    /// Up to `limit` entries with sequence `>= start`, ascending. Sequences
    /// whose message is gone (e.g. the feed was banned) are skipped.
    pub fn list(&self, start: u64, limit: usize) -> NodeResult<Vec<ReceiveLogEntry>> {
        let feeds = FeedRepository::new(self.tx, self.formats);
        with_table!(self.tx, RECEIVE_LOG_SEQ_TO_ID, |seq_to_id| {
            let mut entries = Vec::new();
            for entry in seq_to_id.range(start..)? {
                if entries.len() >= limit {
                    break;
                }
                let (k, v) = entry?;
                let (sequence, id) = (k.value(), v.value());
                if !self.is_assigned(id, sequence)? {
                    continue;
                }
                if let Some(message) = feeds.get_message_by_id(&id.parse()?)? {
                    entries.push(ReceiveLogEntry { sequence, message });
                }
            }
            Ok(entries)
        })
    }

    /// Unmap a deleted message so that it can be indexed again if it is
    /// ever re-accepted. Its old sequences keep their rows but never
    /// resolve again.
    pub(crate) fn forget(&self, id: &MessageRef) -> NodeResult<()> {
        let seqs = self.get_sequences(id)?;
        if seqs.is_empty() {
            return Ok(());
        }
        let txn = self.tx.write()?;
        let key = id.to_string();
        let mut id_to_seqs = txn.open_table(RECEIVE_LOG_ID_TO_SEQS)?;
        for seq in seqs {
            id_to_seqs.remove((key.as_str(), seq))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::create_test_storage;
    use crate::error::NodeError;
    use crate::feed::ClassicFormat;
    use crate::identity::{Identity, MessageRef};
    use crate::storage::Storage;
    use chrono::Utc;
    use serde_json::json;

    fn id(n: u8) -> MessageRef {
        MessageRef::from_bytes([n; 32])
    }

    fn publish(storage: &Storage, identity: &Identity, count: u64) {
        let feed_ref = identity.public().main_feed();
        storage
            .update(|tx| {
                let mut feed = tx.feeds().load_or_new(&feed_ref)?;
                for n in 0..count {
                    feed.create_message(json!({"type": "test", "n": n}), Utc::now(), identity, &ClassicFormat)?;
                }
                tx.feeds().save(&mut feed)?;
                Ok(())
            })
            .unwrap();
    }

    fn page(storage: &Storage, start: u64, limit: usize) -> Vec<u64> {
        storage
            .view(|tx| tx.receive_log().list(start, limit))
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect()
    }

    #[test]
    fn test_sequences_start_at_zero_and_increase() {
        let (storage, _temp) = create_test_storage();
        let seqs: Vec<_> = (1..=3)
            .map(|n| storage.update(|tx| tx.receive_log().put(&id(n))).unwrap())
            .collect();
        assert_eq!(seqs, vec![Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn test_put_is_idempotent_per_id() {
        let (storage, _temp) = create_test_storage();
        assert_eq!(storage.update(|tx| tx.receive_log().put(&id(1))).unwrap(), Some(0));
        assert_eq!(storage.update(|tx| tx.receive_log().put(&id(1))).unwrap(), None);
        assert_eq!(storage.view(|tx| tx.receive_log().get_sequences(&id(1))).unwrap(), vec![0]);
        assert_eq!(storage.view(|tx| tx.receive_log().next_sequence()).unwrap(), 1);
    }

    #[test]
    fn test_reserve_moves_watermark_forward_only() {
        let (storage, _temp) = create_test_storage();
        storage.update(|tx| tx.receive_log().reserve_sequences_up_to(9)).unwrap();
        assert_eq!(storage.update(|tx| tx.receive_log().put(&id(1))).unwrap(), Some(10));
        storage.update(|tx| tx.receive_log().reserve_sequences_up_to(3)).unwrap();
        assert_eq!(storage.update(|tx| tx.receive_log().put(&id(2))).unwrap(), Some(11));
    }

    #[test]
    fn test_forgotten_id_gets_new_sequence() {
        let (storage, _temp) = create_test_storage();
        storage.update(|tx| tx.receive_log().put(&id(1))).unwrap();
        storage.update(|tx| tx.receive_log().put(&id(2))).unwrap();
        storage.update(|tx| tx.receive_log().forget(&id(1))).unwrap();
        assert_eq!(storage.update(|tx| tx.receive_log().put(&id(1))).unwrap(), Some(2));
        assert_eq!(storage.view(|tx| tx.receive_log().get_sequences(&id(1))).unwrap(), vec![2]);
        assert!(storage.view(|tx| tx.receive_log().get(0)).unwrap_err().is_not_found());
        // The old assignment is still recorded
        assert_eq!(storage.view(|tx| tx.receive_log().next_sequence()).unwrap(), 3);
    }

    #[test]
    fn test_get_unknown_sequence_is_not_found() {
        let (storage, _temp) = create_test_storage();
        let err = storage.view(|tx| tx.receive_log().get(42)).unwrap_err();
        assert!(matches!(err, NodeError::NotFound(_)));
    }

    #[test]
    fn test_list_skips_unresolvable_entries() {
        let (storage, _temp) = create_test_storage();
        // Ids without stored messages never resolve.
        storage.update(|tx| tx.receive_log().put(&id(1))).unwrap();
        assert!(storage.view(|tx| tx.receive_log().list(0, 10)).unwrap().is_empty());
    }

    #[test]
    fn test_list_pages_over_deleted_feeds() {
        let (storage, _temp) = create_test_storage();
        let alice = Identity::generate();
        let bob = Identity::generate();
        publish(&storage, &alice, 3);
        publish(&storage, &bob, 2);
        publish(&storage, &alice, 2);
        storage.update(|tx| tx.feeds().delete_feed(&bob.public().main_feed())).unwrap();

        assert_eq!(page(&storage, 0, 4), vec![0, 1, 2, 5]);
        assert_eq!(page(&storage, 2, 2), vec![2, 5]);
        assert_eq!(page(&storage, 3, 1), vec![5]);
        assert_eq!(page(&storage, 6, 10), vec![6]);
        assert!(page(&storage, 0, 0).is_empty());
    }

    #[test]
    fn test_reaccepted_message_is_listed_once() {
        let (storage, _temp) = create_test_storage();
        let alice = Identity::generate();
        publish(&storage, &alice, 1);
        let feed = alice.public().main_feed();
        let first = storage.view(|tx| tx.feeds().get_message(&feed, 1)).unwrap().unwrap();

        storage.update(|tx| tx.feeds().delete_feed(&feed)).unwrap();
        storage
            .update(|tx| {
                let mut log = tx.feeds().load_or_new(&feed)?;
                log.append_verified(first.clone())?;
                tx.feeds().save(&mut log)
            })
            .unwrap();

        assert_eq!(page(&storage, 0, 10), vec![1]);
        assert!(storage.view(|tx| tx.receive_log().get(0)).unwrap_err().is_not_found());
        assert_eq!(storage.view(|tx| tx.receive_log().get(1)).unwrap().id, first.id);
    }
}
