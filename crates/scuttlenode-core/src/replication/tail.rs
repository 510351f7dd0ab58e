//! Reading a feed in order, optionally following it live
//!
//! Stored messages are read in batches; live ones come from the broker. The
//! subscription is opened before storage is read so nothing published in
//! between is missed. If the broker drops us, or a live message skips a
//! sequence, reading falls back to storage from where it left off.

use std::collections::VecDeque;

use crate::error::NodeResult;
use crate::feed::Message;
use crate::identity::FeedRef;
use crate::pubsub::{MessageBroker, Subscription};
use crate::storage::Storage;

const BATCH: usize = 100;

pub(crate) struct FeedTail {
    storage: Storage,
    broker: MessageBroker,
    feed: FeedRef,
    next: u64,
    live: bool,
    catching_up: bool,
    buffered: VecDeque<Message>,
    subscription: Option<Subscription>,
}

impl FeedTail {
    /// Start at sequence `from`. With `old` unset stored messages are
    /// skipped and only messages appended after this call are returned.
    pub(crate) fn new(
        storage: Storage,
        broker: MessageBroker,
        feed: FeedRef,
        from: u64,
        old: bool,
        live: bool,
    ) -> NodeResult<Self> {
        let subscription = live.then(|| broker.subscribe_feed(feed));
        let mut next = from.max(1);
        if !old {
            let tip = storage.view(|tx| tx.feeds().sequence(&feed))?.unwrap_or(0);
            next = next.max(tip + 1);
        }
        Ok(Self {
            storage,
            broker,
            feed,
            next,
            live,
            catching_up: old,
            buffered: VecDeque::new(),
            subscription,
        })
    }

    /// Next message; `None` when not live and storage is exhausted.
    pub(crate) async fn next(&mut self) -> NodeResult<Option<Message>> {
        loop {
            if let Some(msg) = self.buffered.pop_front() {
                self.next = msg.sequence + 1;
                return Ok(Some(msg));
            }

            if self.catching_up {
                if self.live && self.subscription.is_none() {
                    self.subscription = Some(self.broker.subscribe_feed(self.feed));
                }
                let (feed, next) = (self.feed, self.next);
                let batch = self
                    .storage
                    .view(|tx| tx.feeds().messages_from(&feed, next, Some(BATCH)))?;
                if batch.is_empty() {
                    self.catching_up = false;
                } else {
                    self.buffered.extend(batch);
                }
                continue;
            }

            if !self.live {
                return Ok(None);
            }
            let feed = self.feed;
            let broker = &self.broker;
            let subscription = self.subscription.get_or_insert_with(|| broker.subscribe_feed(feed));
            let received = subscription.recv().await;
            match received {
                Some(msg) if msg.sequence < self.next => continue,
                Some(msg) if msg.sequence == self.next => {
                    self.next += 1;
                    return Ok(Some(msg));
                }
                Some(_) => self.catching_up = true,
                None => {
                    self.subscription = None;
                    self.catching_up = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::test_support::chain;
    use crate::identity::Identity;
    use crate::ingest::RawMessageHandler;
    use crate::storage::test_support::create_test_storage;
    use std::time::Duration;

    #[tokio::test]
    async fn test_old_then_live() {
        let (storage, _dir) = create_test_storage();
        let broker = MessageBroker::default();
        let handler = RawMessageHandler::new(storage.clone(), broker.clone());
        let alice = Identity::generate();
        let feed = alice.public().main_feed();
        let msgs = chain(&alice, 3);
        handler.handle(&msgs[0].raw).unwrap();
        handler.handle(&msgs[1].raw).unwrap();

        let mut tail = FeedTail::new(storage, broker, feed, 1, true, true).unwrap();
        assert_eq!(tail.next().await.unwrap().unwrap().sequence, 1);
        assert_eq!(tail.next().await.unwrap().unwrap().sequence, 2);

        handler.handle(&msgs[2].raw).unwrap();
        let third = tokio::time::timeout(Duration::from_secs(5), tail.next()).await.unwrap();
        assert_eq!(third.unwrap().unwrap().sequence, 3);
    }

    #[tokio::test]
    async fn test_live_only_skips_stored() {
        let (storage, _dir) = create_test_storage();
        let broker = MessageBroker::default();
        let handler = RawMessageHandler::new(storage.clone(), broker.clone());
        let alice = Identity::generate();
        let msgs = chain(&alice, 2);
        handler.handle(&msgs[0].raw).unwrap();

        let mut tail = FeedTail::new(storage, broker, alice.public().main_feed(), 1, false, true).unwrap();
        handler.handle(&msgs[1].raw).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), tail.next()).await.unwrap();
        assert_eq!(got.unwrap().unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_neither_old_nor_live_is_empty() {
        let (storage, _dir) = create_test_storage();
        let broker = MessageBroker::default();
        let handler = RawMessageHandler::new(storage.clone(), broker.clone());
        let alice = Identity::generate();
        for msg in chain(&alice, 2) {
            handler.handle(&msg.raw).unwrap();
        }
        let mut tail = FeedTail::new(storage, broker, alice.public().main_feed(), 1, false, false).unwrap();
        assert!(tail.next().await.unwrap().is_none());
    }
}
