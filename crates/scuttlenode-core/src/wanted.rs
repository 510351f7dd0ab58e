//! Wanted feeds - which feeds this node replicates
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ social graph │   │  want list   │   │   ban list   │
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        │ contacts         │ other feeds      │ minus
//!        └──────────────────┴──────────────────┘
//!                           ▼
//!                     WantedFeeds
//! ```
//!
//! Everything is read in a single transaction so the three sources are
//! consistent with each other. [`WantedFeedsCache`] keeps the result for a
//! short while and lets long-running sessions watch for changes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::error::NodeResult;
use crate::graph::SocialGraph;
use crate::identity::{FeedRef, IdentityRef};
use crate::storage::{Adapters, Storage};

/// What we hold of a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedState {
    #[default]
    Empty,
    /// Sequence of the latest stored message
    Sequence(u64),
}

impl FeedState {
    pub fn sequence(&self) -> Option<u64> {
        match self {
            FeedState::Empty => None,
            FeedState::Sequence(s) => Some(*s),
        }
    }

    /// The sequence to ask peers for next.
    pub fn next_sequence(&self) -> u64 {
        self.sequence().map_or(1, |s| s + 1)
    }
}

impl From<Option<u64>> for FeedState {
    fn from(seq: Option<u64>) -> Self {
        seq.map_or(FeedState::Empty, FeedState::Sequence)
    }
}

/// A feed wanted because of the social graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub feed: FeedRef,
    pub hops: u32,
    pub state: FeedState,
}

/// A feed wanted because it is on the want list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantedFeed {
    pub feed: FeedRef,
    pub state: FeedState,
}

/// One candidate for replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub feed: FeedRef,
    /// `None` for want-list feeds outside the graph
    pub hops: Option<u32>,
    pub state: FeedState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WantedFeeds {
    /// Sorted ascending by hops; the local feed comes first.
    pub contacts: Vec<Contact>,
    pub other_feeds: Vec<WantedFeed>,
}

impl WantedFeeds {
    /// Contacts first (nearest first), then want-list feeds.
    pub fn candidates(&self) -> impl Iterator<Item = Candidate> + '_ {
        let contacts = self.contacts.iter().map(|c| Candidate {
            feed: c.feed,
            hops: Some(c.hops),
            state: c.state,
        });
        let others = self.other_feeds.iter().map(|w| Candidate {
            feed: w.feed,
            hops: None,
            state: w.state,
        });
        contacts.chain(others)
    }

    pub fn get(&self, feed: &FeedRef) -> Option<Candidate> {
        self.candidates().find(|c| c.feed == *feed)
    }

    pub fn is_wanted(&self, feed: &FeedRef) -> bool {
        self.get(feed).is_some()
    }

    pub fn len(&self) -> usize {
        self.contacts.len() + self.other_feeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Same feeds regardless of their states.
    fn same_feeds(&self, other: &WantedFeeds) -> bool {
        self.candidates()
            .map(|c| (c.feed, c.hops))
            .eq(other.candidates().map(|c| (c.feed, c.hops)))
    }
}

/// Computes [`WantedFeeds`] from storage.
#[derive(Clone)]
pub struct WantedFeedsProvider {
    storage: Storage,
    local: IdentityRef,
    max_hops: u32,
}

impl WantedFeedsProvider {
    pub fn new(storage: Storage, local: IdentityRef, max_hops: u32) -> Self {
        Self {
            storage,
            local,
            max_hops,
        }
    }

    pub fn get(&self) -> NodeResult<WantedFeeds> {
        self.storage.view(|tx| self.compute(tx))
    }

    fn compute(&self, tx: &Adapters<'_>) -> NodeResult<WantedFeeds> {
        let graph = SocialGraph::load(tx, self.local, self.max_hops)?;
        let feeds = tx.feeds();
        let ban_list = tx.ban_list();

        let mut contacts = Vec::new();
        for (identity, hops) in graph.contacts() {
            let feed = identity.main_feed();
            if hops > 0 && ban_list.contains_feed(&feed)? {
                continue;
            }
            contacts.push(Contact {
                feed,
                hops,
                state: feeds.sequence(&feed)?.into(),
            });
        }

        let mut other_feeds = Vec::new();
        for entry in tx.want_list().list(Utc::now())? {
            if graph.has_contact(&entry.feed.identity()) || ban_list.contains_feed(&entry.feed)? {
                continue;
            }
            other_feeds.push(WantedFeed {
                feed: entry.feed,
                state: feeds.sequence(&entry.feed)?.into(),
            });
        }

        Ok(WantedFeeds {
            contacts,
            other_feeds,
        })
    }
}

struct CachedEntry {
    at: Instant,
    feeds: Arc<WantedFeeds>,
}

/// [`WantedFeedsProvider`] behind a time-to-live cache.
///
/// Subscribers of [`WantedFeedsCache::subscribe`] are notified when a
/// refresh changes the set of wanted feeds (states alone do not count).
pub struct WantedFeedsCache {
    provider: WantedFeedsProvider,
    ttl: Duration,
    cached: Mutex<Option<CachedEntry>>,
    changes: watch::Sender<Arc<WantedFeeds>>,
}

impl WantedFeedsCache {
    pub fn new(provider: WantedFeedsProvider, ttl: Duration) -> Self {
        let (changes, _) = watch::channel(Arc::new(WantedFeeds::default()));
        Self {
            provider,
            ttl,
            cached: Mutex::new(None),
            changes,
        }
    }

    /// Cached value, recomputed when older than the TTL.
    pub fn get(&self) -> NodeResult<Arc<WantedFeeds>> {
        let mut cached = self.cached.lock();
        if let Some(entry) = cached.as_ref() {
            if entry.at.elapsed() < self.ttl {
                return Ok(entry.feeds.clone());
            }
        }

        let feeds = Arc::new(self.provider.get()?);
        *cached = Some(CachedEntry {
            at: Instant::now(),
            feeds: feeds.clone(),
        });
        drop(cached);

        self.changes.send_if_modified(|current| {
            if current.same_feeds(&feeds) {
                *current = feeds.clone();
                false
            } else {
                debug!(count = feeds.len(), "Wanted feeds changed");
                *current = feeds.clone();
                true
            }
        });
        Ok(feeds)
    }

    /// Drop the cached value so the next [`get`](Self::get) recomputes.
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }

    /// Recompute now and notify subscribers if the set changed.
    pub fn refresh(&self) -> NodeResult<Arc<WantedFeeds>> {
        self.invalidate();
        self.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<WantedFeeds>> {
        self.changes.subscribe()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
