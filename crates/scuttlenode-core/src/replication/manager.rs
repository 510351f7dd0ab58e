//! Replication task scheduling
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  ReplicationManager                                          │
//! │  ├── active: FeedRef -> peer                                 │
//! │  │   └── a feed is replicated by at most one peer at a time  │
//! │  └── history: (peer, feed) -> last completion                │
//! │      └── drives per-peer backoff                             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each peer pulls tasks from its own [`TaskStream`]. The scheduler behind
//! it scans the wanted feeds nearest first, claims the first eligible feed
//! to a consumer waiting in [`TaskStream::next`]. A claimed task no consumer
//! asks for within the accept timeout is released again without leaving a
//! trace.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ReplicationConfig;
use crate::identity::{FeedRef, IdentityRef};
use crate::wanted::{Candidate, FeedState, WantedFeedsCache};

/// How a replication task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    /// The peer returned a full batch; ask again right away.
    HasMore,
    /// The peer has nothing beyond what we hold.
    NoMore,
    Failed,
}

#[derive(Debug, Clone, Copy)]
struct Completion {
    at: Instant,
    result: TaskResult,
    hops: Option<u32>,
}

#[derive(Default)]
struct State {
    active: HashMap<FeedRef, IdentityRef>,
    history: HashMap<(IdentityRef, FeedRef), Completion>,
}

struct Inner {
    wanted: Arc<WantedFeedsCache>,
    config: ReplicationConfig,
    state: Mutex<State>,
}

impl Inner {
    fn backoff(&self, completion: &Completion) -> std::time::Duration {
        match completion.result {
            TaskResult::HasMore => std::time::Duration::ZERO,
            TaskResult::NoMore if completion.hops.is_some_and(|h| h <= 1) => self.config.backoff_near(),
            TaskResult::NoMore => self.config.backoff_far(),
            TaskResult::Failed => self.config.backoff_failed(),
        }
    }

    /// Claim `candidate` for `peer` unless another peer holds it or the
    /// pair is backing off.
    fn try_claim(self: &Arc<Self>, peer: IdentityRef, candidate: &Candidate) -> Option<ReplicateFeedTask> {
        let mut state = self.state.lock();
        if state.active.contains_key(&candidate.feed) {
            return None;
        }
        if let Some(last) = state.history.get(&(peer, candidate.feed)) {
            if last.at.elapsed() < self.backoff(last) {
                return None;
            }
        }
        state.active.insert(candidate.feed, peer);
        Some(ReplicateFeedTask {
            peer,
            feed: candidate.feed,
            hops: candidate.hops,
            state: candidate.state,
            manager: self.clone(),
            done: false,
        })
    }

    /// Forget completions whose backoff has run out.
    fn prune_history(&self) {
        let mut state = self.state.lock();
        state.history.retain(|_, last| last.at.elapsed() < self.backoff(last));
    }

    fn release(&self, peer: IdentityRef, feed: FeedRef, completion: Option<Completion>) {
        let mut state = self.state.lock();
        if state.active.get(&feed) == Some(&peer) {
            state.active.remove(&feed);
        }
        if let Some(completion) = completion {
            state.history.insert((peer, feed), completion);
        }
    }
}

/// Hands out per-feed replication work to peers.
#[derive(Clone)]
pub struct ReplicationManager {
    inner: Arc<Inner>,
}

impl ReplicationManager {
    pub fn new(wanted: Arc<WantedFeedsCache>, config: ReplicationConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                wanted,
                config,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.inner.config
    }

    pub fn wanted(&self) -> &Arc<WantedFeedsCache> {
        &self.inner.wanted
    }

    /// Feeds currently being replicated by some peer.
    pub fn active_tasks(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    /// Stream of tasks for `peer`. With `self_only` only feeds at hops 0
    /// are offered. The scheduler stops when `cancel` fires or the stream
    /// is dropped.
    pub fn feeds_to_replicate(&self, peer: IdentityRef, self_only: bool, cancel: CancellationToken) -> TaskStream {
        let (requests, rx) = mpsc::channel(1);
        tokio::spawn(schedule(self.inner.clone(), peer, self_only, rx, cancel));
        TaskStream { requests }
    }
}

/// A consumer waiting in [`TaskStream::next`].
type Accept = oneshot::Sender<ReplicateFeedTask>;

async fn schedule(
    inner: Arc<Inner>,
    peer: IdentityRef,
    self_only: bool,
    mut requests: mpsc::Receiver<Accept>,
    cancel: CancellationToken,
) {
    let accept_timeout = inner.config.accept_timeout();
    let scan_interval = inner.config.scan_interval();
    let mut waiting: Option<Accept> = None;

    loop {
        inner.prune_history();
        match inner.wanted.get() {
            Ok(wanted) => {
                for candidate in wanted.candidates() {
                    if self_only && candidate.hops != Some(0) {
                        continue;
                    }
                    let Some(task) = inner.try_claim(peer, &candidate) else {
                        continue;
                    };
                    // A task only counts as accepted once a consumer asked for it
                    let accept = match waiting.take().filter(|accept| !accept.is_closed()) {
                        Some(accept) => accept,
                        None => {
                            let request = tokio::select! {
                                _ = cancel.cancelled() => return,
                                request = tokio::time::timeout(accept_timeout, requests.recv()) => request,
                            };
                            match request {
                                Ok(Some(accept)) => accept,
                                // Consumer gone
                                Ok(None) => return,
                                // Consumer busy; dropping the task releases the feed
                                Err(_) => break,
                            }
                        }
                    };
                    trace!(peer = %peer, feed = %task.feed, "Offering feed");
                    if accept.send(task).is_err() {
                        // Consumer stopped waiting; the returned task is dropped and released
                        break;
                    }
                }
            }
            Err(err) => warn!(peer = %peer, error = %err, "Could not load wanted feeds"),
        }

        if waiting.as_ref().is_some_and(|accept| accept.is_closed()) {
            waiting = None;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            request = requests.recv(), if waiting.is_none() => match request {
                // Rescan right away for the waiting consumer
                Some(accept) => waiting = Some(accept),
                None => return,
            },
            _ = tokio::time::sleep(scan_interval) => {}
        }
    }
}

/// Receiving end of [`ReplicationManager::feeds_to_replicate`].
pub struct TaskStream {
    requests: mpsc::Sender<Accept>,
}

impl TaskStream {
    /// Next task, `None` once the scheduler stopped.
    pub async fn next(&mut self) -> Option<ReplicateFeedTask> {
        let (accept, task) = oneshot::channel();
        self.requests.send(accept).await.ok()?;
        task.await.ok()
    }
}

/// Replication of one feed from one peer.
///
/// Must be finished with [`complete`](Self::complete). Dropping it releases
/// the feed without recording a result.
pub struct ReplicateFeedTask {
    peer: IdentityRef,
    feed: FeedRef,
    hops: Option<u32>,
    state: FeedState,
    manager: Arc<Inner>,
    done: bool,
}

impl ReplicateFeedTask {
    pub fn peer(&self) -> IdentityRef {
        self.peer
    }

    pub fn feed(&self) -> FeedRef {
        self.feed
    }

    /// Distance in the social graph, `None` for want-list feeds.
    pub fn hops(&self) -> Option<u32> {
        self.hops
    }

    /// Our state of the feed when the task was created.
    pub fn state(&self) -> FeedState {
        self.state
    }

    pub fn complete(mut self, result: TaskResult) {
        debug!(peer = %self.peer, feed = %self.feed, ?result, "Replication task finished");
        self.done = true;
        self.manager.release(
            self.peer,
            self.feed,
            Some(Completion {
                at: Instant::now(),
                result,
                hops: self.hops,
            }),
        );
    }
}

impl Drop for ReplicateFeedTask {
    fn drop(&mut self) {
        if !self.done {
            self.manager.release(self.peer, self.feed, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{ContactContent, ContactToSave};
    use crate::identity::Identity;
    use crate::storage::test_support::create_test_storage;
    use crate::wanted::WantedFeedsProvider;
    use std::time::Duration;

    struct Fixture {
        manager: ReplicationManager,
        local: FeedRef,
        contact: FeedRef,
        _dir: tempfile::TempDir,
    }

    /// Local identity following one contact (hops 1).
    fn fixture() -> Fixture {
        let (storage, dir) = create_test_storage();
        let local = Identity::generate().public();
        let contact = Identity::generate().public();
        storage
            .update(|tx| {
                tx.graph().apply(&ContactToSave {
                    author: local,
                    target: contact,
                    actions: ContactContent::follow(contact).actions,
                })
            })
            .unwrap();
        let provider = WantedFeedsProvider::new(storage, local, 3);
        let cache = Arc::new(WantedFeedsCache::new(provider, Duration::from_secs(5)));
        Fixture {
            manager: ReplicationManager::new(cache, ReplicationConfig::default()),
            local: local.main_feed(),
            contact: contact.main_feed(),
            _dir: dir,
        }
    }

    async fn next_feed(stream: &mut TaskStream, feed: FeedRef) -> ReplicateFeedTask {
        loop {
            let task = stream.next().await.unwrap();
            if task.feed() == feed {
                return task;
            }
            task.complete(TaskResult::NoMore);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_is_replicated_by_one_peer_at_a_time() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let p1 = Identity::generate().public();
        let p2 = Identity::generate().public();

        let mut s1 = f.manager.feeds_to_replicate(p1, false, cancel.clone());
        let task = next_feed(&mut s1, f.contact).await;
        assert_eq!(task.peer(), p1);
        assert_eq!(task.hops(), Some(1));

        let mut s2 = f.manager.feeds_to_replicate(p2, false, cancel.clone());
        let waited = tokio::time::timeout(Duration::from_secs(10), next_feed(&mut s2, f.contact)).await;
        assert!(waited.is_err(), "second peer got a feed that is still active");

        task.complete(TaskResult::HasMore);
        let task = next_feed(&mut s2, f.contact).await;
        assert_eq!(task.peer(), p2);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_more_backs_off_per_peer() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let peer = Identity::generate().public();
        let mut stream = f.manager.feeds_to_replicate(peer, false, cancel.clone());

        let started = Instant::now();
        next_feed(&mut stream, f.contact).await.complete(TaskResult::NoMore);
        let again = next_feed(&mut stream, f.contact).await;
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(40));

        again.complete(TaskResult::Failed);
        let failed_at = Instant::now();
        let _third = next_feed(&mut stream, f.contact).await;
        assert!(failed_at.elapsed() >= Duration::from_secs(600));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_has_more_is_offered_again_at_once() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let peer = Identity::generate().public();
        let mut stream = f.manager.feeds_to_replicate(peer, false, cancel.clone());

        next_feed(&mut stream, f.contact).await.complete(TaskResult::HasMore);
        let started = Instant::now();
        let _task = next_feed(&mut stream, f.contact).await;
        assert!(started.elapsed() <= Duration::from_secs(1));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unaccepted_task_is_released() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let peer = Identity::generate().public();
        let _stream = f.manager.feeds_to_replicate(peer, false, cancel.clone());

        // Nobody reads the stream, so every claim is released after the accept timeout
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(f.manager.active_tasks(), 0);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_peer_does_not_hold_feeds() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let idle = Identity::generate().public();
        let busy = Identity::generate().public();

        let _idle_stream = f.manager.feeds_to_replicate(idle, false, cancel.clone());
        let mut stream = f.manager.feeds_to_replicate(busy, false, cancel.clone());

        // Hold every task so nothing goes into backoff
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut held: Vec<ReplicateFeedTask> = Vec::new();
        let has = |held: &[ReplicateFeedTask], feed: FeedRef| held.iter().any(|t| t.feed() == feed);
        while !(has(held.as_slice(), f.local) && has(held.as_slice(), f.contact)) {
            let task = tokio::time::timeout_at(deadline, stream.next())
                .await
                .expect("every feed offered to the reading peer")
                .unwrap();
            assert_eq!(task.peer(), busy);
            held.push(task);
        }
        assert_eq!(f.manager.active_tasks(), 2);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_history_is_pruned() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let peer = Identity::generate().public();
        let mut stream = f.manager.feeds_to_replicate(peer, false, cancel.clone());

        next_feed(&mut stream, f.contact).await.complete(TaskResult::NoMore);
        assert!(f.manager.inner.state.lock().history.contains_key(&(peer, f.contact)));
        drop(stream);

        tokio::time::sleep(Duration::from_secs(31)).await;
        f.manager.inner.prune_history();
        assert!(!f.manager.inner.state.lock().history.contains_key(&(peer, f.contact)));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_only_offers_local_feed() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let peer = Identity::generate().public();
        let mut stream = f.manager.feeds_to_replicate(peer, true, cancel.clone());
        let task = stream.next().await.unwrap();
        assert_eq!(task.hops(), Some(0));
        assert_ne!(task.feed(), f.contact);
        task.complete(TaskResult::NoMore);
        cancel.cancel();
    }
}
