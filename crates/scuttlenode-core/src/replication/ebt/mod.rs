//! Epidemic broadcast tree replication (`ebt.replicate`)
//!
//! ```text
//!   local                                   remote
//!     │ ── notes {feed: seq*2+flag, ...} ──▶  │
//!     │ ◀── notes ──────────────────────────  │
//!     │ ◀── raw messages (feeds we want) ───  │
//!     │ ── raw messages (feeds it wants) ──▶  │
//! ```
//!
//! Both directions of one duplex stream carry notes maps and raw messages.
//! For every feed the remote asks for we run a streamer that sends stored
//! messages past the remote's sequence and then follows the feed live.
//! Whenever the wanted feeds change a new notes map goes out.

mod notes;
mod tracker;

pub use notes::{Note, Notes};
pub use tracker::{SessionGuard, SessionTracker};

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::tail::FeedTail;
use crate::error::{NodeError, NodeResult};
use crate::identity::{FeedRef, IdentityRef};
use crate::ingest::RawMessageHandler;
use crate::rpc::{Body, Connection, Handler, IncomingRequest, ProcedureName, ProcedureType, RpcSender, RpcStream};
use crate::wanted::{WantedFeeds, WantedFeedsCache};

pub const EBT_REPLICATE: &str = "ebt.replicate";

const EBT_VERSION: u32 = 3;
const EBT_FORMAT: &str = "classic";

/// Arguments of `ebt.replicate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EbtArgs {
    pub version: u32,
    #[serde(default = "classic")]
    pub format: String,
}

fn classic() -> String {
    EBT_FORMAT.to_string()
}

impl Default for EbtArgs {
    fn default() -> Self {
        Self {
            version: EBT_VERSION,
            format: classic(),
        }
    }
}

struct Inner {
    wanted: Arc<WantedFeedsCache>,
    handler: RawMessageHandler,
    tracker: SessionTracker,
}

/// Runs EBT sessions, as the side that opened them or the side serving them.
#[derive(Clone)]
pub struct EbtReplicator {
    inner: Arc<Inner>,
}

impl EbtReplicator {
    pub fn new(wanted: Arc<WantedFeedsCache>, handler: RawMessageHandler) -> Self {
        Self {
            inner: Arc::new(Inner {
                wanted,
                handler,
                tracker: SessionTracker::new(),
            }),
        }
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.inner.tracker
    }

    /// Open a session on `conn` and run it until either side ends it.
    ///
    /// Returns [`NodeError::PeerDoesNotSupportEbt`] if the remote does not
    /// know the procedure.
    pub async fn replicate(&self, conn: &Connection) -> NodeResult<()> {
        let args = serde_json::json!([EbtArgs::default()]);
        let (sender, stream) = conn.duplex(ProcedureName::from(EBT_REPLICATE), args).await?;
        match self.run(conn.remote(), sender, stream, conn.cancellation_token()).await {
            Err(err) if err.is_method_not_supported() => Err(NodeError::PeerDoesNotSupportEbt),
            other => other,
        }
    }

    /// Handler serving sessions opened by remotes.
    pub fn handler(&self) -> EbtHandler {
        EbtHandler {
            replicator: self.clone(),
        }
    }

    async fn run(
        &self,
        remote: IdentityRef,
        sender: RpcSender,
        mut stream: RpcStream,
        cancel: CancellationToken,
    ) -> NodeResult<()> {
        let _registered = self.inner.tracker.open(remote)?;
        let session_cancel = cancel.child_token();
        let _stop_streamers = session_cancel.clone().drop_guard();

        let mut session = Session {
            inner: self.inner.clone(),
            remote,
            sender: Arc::new(sender),
            streamers: HashMap::new(),
            sent: Notes::default(),
            cancel: session_cancel.clone(),
        };
        debug!(peer = %remote, "EBT session started");

        let mut changes = self.inner.wanted.subscribe();
        let wanted = self.inner.wanted.get()?;
        if let Err(err) = session.send_notes(&wanted).await {
            return Err(terminal_error(&mut stream, err).await);
        }

        let mut refresh = tokio::time::interval(self.inner.wanted.ttl());
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);
        refresh.tick().await;

        loop {
            tokio::select! {
                _ = session_cancel.cancelled() => return Err(NodeError::Cancelled),
                _ = refresh.tick() => {
                    // Recomputing notifies `changes` if the wanted set moved.
                    if let Err(err) = self.inner.wanted.get() {
                        warn!(peer = %remote, error = %err, "Could not refresh wanted feeds");
                    }
                }
                Ok(()) = changes.changed() => {
                    let wanted = changes.borrow_and_update().clone();
                    if let Err(err) = session.send_notes(&wanted).await {
                        return Err(terminal_error(&mut stream, err).await);
                    }
                }
                body = stream.next() => match body {
                    Ok(body) => session.handle_body(body).await?,
                    Err(err) if err.is_remote_end() => {
                        debug!(peer = %remote, "EBT session ended by remote");
                        let _ = session.sender.close().await;
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                },
            }
        }
    }
}

/// When sending failed because the remote already ended the stream, the
/// reason is the terminator waiting on the receiving side.
async fn terminal_error(stream: &mut RpcStream, err: NodeError) -> NodeError {
    if !err.is_remote_end() {
        return err;
    }
    loop {
        match stream.next().await {
            Ok(_) => continue,
            Err(terminal) => return terminal,
        }
    }
}

struct Session {
    inner: Arc<Inner>,
    remote: IdentityRef,
    sender: Arc<RpcSender>,
    /// Feeds we are pushing to the remote
    streamers: HashMap<FeedRef, CancellationToken>,
    /// Last note sent per feed
    sent: Notes,
    cancel: CancellationToken,
}

impl Session {
    /// Send notes for wanted feeds that changed since the last map, and
    /// withdraw feeds that are no longer wanted.
    async fn send_notes(&mut self, wanted: &WantedFeeds) -> NodeResult<()> {
        let mut update = Notes::default();
        for candidate in wanted.candidates() {
            let note = Note::wanting(candidate.state.sequence().unwrap_or(0));
            if self.sent.get(&candidate.feed) != Some(&note) {
                update.insert(candidate.feed, note);
            }
        }
        for (feed, note) in self.sent.iter() {
            if note.replicate && !wanted.is_wanted(feed) {
                update.insert(*feed, Note::NOT_REPLICATING);
            }
        }
        if update.is_empty() && !self.sent.is_empty() {
            return Ok(());
        }

        trace!(peer = %self.remote, count = update.len(), "Sending notes");
        self.sender.send(Body::json(&update)?).await?;
        for (feed, note) in update.iter() {
            self.sent.insert(*feed, *note);
        }
        Ok(())
    }

    async fn handle_body(&mut self, body: Body) -> NodeResult<()> {
        let value: Value = body.parse_json()?;
        let Value::Object(map) = value else {
            return Err(NodeError::Protocol("ebt body must be a JSON object".to_string()));
        };

        if map.contains_key("signature") {
            self.receive_message(&body);
            return Ok(());
        }

        let notes = Notes::parse(&map)?;
        let wanted = self.inner.wanted.get()?;
        for (feed, note) in notes.iter() {
            self.apply_note(*feed, *note, &wanted)?;
        }
        Ok(())
    }

    fn receive_message(&self, body: &Body) {
        let handler = &self.inner.handler;
        let msg = match handler.storage().formats().verify(body.as_bytes()) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(peer = %self.remote, error = %err, "Invalid message on ebt session");
                return;
            }
        };
        let wanted = match self.inner.wanted.get() {
            Ok(wanted) => wanted,
            Err(err) => {
                warn!(peer = %self.remote, error = %err, "Could not load wanted feeds");
                return;
            }
        };
        if !wanted.is_wanted(&msg.feed) {
            trace!(peer = %self.remote, feed = %msg.feed, "Ignoring message of unwanted feed");
            return;
        }
        let (feed, seq) = (msg.feed, msg.sequence);
        if let Err(err) = handler.handle_verified(msg) {
            debug!(peer = %self.remote, feed = %feed, seq, error = %err, "Rejected message on ebt session");
        }
    }

    fn apply_note(&mut self, feed: FeedRef, note: Note, wanted: &WantedFeeds) -> NodeResult<()> {
        if !note.replicate || !note.receive {
            if let Some(streamer) = self.streamers.remove(&feed) {
                trace!(peer = %self.remote, feed = %feed, "Stopping streamer");
                streamer.cancel();
            }
            return Ok(());
        }
        if !wanted.is_wanted(&feed) || self.streamers.contains_key(&feed) {
            return Ok(());
        }

        let handler = &self.inner.handler;
        let mut tail = FeedTail::new(
            handler.storage().clone(),
            handler.broker().clone(),
            feed,
            note.sequence + 1,
            true,
            true,
        )?;
        let token = self.cancel.child_token();
        self.streamers.insert(feed, token.clone());
        let sender = self.sender.clone();
        let remote = self.remote;
        trace!(peer = %remote, feed = %feed, from = note.sequence + 1, "Starting streamer");

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => return,
                    next = tail.next() => next,
                };
                match next {
                    Ok(Some(msg)) => {
                        if sender.send(Body::Json(Bytes::from(msg.raw))).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(err) => {
                        debug!(peer = %remote, feed = %feed, error = %err, "Streamer failed");
                        return;
                    }
                }
            }
        });
        Ok(())
    }
}

/// Serves `ebt.replicate`.
pub struct EbtHandler {
    replicator: EbtReplicator,
}

impl Handler for EbtHandler {
    fn procedure_type(&self) -> ProcedureType {
        ProcedureType::Duplex
    }

    fn handle(&self, ctx: IncomingRequest) -> BoxFuture<'static, NodeResult<()>> {
        let replicator = self.replicator.clone();
        async move {
            let args: EbtArgs = ctx.request.first_arg()?;
            if args.version != EBT_VERSION || args.format != EBT_FORMAT {
                return Err(NodeError::Validation(format!(
                    "unsupported ebt version {} format {}",
                    args.version, args.format
                )));
            }
            let stream = ctx
                .stream
                .ok_or_else(|| NodeError::Protocol("ebt.replicate without a stream".to_string()))?;
            replicator.run(ctx.remote, ctx.sender, stream, ctx.cancel).await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{ClassicFormat, ContactContent};
    use crate::identity::Identity;
    use crate::pubsub::MessageBroker;
    use crate::rpc::test_support::connection_pair;
    use crate::rpc::Router;
    use crate::storage::test_support::create_test_storage;
    use crate::storage::Storage;
    use crate::wanted::WantedFeedsProvider;
    use chrono::Utc;
    use std::time::Duration;

    struct Side {
        identity: Identity,
        storage: Storage,
        replicator: EbtReplicator,
        handler: RawMessageHandler,
        _dir: tempfile::TempDir,
    }

    fn side(identity: Identity) -> Side {
        let (storage, dir) = create_test_storage();
        let broker = MessageBroker::default();
        let provider = WantedFeedsProvider::new(storage.clone(), identity.public(), 3);
        let wanted = Arc::new(WantedFeedsCache::new(provider, Duration::from_millis(50)));
        let handler = RawMessageHandler::new(storage.clone(), broker).with_wanted_cache(wanted.clone());
        Side {
            identity,
            storage,
            replicator: EbtReplicator::new(wanted, handler.clone()),
            handler,
            _dir: dir,
        }
    }

    fn publish_follow(side: &Side, target: IdentityRef) {
        side.storage
            .update(|tx| {
                let mut feed = tx.feeds().load_or_new(&side.identity.public().main_feed())?;
                feed.create_message(
                    ContactContent::follow(target).to_value(),
                    Utc::now(),
                    &side.identity,
                    &ClassicFormat,
                )?;
                tx.feeds().save(&mut feed)?;
                Ok(())
            })
            .unwrap();
    }

    async fn wait_for_sequence(storage: &Storage, feed: FeedRef, sequence: u64) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if storage.view(|tx| tx.feeds().sequence(&feed)).unwrap() == Some(sequence) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("feed did not replicate");
    }

    #[tokio::test]
    async fn test_session_replicates_both_ways() {
        let alice = side(Identity::generate());
        let bob = side(Identity::generate());
        publish_follow(&alice, bob.identity.public());
        publish_follow(&bob, alice.identity.public());

        let mut bob_router = Router::new();
        bob_router.register(EBT_REPLICATE, bob.replicator.handler());
        let (to_bob, _to_alice) = connection_pair(
            Router::new(),
            bob_router,
            alice.identity.public(),
            bob.identity.public(),
        );

        let replicator = alice.replicator.clone();
        let session = tokio::spawn(async move { replicator.replicate(&to_bob).await });

        wait_for_sequence(&alice.storage, bob.identity.public().main_feed(), 1).await;
        wait_for_sequence(&bob.storage, alice.identity.public().main_feed(), 1).await;

        // Live: a new message on alice's feed reaches bob without a new session
        let stored = alice
            .storage
            .update(|tx| {
                let mut feed = tx.feeds().load_or_new(&alice.identity.public().main_feed())?;
                feed.create_message(serde_json::json!({"type": "post"}), Utc::now(), &alice.identity, &ClassicFormat)?;
                tx.feeds().save(&mut feed)
            })
            .unwrap();
        alice.handler.broker().publish(&stored);
        wait_for_sequence(&bob.storage, alice.identity.public().main_feed(), 2).await;

        assert!(alice.replicator.tracker().is_running(&bob.identity.public()));
        session.abort();
    }

    #[tokio::test]
    async fn test_missing_procedure_is_reported() {
        let alice = side(Identity::generate());
        let (to_bob, _to_alice) = connection_pair(
            Router::new(),
            Router::new(),
            alice.identity.public(),
            Identity::generate().public(),
        );
        let err = alice.replicator.replicate(&to_bob).await.unwrap_err();
        assert!(matches!(err, NodeError::PeerDoesNotSupportEbt), "{}", err);
        assert!(!alice.replicator.tracker().is_running(&to_bob.remote()));
    }

    #[tokio::test]
    async fn test_rejects_unknown_format() {
        let bob = side(Identity::generate());
        let mut router = Router::new();
        router.register(EBT_REPLICATE, bob.replicator.handler());
        let (client, _server) = connection_pair(
            Router::new(),
            router,
            Identity::generate().public(),
            bob.identity.public(),
        );
        let (_tx, mut rx) = client
            .duplex(EBT_REPLICATE.into(), serde_json::json!([{"version": 3, "format": "bendybutt-v1"}]))
            .await
            .unwrap();
        assert!(matches!(rx.next().await, Err(NodeError::Remote(_))));
    }
}
