//! `createHistoryStream` replication
//!
//! The client side pulls one feed per task, at most `limit` messages at a
//! time, with up to `workers` tasks in flight per peer. The server side
//! answers from storage and, for `live` requests, keeps forwarding newly
//! accepted messages.

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, trace};

use super::manager::{ReplicateFeedTask, ReplicationManager, TaskResult};
use super::raw_message;
use super::tail::FeedTail;
use crate::error::{NodeError, NodeResult};
use crate::feed::Message;
use crate::identity::FeedRef;
use crate::ingest::RawMessageHandler;
use crate::pubsub::MessageBroker;
use crate::rpc::{Body, Connection, Handler, IncomingRequest, ProcedureName, ProcedureType};
use crate::storage::Storage;
use crate::wanted::FeedState;

pub const CREATE_HISTORY_STREAM: &str = "createHistoryStream";

fn yes() -> bool {
    true
}

/// Arguments of `createHistoryStream`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateHistoryStreamArgs {
    pub id: FeedRef,
    /// First sequence to send; absent or 0 means from the start
    #[serde(default, alias = "seq", skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Negative or absent means unlimited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default)]
    pub live: bool,
    #[serde(default = "yes")]
    pub old: bool,
    /// Wrap each message in a `{key, value, timestamp}` envelope
    #[serde(default = "yes")]
    pub keys: bool,
}

impl CreateHistoryStreamArgs {
    /// Arguments of an outgoing pull of stored messages.
    pub fn pull(id: FeedRef, state: FeedState, limit: u64) -> Self {
        Self {
            id,
            sequence: state.sequence().map(|s| s + 1),
            limit: Some(limit as i64),
            live: false,
            old: true,
            keys: false,
        }
    }

    fn limit(&self) -> Option<u64> {
        self.limit.and_then(|l| u64::try_from(l).ok())
    }
}

/// Pulls feeds from one peer with `createHistoryStream`.
#[derive(Clone)]
pub struct ChsReplicator {
    manager: ReplicationManager,
    handler: RawMessageHandler,
}

impl ChsReplicator {
    pub fn new(manager: ReplicationManager, handler: RawMessageHandler) -> Self {
        Self { manager, handler }
    }

    /// Replicate until the connection closes.
    pub async fn replicate(&self, conn: &Connection, self_only: bool) -> NodeResult<()> {
        let cancel = conn.cancellation_token();
        let tasks = self
            .manager
            .feeds_to_replicate(conn.remote(), self_only, cancel.child_token());
        let tasks = futures::stream::unfold(tasks, |mut tasks| async move {
            tasks.next().await.map(|task| (task, tasks))
        });
        let workers = self.manager.config().workers;

        let work = tasks.for_each_concurrent(workers, |task| async move {
            let result = self.replicate_feed(conn, &task).await;
            task.complete(result);
        });

        tokio::select! {
            _ = work => Ok(()),
            _ = cancel.cancelled() => Err(NodeError::Cancelled),
        }
    }

    async fn replicate_feed(&self, conn: &Connection, task: &ReplicateFeedTask) -> TaskResult {
        let feed = task.feed();
        let state = match self.handler.storage().view(|tx| tx.feeds().sequence(&feed)) {
            Ok(sequence) => FeedState::from(sequence),
            Err(err) => {
                debug!(feed = %feed, error = %err, "Could not read feed state");
                return TaskResult::Failed;
            }
        };
        let limit = self.manager.config().chs_limit;
        let args = CreateHistoryStreamArgs::pull(feed, state, limit);

        let mut stream = match conn.source(ProcedureName::from(CREATE_HISTORY_STREAM), json!([args])).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(feed = %feed, error = %err, "Could not open history stream");
                return TaskResult::Failed;
            }
        };

        let mut received = 0u64;
        loop {
            match stream.next().await {
                Ok(body) => {
                    received += 1;
                    if let Err(err) = self.ingest(feed, &body) {
                        debug!(peer = %conn.remote(), feed = %feed, error = %err, "Rejected replicated message");
                        return TaskResult::Failed;
                    }
                }
                Err(err) if err.is_remote_end() => {
                    trace!(feed = %feed, received, "History stream ended");
                    return if received >= limit {
                        TaskResult::HasMore
                    } else {
                        TaskResult::NoMore
                    };
                }
                Err(err) => {
                    debug!(peer = %conn.remote(), feed = %feed, error = %err, "History stream failed");
                    return TaskResult::Failed;
                }
            }
        }
    }

    fn ingest(&self, feed: FeedRef, body: &Body) -> NodeResult<()> {
        let raw = raw_message(body)?;
        let msg = self.handler.storage().formats().verify(&raw)?;
        if msg.feed != feed {
            return Err(NodeError::Protocol(format!(
                "asked for {} but got a message of {}",
                feed, msg.feed
            )));
        }
        self.handler.handle_verified(msg)?;
        Ok(())
    }
}

/// Messages of one feed as selected by [`CreateHistoryStreamArgs`].
///
/// Banned feeds and a limit of 0 yield nothing.
pub struct HistoryStream {
    tail: Option<FeedTail>,
    remaining: Option<u64>,
}

impl HistoryStream {
    pub fn open(storage: Storage, broker: MessageBroker, args: &CreateHistoryStreamArgs) -> NodeResult<Self> {
        let remaining = args.limit();
        if remaining == Some(0) || storage.view(|tx| tx.ban_list().contains_feed(&args.id))? {
            return Ok(Self { tail: None, remaining });
        }
        let tail = FeedTail::new(
            storage,
            broker,
            args.id,
            args.sequence.unwrap_or(1),
            args.old,
            args.live,
        )?;
        Ok(Self {
            tail: Some(tail),
            remaining,
        })
    }

    /// Next message, or `None` once the stream is done. Live streams only
    /// finish when the limit is reached.
    pub async fn next(&mut self) -> NodeResult<Option<Message>> {
        let Some(tail) = &mut self.tail else {
            return Ok(None);
        };
        if self.remaining == Some(0) {
            return Ok(None);
        }
        let next = tail.next().await?;
        if next.is_some() {
            if let Some(remaining) = &mut self.remaining {
                *remaining -= 1;
            }
        }
        Ok(next)
    }
}

/// Serves `createHistoryStream`.
pub struct CreateHistoryStreamHandler {
    storage: Storage,
    broker: MessageBroker,
}

impl CreateHistoryStreamHandler {
    pub fn new(storage: Storage, broker: MessageBroker) -> Self {
        Self { storage, broker }
    }
}

impl Handler for CreateHistoryStreamHandler {
    fn procedure_type(&self) -> ProcedureType {
        ProcedureType::Source
    }

    fn handle(&self, ctx: IncomingRequest) -> BoxFuture<'static, NodeResult<()>> {
        let storage = self.storage.clone();
        let broker = self.broker.clone();
        async move {
            let args: CreateHistoryStreamArgs = ctx.request.first_arg()?;
            debug!(peer = %ctx.remote, feed = %args.id, ?args.sequence, args.live, "Serving history stream");

            let mut history = HistoryStream::open(storage, broker, &args)?;
            loop {
                let next = tokio::select! {
                    _ = ctx.sender.closed() => return Ok(()),
                    next = history.next() => next?,
                };
                let Some(msg) = next else {
                    return Ok(());
                };
                let body = if args.keys {
                    Body::json(&msg.to_keyed_value(msg.timestamp as i64)?)?
                } else {
                    Body::Json(Bytes::from(msg.raw))
                };
                ctx.sender.send(body).await?;
            }
        }
        .boxed()
    }
}
