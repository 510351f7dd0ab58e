//! The node: storage, identity, replication and peers behind one handle
//!
//! ```ignore
//! use scuttlenode_core::Node;
//!
//! let node = Node::open("~/.scuttlenode").await?;
//! node.publish(br#"{"type":"post","text":"hello"}"#)?;
//! node.follow(&friend)?;
//! node.listen(None).await?;
//! node.connect(friend, "10.0.0.7:8008".parse()?).await?;
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{NodeConfig, DATABASE_FILE_NAME};
use crate::error::{NodeError, NodeResult};
use crate::feed::{ContactContent, Formats, Message, UnsignedMessage};
use crate::identity::{BanHash, FeedRef, Identity, IdentityRef, MessageRef};
use crate::ingest::RawMessageHandler;
use crate::network::{PeerInfo, PeerManager};
use crate::pubsub::MessageBroker;
use crate::replication::{
    ChsReplicator, CreateHistoryStreamArgs, CreateHistoryStreamHandler, EbtReplicator, HistoryStream, Negotiator,
    ReplicationManager, CREATE_HISTORY_STREAM, EBT_REPLICATE,
};
use crate::rpc::Router;
use crate::storage::{ReceiveLogEntry, Storage, WantListEntry};
use crate::wanted::{WantedFeedsCache, WantedFeedsProvider};

/// Snapshot returned by [`Node::status`].
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub identity: IdentityRef,
    pub listen_address: Option<SocketAddr>,
    pub peers: Vec<PeerInfo>,
    pub active_tasks: usize,
    pub receive_log_len: u64,
    pub wanted_feeds: usize,
}

/// A running peer node.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct Node {
    data_dir: PathBuf,
    config: NodeConfig,
    identity: Identity,
    storage: Storage,
    broker: MessageBroker,
    wanted: Arc<WantedFeedsCache>,
    manager: ReplicationManager,
    peers: PeerManager,
    listen_address: Mutex<Option<SocketAddr>>,
}

impl Node {
    /// Open the node in `data_dir` with the configuration found there.
    pub async fn open(data_dir: impl AsRef<Path>) -> NodeResult<Self> {
        let config = NodeConfig::load(data_dir.as_ref())?;
        Self::with_config(data_dir, config).await
    }

    /// Open the node in `data_dir` with an explicit configuration.
    pub async fn with_config(data_dir: impl AsRef<Path>, config: NodeConfig) -> NodeResult<Self> {
        config.validate()?;
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let storage = Storage::new(data_dir.join(DATABASE_FILE_NAME), Formats::default())?;
        let identity = storage.update(|tx| {
            let repo = tx.identity();
            match repo.load()? {
                Some(identity) => Ok(identity),
                None => {
                    let identity = Identity::generate();
                    repo.save(&identity)?;
                    info!(identity = %identity.public(), "Generated new identity");
                    Ok(identity)
                }
            }
        })?;
        let local = identity.public();

        let broker = MessageBroker::default();
        let wanted = Arc::new(WantedFeedsCache::new(
            WantedFeedsProvider::new(storage.clone(), local, config.hops),
            config.wanted_feeds_cache_ttl(),
        ));
        let handler = RawMessageHandler::new(storage.clone(), broker.clone()).with_wanted_cache(wanted.clone());
        let manager = ReplicationManager::new(wanted.clone(), config.replication.clone());
        let chs = ChsReplicator::new(manager.clone(), handler.clone());

        let mut router = Router::new();
        router.register(
            CREATE_HISTORY_STREAM,
            CreateHistoryStreamHandler::new(storage.clone(), broker.clone()),
        );
        let ebt = if config.enable_ebt {
            let ebt = EbtReplicator::new(wanted.clone(), handler);
            router.register(EBT_REPLICATE, ebt.handler());
            Some(ebt)
        } else {
            None
        };

        let negotiator = Negotiator::new(ebt, chs, config.ebt_wait_for_session());
        let peers = PeerManager::new(identity.clone(), config.network_key()?, router, negotiator);

        info!(identity = %local, data_dir = %data_dir.display(), ebt = config.enable_ebt, "Node opened");
        Ok(Self {
            data_dir,
            config,
            identity,
            storage,
            broker,
            wanted,
            manager,
            peers,
            listen_address: Mutex::new(None),
        })
    }

    pub fn identity(&self) -> IdentityRef {
        self.identity.public()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn broker(&self) -> &MessageBroker {
        &self.broker
    }

    /// Sign `content` (JSON bytes) as the next message of the local feed.
    pub fn publish(&self, content: &[u8]) -> NodeResult<MessageRef> {
        let content = UnsignedMessage::parse_content(content)?;
        self.publish_value(content)
    }

    /// [`Node::publish`] for already parsed content.
    pub fn publish_value(&self, content: Value) -> NodeResult<MessageRef> {
        let feed_ref = self.identity.public().main_feed();
        let format = self.storage.formats().default_format().clone();
        let (id, stored) = self.storage.update(|tx| {
            let feeds = tx.feeds();
            let mut feed = feeds.load_or_new(&feed_ref)?;
            let id = feed.create_message(content, Utc::now(), &self.identity, format.as_ref())?;
            let stored = feeds.save(&mut feed)?;
            Ok((id, stored))
        })?;

        if stored.iter().any(|msg| msg.content.as_contact().is_some()) {
            self.wanted.invalidate();
        }
        self.broker.publish(&stored);
        debug!(id = %id, "Published message");
        Ok(id)
    }

    /// Publish a follow of `target`.
    pub fn follow(&self, target: &IdentityRef) -> NodeResult<MessageRef> {
        if *target == self.identity.public() {
            return Err(NodeError::Validation("cannot follow yourself".to_string()));
        }
        self.publish_value(ContactContent::follow(*target).to_value())
    }

    /// Ban the feed hashing to `hash`. A stored feed with that hash is
    /// deleted; its receive log sequences stay reserved.
    pub fn add_to_ban_list(&self, hash: BanHash) -> NodeResult<()> {
        if hash == self.identity.public().main_feed().ban_hash() {
            return Err(NodeError::Validation("cannot ban the local feed".to_string()));
        }
        let deleted = self.storage.update(|tx| {
            tx.ban_list().add(&hash)?;
            let feeds = tx.feeds();
            let mut deleted = 0;
            for (feed, _) in feeds.list_feeds()? {
                if feed.ban_hash() == hash {
                    deleted += feeds.delete_feed(&feed)?;
                }
            }
            Ok(deleted)
        })?;
        info!(hash = %hash.to_hex(), deleted, "Banned feed");
        self.wanted.invalidate();
        Ok(())
    }

    /// Lift a ban. Returns false if `hash` was not banned.
    pub fn remove_from_ban_list(&self, hash: BanHash) -> NodeResult<bool> {
        let removed = self.storage.update(|tx| tx.ban_list().remove(&hash))?;
        if removed {
            self.wanted.invalidate();
        }
        Ok(removed)
    }

    pub fn ban_list(&self) -> NodeResult<Vec<BanHash>> {
        self.storage.view(|tx| tx.ban_list().list())
    }

    /// Replicate `feed` until `until` even if it is outside the graph.
    pub fn add_to_want_list(&self, feed: FeedRef, until: DateTime<Utc>) -> NodeResult<()> {
        self.storage.update(|tx| tx.want_list().add(&feed, until))?;
        self.wanted.invalidate();
        Ok(())
    }

    pub fn remove_from_want_list(&self, feed: FeedRef) -> NodeResult<()> {
        self.storage.update(|tx| tx.want_list().remove(&feed))?;
        self.wanted.invalidate();
        Ok(())
    }

    /// Unexpired want list entries.
    pub fn want_list(&self) -> NodeResult<Vec<WantListEntry>> {
        self.storage.view(|tx| tx.want_list().list(Utc::now()))
    }

    /// Accept peers on `addr`, or on the configured address.
    pub async fn listen(&self, addr: Option<SocketAddr>) -> NodeResult<SocketAddr> {
        let bound = self.peers.listen(addr.unwrap_or(self.config.listen_address)).await?;
        *self.listen_address.lock() = Some(bound);
        Ok(bound)
    }

    /// Dial a peer and start replicating with it.
    pub async fn connect(&self, remote: IdentityRef, addr: SocketAddr) -> NodeResult<()> {
        if remote == self.identity.public() {
            return Err(NodeError::Validation("cannot connect to yourself".to_string()));
        }
        self.peers.connect(remote, addr).await?;
        Ok(())
    }

    pub fn disconnect(&self, remote: &IdentityRef) -> usize {
        self.peers.disconnect(remote)
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.peers()
    }

    /// Up to `limit` receive log entries starting at sequence `start`.
    pub fn receive_log(&self, start: u64, limit: usize) -> NodeResult<Vec<ReceiveLogEntry>> {
        self.storage.view(|tx| tx.receive_log().list(start, limit))
    }

    /// Local messages whose receive log sequence is above `after`, oldest
    /// first. All local messages when `after` is `None`.
    pub fn published_log(&self, after: Option<u64>) -> NodeResult<Vec<ReceiveLogEntry>> {
        let feed = self.identity.public().main_feed();
        self.storage.view(|tx| {
            let receive_log = tx.receive_log();
            let mut entries = Vec::new();
            tx.feeds().walk_back(&feed, |message| {
                let Some(sequence) = receive_log.get_sequences(&message.id)?.into_iter().max() else {
                    return Err(NodeError::NotFound(format!(
                        "message {} is not in the receive log",
                        message.id
                    )));
                };
                if after.is_some_and(|after| sequence <= after) {
                    return Ok(false);
                }
                entries.push(ReceiveLogEntry { sequence, message });
                Ok(true)
            })?;
            entries.reverse();
            Ok(entries)
        })
    }

    /// Read a feed the way a peer's `createHistoryStream` request would.
    pub fn create_history_stream(&self, args: &CreateHistoryStreamArgs) -> NodeResult<HistoryStream> {
        HistoryStream::open(self.storage.clone(), self.broker.clone(), args)
    }

    /// A stored message by id.
    pub fn get_message(&self, id: &MessageRef) -> NodeResult<Message> {
        self.storage
            .view(|tx| tx.feeds().get_message_by_id(id))?
            .ok_or_else(|| NodeError::NotFound(format!("message {}", id)))
    }

    pub fn status(&self) -> NodeResult<NodeStatus> {
        let receive_log_len = self.storage.view(|tx| tx.receive_log().next_sequence())?;
        Ok(NodeStatus {
            identity: self.identity.public(),
            listen_address: *self.listen_address.lock(),
            peers: self.peers.peers(),
            active_tasks: self.manager.active_tasks(),
            receive_log_len,
            wanted_feeds: self.wanted.get()?.len(),
        })
    }

    /// Stop listening and close every peer connection.
    pub fn shutdown(&self) {
        info!("Shutting down node");
        self.peers.shutdown();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.peers.shutdown();
    }
}
