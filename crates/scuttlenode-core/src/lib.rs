//! Scuttlenode Core Library
//!
//! A Secure Scuttlebutt peer: signed append-only feeds, a follow graph that
//! decides which feeds to keep, and replication with peers over encrypted
//! TCP connections.
//!
//! ## Overview
//!
//! Each identity owns one feed. Messages are verified and appended in order,
//! stored in a single redb database and numbered in a local receive log.
//! Peers are reached through the secret handshake and boxed stream, then
//! speak the multiplexed RPC protocol. Feeds are exchanged with
//! `ebt.replicate` where both sides support it and with
//! `createHistoryStream` otherwise.
//!
//! ## Quick Start
//!
//! ```ignore
//! use scuttlenode_core::Node;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = Node::open("/tmp/scuttlenode").await?;
//!
//!     node.publish(br#"{"type":"post","text":"hello"}"#)?;
//!
//!     for entry in node.receive_log(0, 100)? {
//!         println!("{} {}", entry.sequence, entry.message.id);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod boxstream;
pub mod config;
pub mod error;
pub mod feed;
pub mod graph;
pub mod identity;
pub mod ingest;
pub mod network;
pub mod node;
pub mod pubsub;
pub mod replication;
pub mod rpc;
pub mod storage;
pub mod wanted;

// Re-exports
pub use config::{NodeConfig, ReplicationConfig};
pub use error::{NodeError, NodeResult};
pub use feed::{Content, Feed, Message};
pub use identity::{BanHash, BlobRef, FeedRef, Identity, IdentityRef, MessageRef};
pub use network::{PeerInfo, PeerManager};
pub use node::{Node, NodeStatus};
pub use replication::{CreateHistoryStreamArgs, Direction, HistoryStream};
pub use storage::{ReceiveLogEntry, Storage, WantListEntry};
