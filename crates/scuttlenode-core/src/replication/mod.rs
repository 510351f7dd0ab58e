//! Replication with peers
//!
//! ```text
//!                 ┌────────────┐
//!   connection ──▶│ Negotiator │
//!                 └─────┬──────┘
//!          ebt.replicate│  method not supported
//!            ┌──────────┴──────────┐
//!            ▼                     ▼
//!     ┌─────────────┐      ┌───────────────┐      ┌────────────────────┐
//!     │ EBT session │      │ ChsReplicator │◀────▶│ ReplicationManager │
//!     └─────────────┘      └───────────────┘      └────────────────────┘
//! ```
//!
//! Received messages go through [`RawMessageHandler`](crate::ingest::RawMessageHandler)
//! either way. The server halves of both procedures are [`Handler`](crate::rpc::Handler)s
//! registered on the node's router.

pub mod chs;
pub mod ebt;
mod manager;
mod negotiator;
mod tail;

pub use chs::{ChsReplicator, CreateHistoryStreamArgs, CreateHistoryStreamHandler, HistoryStream, CREATE_HISTORY_STREAM};
pub use ebt::{EbtHandler, EbtReplicator, Note, Notes, SessionTracker, EBT_REPLICATE};
pub use manager::{ReplicateFeedTask, ReplicationManager, TaskResult, TaskStream};
pub use negotiator::{Direction, Negotiator};

use serde_json::Value;

use crate::error::NodeResult;
use crate::rpc::Body;

/// Raw message bytes of a replicated body, unwrapping a
/// `{key, value, timestamp}` envelope if the peer sent one.
pub(crate) fn raw_message(body: &Body) -> NodeResult<Vec<u8>> {
    let bytes = body.as_bytes();
    let value: Value = serde_json::from_slice(bytes)?;
    match (value.get("key"), value.get("value")) {
        (Some(_), Some(inner)) => Ok(serde_json::to_vec(inner)?),
        _ => Ok(bytes.to_vec()),
    }
}
