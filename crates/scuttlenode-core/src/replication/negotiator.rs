//! Choosing how to replicate with a peer

use std::time::Duration;

use tracing::{debug, info};

use super::chs::ChsReplicator;
use super::ebt::EbtReplicator;
use crate::error::{NodeError, NodeResult};
use crate::rpc::Connection;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// Runs EBT with a peer when possible and CHS otherwise.
///
/// The side that dialed opens the EBT session. The accepting side waits a
/// while for one to arrive and falls back to CHS if it does not. Pulling
/// our own feed with CHS runs alongside either way.
#[derive(Clone)]
pub struct Negotiator {
    ebt: Option<EbtReplicator>,
    chs: ChsReplicator,
    wait_for_session: Duration,
}

impl Negotiator {
    /// `ebt` is `None` when EBT is disabled.
    pub fn new(ebt: Option<EbtReplicator>, chs: ChsReplicator, wait_for_session: Duration) -> Self {
        Self {
            ebt,
            chs,
            wait_for_session,
        }
    }

    /// Replicate with the peer on `conn` until the main replicator stops.
    pub async fn replicate(&self, conn: &Connection, direction: Direction) -> NodeResult<()> {
        let main = self.replicate_main(conn, direction);
        let own_feed = self.chs.replicate(conn, true);
        tokio::pin!(main);
        tokio::select! {
            result = &mut main => result,
            // Only returns once the connection is gone
            _ = own_feed => main.await,
        }
    }

    async fn replicate_main(&self, conn: &Connection, direction: Direction) -> NodeResult<()> {
        let Some(ebt) = &self.ebt else {
            return self.chs.replicate(conn, false).await;
        };

        match direction {
            Direction::Outbound => match ebt.replicate(conn).await {
                Err(NodeError::PeerDoesNotSupportEbt) => {
                    info!(peer = %conn.remote(), "Peer does not support EBT, using createHistoryStream");
                    self.chs.replicate(conn, false).await
                }
                other => other,
            },
            Direction::Inbound => {
                match ebt.tracker().wait_for_session(&conn.remote(), self.wait_for_session).await {
                    Some(done) => {
                        debug!(peer = %conn.remote(), "Peer opened an EBT session");
                        tokio::select! {
                            _ = done.cancelled() => Ok(()),
                            _ = conn.closed() => Err(NodeError::Cancelled),
                        }
                    }
                    None => {
                        info!(peer = %conn.remote(), "No EBT session from peer, using createHistoryStream");
                        self.chs.replicate(conn, false).await
                    }
                }
            }
        }
    }
}
