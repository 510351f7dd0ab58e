//! Peer connections over TCP
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  PeerManager                                                │
//! │  ├── accept loop (listen)     ─┐                            │
//! │  ├── dial (connect)           ─┴─▶ handshake ─▶ install     │
//! │  │                                              │           │
//! │  │        Connection + Negotiator task per peer ◀┘          │
//! │  └── peers: id -> PeerInfo                                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Several connections to the same identity are allowed; the replication
//! manager keeps them from pulling the same feed at once.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::boxstream::{box_stream, client_handshake, server_handshake, NetworkKey};
use crate::error::{NodeError, NodeResult};
use crate::identity::{Identity, IdentityRef};
use crate::replication::{Direction, Negotiator};
use crate::rpc::{Connection, Router};

/// Time allowed for the secret handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A connected peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub identity: IdentityRef,
    pub address: SocketAddr,
    pub direction: Direction,
    pub connected_at: DateTime<Utc>,
}

struct Inner {
    identity: Identity,
    network_key: NetworkKey,
    router: Arc<Router>,
    negotiator: Negotiator,
    peers: Mutex<HashMap<u64, (PeerInfo, Connection)>>,
    next_peer: AtomicU64,
    cancel: CancellationToken,
}

/// Accepts and dials peers and keeps track of the live ones.
#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<Inner>,
}

impl PeerManager {
    pub fn new(identity: Identity, network_key: NetworkKey, router: Router, negotiator: Negotiator) -> Self {
        Self {
            inner: Arc::new(Inner {
                identity,
                network_key,
                router: Arc::new(router),
                negotiator,
                peers: Mutex::new(HashMap::new()),
                next_peer: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Bind `addr` and accept peers in the background. Returns the bound
    /// address (useful with port 0).
    pub async fn listen(&self, addr: SocketAddr) -> NodeResult<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(address = %local, "Listening for peers");

        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = manager.inner.cancel.cancelled() => return,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, remote_addr)) => {
                        let manager = manager.clone();
                        tokio::spawn(async move {
                            if let Err(err) = manager.accept(stream, remote_addr).await {
                                debug!(address = %remote_addr, error = %err, "Inbound handshake failed");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        Ok(local)
    }

    async fn accept(&self, mut stream: TcpStream, addr: SocketAddr) -> NodeResult<()> {
        let outcome = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            server_handshake(&mut stream, &self.inner.network_key, &self.inner.identity),
        )
        .await
        .map_err(|_| NodeError::Protocol("handshake timed out".to_string()))??;
        let remote = outcome.remote;
        let (reader, writer) = box_stream(stream, &outcome);
        self.install(reader, writer, remote, addr, Direction::Inbound);
        Ok(())
    }

    /// Dial `remote` at `addr` and start replicating with it.
    pub async fn connect(&self, remote: IdentityRef, addr: SocketAddr) -> NodeResult<Connection> {
        let mut stream = TcpStream::connect(addr).await?;
        let outcome = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            client_handshake(&mut stream, &self.inner.network_key, &self.inner.identity, &remote),
        )
        .await
        .map_err(|_| NodeError::Protocol("handshake timed out".to_string()))??;
        let (reader, writer) = box_stream(stream, &outcome);
        Ok(self.install(reader, writer, remote, addr, Direction::Outbound))
    }

    fn install<R, W>(
        &self,
        reader: R,
        writer: W,
        remote: IdentityRef,
        addr: SocketAddr,
        direction: Direction,
    ) -> Connection
    where
        R: futures::Stream<Item = NodeResult<crate::boxstream::BoxFrame>> + Send + Unpin + 'static,
        W: futures::Sink<crate::boxstream::BoxFrame, Error = NodeError> + Send + Unpin + 'static,
    {
        let conn = Connection::start(
            reader,
            writer,
            remote,
            self.inner.router.clone(),
            self.inner.cancel.child_token(),
        );
        let id = self.inner.next_peer.fetch_add(1, Ordering::Relaxed);
        let info = PeerInfo {
            identity: remote,
            address: addr,
            direction,
            connected_at: Utc::now(),
        };
        self.inner.peers.lock().insert(id, (info, conn.clone()));
        info!(peer = %remote, address = %addr, %direction, "Peer connected");

        let manager = self.clone();
        let session = conn.clone();
        let span = info_span!("peer", peer = %remote, %direction);
        tokio::spawn(
            async move {
                match manager.inner.negotiator.replicate(&session, direction).await {
                    Ok(()) | Err(NodeError::Cancelled) => {}
                    Err(err) => warn!(error = %err, "Replication stopped"),
                }
                session.close();
                manager.inner.peers.lock().remove(&id);
                info!("Peer disconnected");
            }
            .instrument(span),
        );
        conn
    }

    /// Currently connected peers.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.inner.peers.lock().values().map(|(info, _)| info.clone()).collect();
        peers.sort_by_key(|p| p.connected_at);
        peers
    }

    /// Close every connection to `remote`.
    pub fn disconnect(&self, remote: &IdentityRef) -> usize {
        let peers = self.inner.peers.lock();
        let mut closed = 0;
        for (info, conn) in peers.values() {
            if info.identity == *remote {
                conn.close();
                closed += 1;
            }
        }
        closed
    }

    /// Stop accepting and close all connections.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}
