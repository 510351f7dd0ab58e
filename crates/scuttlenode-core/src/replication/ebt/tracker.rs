//! At most one EBT session per peer

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{NodeError, NodeResult};
use crate::identity::IdentityRef;

#[derive(Default)]
struct Sessions {
    running: HashMap<IdentityRef, (u64, CancellationToken)>,
    next_id: u64,
}

/// Tracks running EBT sessions by remote identity.
#[derive(Clone)]
pub struct SessionTracker {
    sessions: Arc<Mutex<Sessions>>,
    opened: watch::Sender<u64>,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        let (opened, _) = watch::channel(0);
        Self {
            sessions: Arc::new(Mutex::new(Sessions::default())),
            opened,
        }
    }

    /// Register a session with `peer`. Fails if one is already running.
    pub fn open(&self, peer: IdentityRef) -> NodeResult<SessionGuard> {
        let mut sessions = self.sessions.lock();
        if sessions.running.contains_key(&peer) {
            return Err(NodeError::Protocol(format!(
                "an ebt session with {} is already running",
                peer
            )));
        }
        sessions.next_id += 1;
        let id = sessions.next_id;
        let done = CancellationToken::new();
        sessions.running.insert(peer, (id, done.clone()));
        drop(sessions);

        self.opened.send_modify(|count| *count += 1);
        Ok(SessionGuard {
            sessions: self.sessions.clone(),
            peer,
            id,
            done,
        })
    }

    pub fn is_running(&self, peer: &IdentityRef) -> bool {
        self.sessions.lock().running.contains_key(peer)
    }

    /// Wait up to `wait` for a session with `peer` to start. Returns a token
    /// that is cancelled when that session ends.
    pub async fn wait_for_session(&self, peer: &IdentityRef, wait: Duration) -> Option<CancellationToken> {
        let mut opened = self.opened.subscribe();
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some((_, done)) = self.sessions.lock().running.get(peer) {
                return Some(done.clone());
            }
            match tokio::time::timeout_at(deadline, opened.changed()).await {
                Ok(Ok(())) => continue,
                _ => return None,
            }
        }
    }
}

/// Keeps a session registered until dropped.
pub struct SessionGuard {
    sessions: Arc<Mutex<Sessions>>,
    peer: IdentityRef,
    id: u64,
    done: CancellationToken,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut sessions = self.sessions.lock();
        if sessions.running.get(&self.peer).is_some_and(|(id, _)| *id == self.id) {
            sessions.running.remove(&self.peer);
        }
        self.done.cancel();
    }
}
