//! Social graph - hop distances from the local identity
//!
//! The graph is rebuilt from stored contact edges on every read. A
//! breadth-first walk starts at the local identity (hops 0) and follows
//! `following` edges outwards until `max_hops` is reached.
//!
//! Blocks made by the local identity remove the target from the graph
//! entirely, even if someone else follows it. Edges that are both following
//! and blocking count as blocks. Blocks made by other identities are not
//! followed and do not hide anyone.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::NodeResult;
use crate::identity::IdentityRef;
use crate::storage::{Adapters, Relation};

/// Default hop horizon.
pub const DEFAULT_MAX_HOPS: u32 = 3;

/// Identities within the hop horizon of the local identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocialGraph {
    local: IdentityRef,
    hops: HashMap<IdentityRef, u32>,
}

impl SocialGraph {
    /// Walk the graph using `contacts_of` to list each identity's edges.
    pub fn build(
        local: IdentityRef,
        max_hops: u32,
        mut contacts_of: impl FnMut(&IdentityRef) -> NodeResult<Vec<(IdentityRef, Relation)>>,
    ) -> NodeResult<Self> {
        let mut hops = HashMap::new();
        hops.insert(local, 0);

        let local_edges = contacts_of(&local)?;
        let blocked: HashSet<IdentityRef> = local_edges
            .iter()
            .filter(|(_, rel)| rel.blocking)
            .map(|(target, _)| *target)
            .collect();

        let mut queue = VecDeque::new();
        queue.push_back((local, 0u32, Some(local_edges)));

        while let Some((node, distance, edges)) = queue.pop_front() {
            if distance >= max_hops {
                continue;
            }
            let edges = match edges {
                Some(edges) => edges,
                None => contacts_of(&node)?,
            };
            for (target, relation) in edges {
                if !relation.following || relation.blocking || blocked.contains(&target) {
                    continue;
                }
                if hops.contains_key(&target) {
                    continue;
                }
                hops.insert(target, distance + 1);
                queue.push_back((target, distance + 1, None));
            }
        }

        Ok(Self { local, hops })
    }

    /// Build from the graph table inside an open transaction.
    pub fn load(tx: &Adapters<'_>, local: IdentityRef, max_hops: u32) -> NodeResult<Self> {
        let graph = tx.graph();
        Self::build(local, max_hops, |id| graph.contacts_of(id))
    }

    pub fn local(&self) -> IdentityRef {
        self.local
    }

    /// Hop distance of `id`, `None` if outside the horizon or blocked.
    pub fn hops(&self, id: &IdentityRef) -> Option<u32> {
        self.hops.get(id).copied()
    }

    pub fn has_contact(&self, id: &IdentityRef) -> bool {
        self.hops.contains_key(id)
    }

    /// Every identity in the graph with its hop distance, nearest first.
    pub fn contacts(&self) -> Vec<(IdentityRef, u32)> {
        let mut contacts: Vec<_> = self.hops.iter().map(|(id, hops)| (*id, *hops)).collect();
        contacts.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        contacts
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }
}
