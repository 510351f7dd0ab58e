//! Contact edges derived from `contact` messages

use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use super::Tx;
use crate::error::NodeResult;
use crate::feed::{ContactAction, ContactToSave};
use crate::identity::IdentityRef;

/// Contact edges (key: (author ref, target ref), value: JSON [`Relation`])
pub(crate) const GRAPH_TABLE: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("graph");

/// What an author currently says about a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub following: bool,
    pub blocking: bool,
}

impl Relation {
    fn apply(&mut self, action: ContactAction) {
        match action {
            ContactAction::Follow => self.following = true,
            ContactAction::Unfollow => self.following = false,
            ContactAction::Block => self.blocking = true,
            ContactAction::Unblock => self.blocking = false,
        }
    }

    fn is_empty(&self) -> bool {
        !self.following && !self.blocking
    }
}

pub struct GraphRepository<'a> {
    tx: Tx<'a>,
}

impl<'a> GraphRepository<'a> {
    pub(crate) fn new(tx: Tx<'a>) -> Self {
        Self { tx }
    }

    /// Current relation from `author` to `target`.
    pub fn relation(&self, author: &IdentityRef, target: &IdentityRef) -> NodeResult<Relation> {
        let (a, t) = (author.to_string(), target.to_string());
        let raw = with_table!(self.tx, GRAPH_TABLE, |graph| {
            graph.get((a.as_str(), t.as_str()))?.map(|v| v.value().to_vec())
        });
        match raw {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(Relation::default()),
        }
    }

    /// Apply a contact message. Later messages override earlier ones.
    pub fn apply(&self, contact: &ContactToSave) -> NodeResult<()> {
        let mut relation = self.relation(&contact.author, &contact.target)?;
        for action in &contact.actions {
            relation.apply(*action);
        }

        let txn = self.tx.write()?;
        let (a, t) = (contact.author.to_string(), contact.target.to_string());
        let mut graph = txn.open_table(GRAPH_TABLE)?;
        if relation.is_empty() {
            graph.remove((a.as_str(), t.as_str()))?;
        } else {
            let bytes = serde_json::to_vec(&relation)?;
            graph.insert((a.as_str(), t.as_str()), bytes.as_slice())?;
        }
        Ok(())
    }

    /// Every non-empty outgoing edge of `author`.
    pub fn contacts_of(&self, author: &IdentityRef) -> NodeResult<Vec<(IdentityRef, Relation)>> {
        let a = author.to_string();
        let raws: Vec<(String, Vec<u8>)> = with_table!(self.tx, GRAPH_TABLE, |graph| {
            let mut raws = Vec::new();
            for entry in graph.range((a.as_str(), "")..)? {
                let (key, value) = entry?;
                let (from, to) = key.value();
                if from != a {
                    break;
                }
                raws.push((to.to_string(), value.value().to_vec()));
            }
            raws
        });
        raws.into_iter()
            .map(|(target, raw)| Ok((target.parse()?, serde_json::from_slice(&raw)?)))
            .collect()
    }

    /// Forget everything `author` ever said about anyone.
    pub(crate) fn remove_author(&self, author: &IdentityRef) -> NodeResult<()> {
        let targets = self.contacts_of(author)?;
        let txn = self.tx.write()?;
        let a = author.to_string();
        let mut graph = txn.open_table(GRAPH_TABLE)?;
        for (target, _) in targets {
            graph.remove((a.as_str(), target.to_string().as_str()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::create_test_storage;
    use super::*;
    use crate::identity::Identity;

    fn contact(author: IdentityRef, target: IdentityRef, actions: Vec<ContactAction>) -> ContactToSave {
        ContactToSave {
            author,
            target,
            actions,
        }
    }

    #[test]
    fn test_follow_then_unfollow() {
        let (storage, _temp) = create_test_storage();
        let alice = Identity::generate().public();
        let bob = Identity::generate().public();

        storage
            .update(|tx| tx.graph().apply(&contact(alice, bob, vec![ContactAction::Follow])))
            .unwrap();
        let rel = storage.view(|tx| tx.graph().relation(&alice, &bob)).unwrap();
        assert!(rel.following);
        assert!(!rel.blocking);

        storage
            .update(|tx| tx.graph().apply(&contact(alice, bob, vec![ContactAction::Unfollow])))
            .unwrap();
        assert!(storage.view(|tx| tx.graph().contacts_of(&alice)).unwrap().is_empty());
    }

    #[test]
    fn test_contacts_are_scoped_to_author() {
        let (storage, _temp) = create_test_storage();
        let alice = Identity::generate().public();
        let bob = Identity::generate().public();
        let carol = Identity::generate().public();

        storage
            .update(|tx| {
                tx.graph().apply(&contact(alice, bob, vec![ContactAction::Follow]))?;
                tx.graph().apply(&contact(alice, carol, vec![ContactAction::Block]))?;
                tx.graph().apply(&contact(bob, carol, vec![ContactAction::Follow]))
            })
            .unwrap();

        let mut contacts = storage.view(|tx| tx.graph().contacts_of(&alice)).unwrap();
        contacts.sort_by_key(|(target, _)| *target);
        assert_eq!(contacts.len(), 2);
        assert!(contacts.iter().any(|(t, r)| *t == carol && r.blocking && !r.following));

        storage.update(|tx| tx.graph().remove_author(&alice)).unwrap();
        assert!(storage.view(|tx| tx.graph().contacts_of(&alice)).unwrap().is_empty());
        assert_eq!(storage.view(|tx| tx.graph().contacts_of(&bob)).unwrap().len(), 1);
    }
}
