//! EBT notes
//!
//! Each side of an `ebt.replicate` session tells the other, per feed, how
//! far it got and what it wants:
//!
//! ```text
//! -1                     not replicating this feed
//! seq * 2 + 0            replicating, up to seq, send me more
//! seq * 2 + 1            replicating, up to seq, don't send
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{NodeError, NodeResult};
use crate::identity::FeedRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Note {
    /// The sender replicates the feed at all.
    pub replicate: bool,
    /// The sender wants messages after `sequence`.
    pub receive: bool,
    pub sequence: u64,
}

impl Note {
    pub const NOT_REPLICATING: Note = Note {
        replicate: false,
        receive: false,
        sequence: 0,
    };

    pub fn wanting(sequence: u64) -> Self {
        Self {
            replicate: true,
            receive: true,
            sequence,
        }
    }

    pub fn encode(&self) -> i64 {
        if !self.replicate {
            return -1;
        }
        let flag = if self.receive { 0 } else { 1 };
        (self.sequence as i64) * 2 + flag
    }

    pub fn decode(value: i64) -> Self {
        if value < 0 {
            return Self::NOT_REPLICATING;
        }
        Self {
            replicate: true,
            receive: value & 1 == 0,
            sequence: (value >> 1) as u64,
        }
    }
}

impl Serialize for Note {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.encode())
    }
}

impl<'de> Deserialize<'de> for Note {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Note::decode(i64::deserialize(deserializer)?))
    }
}

/// A notes map, as sent on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Notes(pub BTreeMap<FeedRef, Note>);

impl Notes {
    /// Parse a received notes map. Entries for feeds we cannot name (other
    /// feed formats) are skipped rather than failing the whole map.
    pub fn parse(map: &serde_json::Map<String, serde_json::Value>) -> NodeResult<Self> {
        let mut notes = Notes::default();
        for (feed, value) in map {
            let Ok(feed) = feed.parse::<FeedRef>() else {
                continue;
            };
            let value = value
                .as_i64()
                .ok_or_else(|| NodeError::Protocol(format!("note for {} is not an integer", feed)))?;
            notes.insert(feed, Note::decode(value));
        }
        Ok(notes)
    }

    pub fn insert(&mut self, feed: FeedRef, note: Note) {
        self.0.insert(feed, note);
    }

    pub fn get(&self, feed: &FeedRef) -> Option<&Note> {
        self.0.get(feed)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FeedRef, &Note)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_known_values() {
        assert_eq!(Note::NOT_REPLICATING.encode(), -1);
        assert_eq!(Note::wanting(0).encode(), 0);
        assert_eq!(Note::wanting(5).encode(), 10);
        assert_eq!(
            Note::decode(11),
            Note {
                replicate: true,
                receive: false,
                sequence: 5
            }
        );
        assert_eq!(Note::decode(-7), Note::NOT_REPLICATING);
    }

    #[test]
    fn test_notes_json() {
        let feed = Identity::generate().public().main_feed();
        let mut notes = Notes::default();
        notes.insert(feed, Note::wanting(3));
        let value = serde_json::to_value(&notes).unwrap();
        assert_eq!(value, json!({ feed.to_string(): 6 }));
        let back: Notes = serde_json::from_value(value).unwrap();
        assert_eq!(back, notes);
    }

    #[test]
    fn test_parse_skips_foreign_feeds() {
        let feed = Identity::generate().public().main_feed();
        let value = json!({ feed.to_string(): 7, "@abc.bendybutt-v1": 2 });
        let notes = Notes::parse(value.as_object().unwrap()).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(
            notes.get(&feed),
            Some(&Note {
                replicate: true,
                receive: false,
                sequence: 3
            })
        );
    }

    proptest! {
        #[test]
        fn prop_note_packing(sequence in 0u64..(1 << 52), receive in any::<bool>(), replicate in any::<bool>()) {
            let note = Note { replicate, receive, sequence };
            let decoded = Note::decode(note.encode());
            if replicate {
                prop_assert_eq!(decoded, note);
            } else {
                prop_assert_eq!(decoded, Note::NOT_REPLICATING);
            }
        }
    }
}
