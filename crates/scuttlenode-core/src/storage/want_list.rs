//! Feeds explicitly wanted by the user, each with an expiry

use chrono::{DateTime, Utc};
use redb::{ReadableTable, TableDefinition};

use super::Tx;
use crate::error::{NodeError, NodeResult};
use crate::identity::FeedRef;

/// Wanted feeds (key: feed ref, value: RFC 3339 expiry)
pub(crate) const WANT_LIST_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("feed_want_list");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantListEntry {
    pub feed: FeedRef,
    pub until: DateTime<Utc>,
}

pub struct WantListRepository<'a> {
    tx: Tx<'a>,
}

impl<'a> WantListRepository<'a> {
    pub(crate) fn new(tx: Tx<'a>) -> Self {
        Self { tx }
    }

    /// Want `feed` until `until`, replacing any earlier expiry.
    pub fn add(&self, feed: &FeedRef, until: DateTime<Utc>) -> NodeResult<()> {
        let txn = self.tx.write()?;
        let mut table = txn.open_table(WANT_LIST_TABLE)?;
        let (key, value) = (feed.to_string(), until.to_rfc3339());
        table.insert(key.as_str(), value.as_str())?;
        Ok(())
    }

    pub fn remove(&self, feed: &FeedRef) -> NodeResult<()> {
        let txn = self.tx.write()?;
        let mut table = txn.open_table(WANT_LIST_TABLE)?;
        table.remove(feed.to_string().as_str())?;
        Ok(())
    }

    /// Entries that have not expired at `now`.
    pub fn list(&self, now: DateTime<Utc>) -> NodeResult<Vec<WantListEntry>> {
        let raw: Vec<(String, String)> = with_table!(self.tx, WANT_LIST_TABLE, |table| {
            let mut raw = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                raw.push((key.value().to_string(), value.value().to_string()));
            }
            raw
        });

        let mut entries = Vec::new();
        for (feed, until) in raw {
            let until = DateTime::parse_from_rfc3339(&until)
                .map_err(|e| NodeError::Storage(format!("bad want list expiry for {}: {}", feed, e)))?
                .with_timezone(&Utc);
            if until > now {
                entries.push(WantListEntry {
                    feed: feed.parse()?,
                    until,
                });
            }
        }
        Ok(entries)
    }
}
