//! Banned feeds, keyed by [`BanHash`]

use redb::{ReadableTable, TableDefinition};

use super::Tx;
use crate::error::NodeResult;
use crate::identity::{BanHash, FeedRef};

/// Banned feed hashes (key: 32-byte ban hash)
pub(crate) const BAN_LIST_TABLE: TableDefinition<&[u8], ()> = TableDefinition::new("ban_list");

pub struct BanListRepository<'a> {
    tx: Tx<'a>,
}

impl<'a> BanListRepository<'a> {
    pub(crate) fn new(tx: Tx<'a>) -> Self {
        Self { tx }
    }

    pub fn add(&self, hash: &BanHash) -> NodeResult<()> {
        let txn = self.tx.write()?;
        let mut table = txn.open_table(BAN_LIST_TABLE)?;
        table.insert(hash.as_bytes().as_slice(), ())?;
        Ok(())
    }

    /// Returns true if the hash was present.
    pub fn remove(&self, hash: &BanHash) -> NodeResult<bool> {
        let txn = self.tx.write()?;
        let mut table = txn.open_table(BAN_LIST_TABLE)?;
        let removed = table.remove(hash.as_bytes().as_slice())?.is_some();
        Ok(removed)
    }

    pub fn contains(&self, hash: &BanHash) -> NodeResult<bool> {
        with_table!(self.tx, BAN_LIST_TABLE, |table| {
            Ok(table.get(hash.as_bytes().as_slice())?.is_some())
        })
    }

    pub fn contains_feed(&self, feed: &FeedRef) -> NodeResult<bool> {
        self.contains(&feed.ban_hash())
    }

    pub fn list(&self) -> NodeResult<Vec<BanHash>> {
        with_table!(self.tx, BAN_LIST_TABLE, |table| {
            let mut hashes = Vec::new();
            for entry in table.iter()? {
                let (key, _) = entry?;
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(key.value());
                hashes.push(BanHash::from_bytes(bytes));
            }
            Ok(hashes)
        })
    }
}
