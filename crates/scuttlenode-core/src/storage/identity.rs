//! Local identity persistence

use redb::{ReadableTable, TableDefinition};

use super::Tx;
use crate::error::NodeResult;
use crate::identity::Identity;

/// Local identity (key: "local", value: 32-byte ed25519 seed)
pub(crate) const IDENTITY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("identity");

const LOCAL_KEY: &str = "local";

pub struct IdentityRepository<'a> {
    tx: Tx<'a>,
}

impl<'a> IdentityRepository<'a> {
    pub(crate) fn new(tx: Tx<'a>) -> Self {
        Self { tx }
    }

    pub fn load(&self) -> NodeResult<Option<Identity>> {
        let seed = with_table!(self.tx, IDENTITY_TABLE, |table| {
            table.get(LOCAL_KEY)?.map(|v| v.value().to_vec())
        });
        seed.map(|seed| Identity::from_bytes(&seed)).transpose()
    }

    pub fn save(&self, identity: &Identity) -> NodeResult<()> {
        let txn = self.tx.write()?;
        let mut table = txn.open_table(IDENTITY_TABLE)?;
        table.insert(LOCAL_KEY, identity.to_bytes().as_slice())?;
        Ok(())
    }
}
