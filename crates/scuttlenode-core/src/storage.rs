//! Persistent storage using redb.
//!
//! All reads and writes go through transactions:
//!
//! ```ignore
//! let seq = storage.view(|tx| tx.feeds().sequence(&feed))?;
//! storage.update(|tx| tx.ban_list().add(&hash))?;
//! ```
//!
//! The closure receives an [`Adapters`] value bound to the transaction; it
//! hands out narrowly-typed repositories for each logical bucket:
//!
//! | repository      | tables                                           |
//! |-----------------|--------------------------------------------------|
//! | `feeds()`       | `feeds`, `feed_heads`, `message_index`           |
//! | `graph()`       | `graph`                                          |
//! | `receive_log()` | `receive_log_seq_to_id`, `receive_log_id_to_seqs`, `receive_log_meta` |
//! | `ban_list()`    | `ban_list`                                       |
//! | `want_list()`   | `feed_want_list`                                 |
//! | `identity()`    | `identity`                                       |
//!
//! `update` commits when the closure returns `Ok` and aborts otherwise.

use crate::error::{NodeError, NodeResult};
use crate::feed::Formats;
use parking_lot::RwLock;
use redb::{Database, ReadTransaction, WriteTransaction};
use std::path::Path;
use std::sync::Arc;

/// Open a table from either kind of transaction and run `$body` with it.
/// Textually scoped, so it must stay above the submodule declarations.
macro_rules! with_table {
    ($tx:expr, $def:expr, |$table:ident| $body:expr) => {
        match $tx {
            $crate::storage::Tx::Read(txn) => {
                let $table = txn.open_table($def)?;
                let result = $body;
                result
            }
            $crate::storage::Tx::Write(txn) => {
                let $table = txn.open_table($def)?;
                let result = $body;
                result
            }
        }
    };
}

// Submodules
mod ban_list;
mod feeds;
mod graph;
mod identity;
mod receive_log;
mod want_list;

use ban_list::BAN_LIST_TABLE;
use feeds::{FEEDS_TABLE, FEED_HEADS_TABLE, MESSAGE_INDEX_TABLE};
use graph::GRAPH_TABLE;
use identity::IDENTITY_TABLE;
use receive_log::{RECEIVE_LOG_ID_TO_SEQS, RECEIVE_LOG_META, RECEIVE_LOG_SEQ_TO_ID};
use want_list::WANT_LIST_TABLE;

pub use ban_list::BanListRepository;
pub use feeds::FeedRepository;
pub use graph::{GraphRepository, Relation};
pub use identity::IdentityRepository;
pub use receive_log::{ReceiveLogEntry, ReceiveLogRepository};
pub use want_list::{WantListEntry, WantListRepository};

/// The transaction an [`Adapters`] value is bound to.
#[derive(Clone, Copy)]
pub(crate) enum Tx<'a> {
    Read(&'a ReadTransaction),
    Write(&'a WriteTransaction),
}

impl<'a> Tx<'a> {
    pub(crate) fn write(&self) -> NodeResult<&'a WriteTransaction> {
        match *self {
            Tx::Write(txn) => Ok(txn),
            Tx::Read(_) => Err(NodeError::Storage(
                "write attempted inside a read transaction".to_string(),
            )),
        }
    }
}

/// Per-transaction bundle of repositories.
pub struct Adapters<'a> {
    tx: Tx<'a>,
    formats: &'a Formats,
}

impl<'a> Adapters<'a> {
    pub fn feeds(&self) -> FeedRepository<'a> {
        FeedRepository::new(self.tx, self.formats)
    }

    pub fn graph(&self) -> GraphRepository<'a> {
        GraphRepository::new(self.tx)
    }

    pub fn receive_log(&self) -> ReceiveLogRepository<'a> {
        ReceiveLogRepository::new(self.tx, self.formats)
    }

    pub fn ban_list(&self) -> BanListRepository<'a> {
        BanListRepository::new(self.tx)
    }

    pub fn want_list(&self) -> WantListRepository<'a> {
        WantListRepository::new(self.tx)
    }

    pub fn identity(&self) -> IdentityRepository<'a> {
        IdentityRepository::new(self.tx)
    }
}

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
    formats: Formats,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all required tables
    pub fn new(path: impl AsRef<Path>, formats: Formats) -> NodeResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(FEEDS_TABLE)?;
            let _ = write_txn.open_table(FEED_HEADS_TABLE)?;
            let _ = write_txn.open_table(MESSAGE_INDEX_TABLE)?;
            let _ = write_txn.open_table(GRAPH_TABLE)?;
            let _ = write_txn.open_table(RECEIVE_LOG_SEQ_TO_ID)?;
            let _ = write_txn.open_table(RECEIVE_LOG_ID_TO_SEQS)?;
            let _ = write_txn.open_table(RECEIVE_LOG_META)?;
            let _ = write_txn.open_table(BAN_LIST_TABLE)?;
            let _ = write_txn.open_table(WANT_LIST_TABLE)?;
            let _ = write_txn.open_table(IDENTITY_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
            formats,
        })
    }

    pub fn formats(&self) -> &Formats {
        &self.formats
    }

    /// Run `f` inside a read transaction.
    pub fn view<R>(&self, f: impl FnOnce(&Adapters<'_>) -> NodeResult<R>) -> NodeResult<R> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let adapters = Adapters {
            tx: Tx::Read(&read_txn),
            formats: &self.formats,
        };
        f(&adapters)
    }

    /// Run `f` inside a write transaction, committing only if it succeeds.
    pub fn update<R>(&self, f: impl FnOnce(&Adapters<'_>) -> NodeResult<R>) -> NodeResult<R> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let result = {
            let adapters = Adapters {
                tx: Tx::Write(&write_txn),
                formats: &self.formats,
            };
            f(&adapters)
        };
        match result {
            Ok(value) => {
                write_txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                write_txn.abort()?;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let storage = Storage::new(&db_path, Formats::default()).unwrap();
        (storage, temp_dir)
    }
}
