//! TallyDB storage layer.
//!
//! All persistent state lives in one `redb` database shared between the
//! store handles:
//!
//! - `ledger`: the append-only transaction log (id -> msgpack row)
//! - `blocks` / `blocks_by_key`: aggregate block metadata plus the
//!   unique (signature, block type, start) index that doubles as the
//!   concurrency guard for draft reservation
//! - `block_aggregates`: per-actor sums keyed (block id, actor)
//! - `signatures` / `signatures_by_hash`: canonicalized filter sets and
//!   their stable identifiers
//! - `cache_index`: one opaque invalidation-index record per scope
//! - `counters`: id allocation

mod error;

pub mod aggregates;
pub mod blocks;
pub mod index;
pub mod ledger;
pub mod signatures;

pub use crate::aggregates::AggregateStore;
pub use crate::blocks::{BlockRecord, BlockStatus, BlockStore};
pub use crate::error::{Error, Result};
pub use crate::index::CacheIndexStore;
pub use crate::ledger::{LedgerRow, LedgerStore};
pub use crate::signatures::{SignatureRecord, SignatureStore};

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;

const TABLE_COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

/// Creates (or opens) the database at `path` and makes sure every table
/// exists, so later read transactions never observe a missing table.
pub fn open_database(path: impl AsRef<Path>) -> Result<Arc<Database>> {
    let db = Database::create(path)?;

    let write_txn = db.begin_write()?;
    {
        write_txn.open_table(TABLE_COUNTERS)?;
        write_txn.open_table(ledger::TABLE_LEDGER)?;
        write_txn.open_table(blocks::TABLE_BLOCKS)?;
        write_txn.open_table(blocks::TABLE_BLOCKS_BY_KEY)?;
        write_txn.open_table(aggregates::TABLE_BLOCK_AGGREGATES)?;
        write_txn.open_table(signatures::TABLE_SIGNATURES)?;
        write_txn.open_table(signatures::TABLE_SIGNATURES_BY_HASH)?;
        write_txn.open_table(index::TABLE_CACHE_INDEX)?;
    }
    write_txn.commit()?;

    Ok(Arc::new(db))
}

pub(crate) fn next_id(txn: &WriteTransaction, key: &str) -> Result<u64> {
    let mut table = txn.open_table(TABLE_COUNTERS)?;
    let current = table.get(key)?.map(|v| v.value()).unwrap_or(0);
    let next = current + 1;
    table.insert(key, next)?;
    Ok(next)
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec(value).map_err(|e| Error::Encoding(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(|e| Error::Encoding(e.to_string()))
}
