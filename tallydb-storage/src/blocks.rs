//! Aggregate block metadata.
//!
//! A block is one tile of a time-tiling scheme, materialized for one
//! query signature. It is reserved as a `Draft` row the moment a caller
//! decides it is missing, and only flips to `Filled` once its aggregate
//! rows are written. The `blocks_by_key` index is unique on
//! (signature id, block type, start); the draft insert checks it inside
//! the exclusive write transaction, which is the only concurrency guard
//! two racing fillers get.

use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tallydb_api::{BlockBounds, Timestamp};

use crate::{Error, Result, decode, encode, next_id};

pub(crate) const TABLE_BLOCKS: TableDefinition<u64, &[u8]> = TableDefinition::new("blocks");
pub(crate) const TABLE_BLOCKS_BY_KEY: TableDefinition<(u64, &str, i64), u64> =
    TableDefinition::new("blocks_by_key");

/// Lifecycle status of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    /// Reserved; its aggregate rows are being (or failed being) written.
    Draft,
    /// Aggregate rows are complete and safe to use.
    Filled,
}

/// A materialized time tile for one query signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub id: u64,
    pub block_type: String,
    pub start: Timestamp,
    pub end: Timestamp,
    pub signature_id: u64,
    pub status: BlockStatus,
}

/// Handle on the block metadata tables.
#[derive(Debug, Clone)]
pub struct BlockStore {
    db: Arc<Database>,
}

impl BlockStore {
    pub fn new(db: Arc<Database>) -> Self {
        BlockStore { db }
    }

    /// Reserves a draft block.
    ///
    /// Fails with [`Error::DuplicateBlock`] if a block for the same
    /// (signature, block type, start) already exists; the caller that
    /// loses the race must not fill the tile again.
    pub fn insert_draft(
        &self,
        block_type: &str,
        signature_id: u64,
        bounds: BlockBounds,
    ) -> Result<BlockRecord> {
        let write_txn = self.db.begin_write()?;
        let record = {
            let mut by_key = write_txn.open_table(TABLE_BLOCKS_BY_KEY)?;
            if by_key
                .get((signature_id, block_type, bounds.start))?
                .is_some()
            {
                return Err(Error::DuplicateBlock {
                    block_type: block_type.to_string(),
                    start: bounds.start,
                });
            }

            let id = next_id(&write_txn, "block")?;
            let record = BlockRecord {
                id,
                block_type: block_type.to_string(),
                start: bounds.start,
                end: bounds.end,
                signature_id,
                status: BlockStatus::Draft,
            };

            let bytes = encode(&record)?;
            let mut table = write_txn.open_table(TABLE_BLOCKS)?;
            table.insert(id, bytes.as_slice())?;
            by_key.insert((signature_id, block_type, bounds.start), id)?;

            record
        };
        write_txn.commit()?;
        Ok(record)
    }

    /// Marks a block as filled, making it usable by queries.
    pub fn publish(&self, id: u64) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TABLE_BLOCKS)?;
            let mut record: BlockRecord = match table.get(id)? {
                Some(bytes) => decode(bytes.value())?,
                None => return Err(Error::NotFound(format!("block {id}"))),
            };
            record.status = BlockStatus::Filled;
            let bytes = encode(&record)?;
            table.insert(id, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get(&self, id: u64) -> Result<Option<BlockRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE_BLOCKS)?;
        match table.get(id)? {
            Some(bytes) => Ok(Some(decode(bytes.value())?)),
            None => Ok(None),
        }
    }

    /// Blocks of one (block type, signature) fully contained in the
    /// inclusive period, ordered by start ascending. Gap detection in
    /// the fill algorithm relies on this ordering.
    pub fn list_for_period(
        &self,
        block_type: &str,
        signature_id: u64,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<BlockRecord>> {
        let read_txn = self.db.begin_read()?;
        let by_key = read_txn.open_table(TABLE_BLOCKS_BY_KEY)?;
        let table = read_txn.open_table(TABLE_BLOCKS)?;

        let lo = (signature_id, block_type, i64::MIN);
        let hi = (signature_id, block_type, i64::MAX);

        let mut records = Vec::new();
        for item in by_key.range(lo..=hi)? {
            let (_, id) = item?;
            if let Some(bytes) = table.get(id.value())? {
                let record: BlockRecord = decode(bytes.value())?;
                if record.start >= start && record.end <= end {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    /// Every block referencing a signature, across block types.
    pub fn list_for_signature(&self, signature_id: u64) -> Result<Vec<BlockRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|record| record.signature_id == signature_id)
            .collect())
    }

    /// Blocks stuck in draft status. A draft that outlives its filling
    /// request marks a failed fill and needs operator attention.
    pub fn list_drafts(&self) -> Result<Vec<BlockRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|record| record.status == BlockStatus::Draft)
            .collect())
    }

    pub fn list(&self) -> Result<Vec<BlockRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE_BLOCKS)?;

        let mut records = Vec::new();
        for item in table.iter()? {
            let (_, bytes) = item?;
            records.push(decode(bytes.value())?);
        }
        Ok(records)
    }

    /// Deletes a block row and its index entry. Aggregate rows are the
    /// aggregate store's to clean up.
    pub fn delete(&self, id: u64) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TABLE_BLOCKS)?;
            let record: BlockRecord = match table.get(id)? {
                Some(bytes) => decode(bytes.value())?,
                None => return Err(Error::NotFound(format!("block {id}"))),
            };
            table.remove(id)?;

            let mut by_key = write_txn.open_table(TABLE_BLOCKS_BY_KEY)?;
            by_key.remove((record.signature_id, record.block_type.as_str(), record.start))?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::open_temp;

    const WEEK: i64 = 604_800;

    fn bounds(start: i64) -> BlockBounds {
        BlockBounds { start, end: start + WEEK - 1 }
    }

    #[test]
    fn draft_insert_and_publish() {
        let (_dir, db) = open_temp();
        let store = BlockStore::new(db);

        let draft = store.insert_draft("week_in_seconds", 1, bounds(0)).unwrap();
        assert_eq!(draft.status, BlockStatus::Draft);

        store.publish(draft.id).unwrap();
        let published = store.get(draft.id).unwrap().unwrap();
        assert_eq!(published.status, BlockStatus::Filled);
        assert!(store.list_drafts().unwrap().is_empty());
    }

    #[test]
    fn duplicate_draft_is_rejected() {
        let (_dir, db) = open_temp();
        let store = BlockStore::new(db);

        store.insert_draft("week_in_seconds", 1, bounds(0)).unwrap();
        let err = store
            .insert_draft("week_in_seconds", 1, bounds(0))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateBlock { .. }));

        // A different signature may own the same tile.
        store.insert_draft("week_in_seconds", 2, bounds(0)).unwrap();
    }

    #[test]
    fn list_for_period_is_ordered_and_contained() {
        let (_dir, db) = open_temp();
        let store = BlockStore::new(db);

        store.insert_draft("week_in_seconds", 1, bounds(2 * WEEK)).unwrap();
        store.insert_draft("week_in_seconds", 1, bounds(0)).unwrap();
        store.insert_draft("week_in_seconds", 1, bounds(4 * WEEK)).unwrap();

        let listed = store
            .list_for_period("week_in_seconds", 1, 0, 3 * WEEK - 1)
            .unwrap();

        let starts: Vec<i64> = listed.iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![0, 2 * WEEK]);
    }

    #[test]
    fn delete_removes_row_and_key() {
        let (_dir, db) = open_temp();
        let store = BlockStore::new(db);

        let record = store.insert_draft("week_in_seconds", 1, bounds(0)).unwrap();
        store.delete(record.id).unwrap();

        assert!(store.get(record.id).unwrap().is_none());
        // The tile can be reserved again once deleted.
        store.insert_draft("week_in_seconds", 1, bounds(0)).unwrap();
    }
}
