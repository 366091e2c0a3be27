//! Per-actor sums for filled blocks.
//!
//! One row per (block, actor), written in bulk when a block is filled
//! and never updated afterwards. The composite key is the uniqueness
//! constraint.

use std::collections::BTreeMap;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tallydb_api::{ActorId, ActorTotal};

use crate::Result;

pub(crate) const TABLE_BLOCK_AGGREGATES: TableDefinition<(u64, u64), i64> =
    TableDefinition::new("block_aggregates");

/// Handle on the block aggregate rows.
#[derive(Debug, Clone)]
pub struct AggregateStore {
    db: Arc<Database>,
}

impl AggregateStore {
    pub fn new(db: Arc<Database>) -> Self {
        AggregateStore { db }
    }

    /// Writes a block's aggregate rows in one transaction.
    pub fn fill(&self, block_id: u64, totals: &[ActorTotal]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TABLE_BLOCK_AGGREGATES)?;
            for row in totals {
                table.insert((block_id, row.actor), row.total)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Per-actor sums across a set of blocks.
    pub fn sum_for_blocks(&self, block_ids: &[u64]) -> Result<BTreeMap<ActorId, i64>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE_BLOCK_AGGREGATES)?;

        let mut sums = BTreeMap::new();
        for &block_id in block_ids {
            for item in table.range((block_id, 0u64)..=(block_id, u64::MAX))? {
                let (key, amount) = item?;
                let (_, actor) = key.value();
                *sums.entry(actor).or_insert(0) += amount.value();
            }
        }
        Ok(sums)
    }

    /// One block's rows, mostly for inspection and tests.
    pub fn rows_for_block(&self, block_id: u64) -> Result<Vec<ActorTotal>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE_BLOCK_AGGREGATES)?;

        let mut rows = Vec::new();
        for item in table.range((block_id, 0u64)..=(block_id, u64::MAX))? {
            let (key, amount) = item?;
            let (_, actor) = key.value();
            rows.push(ActorTotal { actor, total: amount.value() });
        }
        Ok(rows)
    }

    pub fn delete_for_block(&self, block_id: u64) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TABLE_BLOCK_AGGREGATES)?;
            let mut keys = Vec::new();
            for item in table.range((block_id, 0u64)..=(block_id, u64::MAX))? {
                let (key, _) = item?;
                keys.push(key.value());
            }
            for key in keys {
                table.remove(key)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Removes one actor's rows across all blocks, returning how many
    /// were deleted. Used when an actor is removed from the system.
    pub fn delete_for_actor(&self, actor: ActorId) -> Result<u64> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(TABLE_BLOCK_AGGREGATES)?;
            let mut keys = Vec::new();
            for item in table.iter()? {
                let (key, _) = item?;
                let key = key.value();
                if key.1 == actor {
                    keys.push(key);
                }
            }
            let removed = keys.len() as u64;
            for key in keys {
                table.remove(key)?;
            }
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }
}
