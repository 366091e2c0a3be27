//! The append-only ledger of scored transactions, and the grouped
//! per-actor sum scan the aggregation engine runs against it.

use std::collections::BTreeMap;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tallydb_api::{ActorTotal, LedgerEntry, LedgerQuery, TotalsQuery, sort_totals};

use crate::{Error, Result, decode, encode, next_id};

pub(crate) const TABLE_LEDGER: TableDefinition<u64, &[u8]> = TableDefinition::new("ledger");

/// A persisted ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub id: u64,
    pub entry: LedgerEntry,
}

/// Handle on the transaction log.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    db: Arc<Database>,
}

impl LedgerStore {
    pub fn new(db: Arc<Database>) -> Self {
        LedgerStore { db }
    }

    /// Appends one transaction and returns the stored row.
    pub fn append(&self, entry: LedgerEntry) -> Result<LedgerRow> {
        let write_txn = self.db.begin_write()?;
        let row = {
            let id = next_id(&write_txn, "entry")?;
            let row = LedgerRow { id, entry };
            let bytes = encode(&row)?;
            let mut table = write_txn.open_table(TABLE_LEDGER)?;
            table.insert(id, bytes.as_slice())?;
            row
        };
        write_txn.commit()?;
        Ok(row)
    }

    pub fn get(&self, id: u64) -> Result<Option<LedgerRow>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE_LEDGER)?;
        match table.get(id)? {
            Some(bytes) => Ok(Some(decode(bytes.value())?)),
            None => Ok(None),
        }
    }

    pub fn entries(&self) -> Result<Vec<LedgerRow>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE_LEDGER)?;

        let mut rows = Vec::new();
        for item in table.iter()? {
            let (_, bytes) = item?;
            rows.push(decode(bytes.value())?);
        }
        Ok(rows)
    }
}

impl LedgerQuery for LedgerStore {
    type Error = Error;

    fn totals(&self, query: &TotalsQuery) -> Result<Vec<ActorTotal>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE_LEDGER)?;

        let mut sums: BTreeMap<u64, i64> = BTreeMap::new();
        for item in table.iter()? {
            let (_, bytes) = item?;
            let row: LedgerRow = decode(bytes.value())?;

            if !query.ranges.is_empty()
                && !query.ranges.iter().any(|r| r.contains(row.entry.timestamp))
            {
                continue;
            }
            if !query
                .predicates
                .iter()
                .all(|p| p.accepts(&row.entry.value_for(p.field)))
            {
                continue;
            }

            *sums.entry(row.entry.actor).or_insert(0) += row.entry.amount;
        }

        let mut rows: Vec<ActorTotal> = sums
            .into_iter()
            .filter(|(_, total)| query.totals.iter().all(|c| c.matches(*total)))
            .map(|(actor, total)| ActorTotal { actor, total })
            .collect();

        if let Some(order) = query.order {
            sort_totals(&mut rows, order);
        }

        if query.offset > 0 {
            rows.drain(..query.offset.min(rows.len()));
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::open_temp;
    use tallydb_api::{Field, Order, Predicate, TimeRange, Value};

    fn entry(actor: u64, amount: i64, timestamp: i64) -> LedgerEntry {
        LedgerEntry {
            actor,
            amount,
            category: "points".to_string(),
            kind: "test".to_string(),
            site: 1,
            timestamp,
        }
    }

    #[test]
    fn append_assigns_sequential_ids() {
        let (_dir, db) = open_temp();
        let store = LedgerStore::new(db);

        let first = store.append(entry(1, 10, 100)).unwrap();
        let second = store.append(entry(2, 20, 200)).unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(store.entries().unwrap().len(), 2);
    }

    #[test]
    fn totals_groups_and_orders() {
        let (_dir, db) = open_temp();
        let store = LedgerStore::new(db);

        store.append(entry(1, 3, 100)).unwrap();
        store.append(entry(1, 4, 200)).unwrap();
        store.append(entry(2, 10, 300)).unwrap();

        let mut query = TotalsQuery::new(vec![], vec![]);
        query.order = Some(Order::Desc);

        let rows = store.totals(&query).unwrap();
        assert_eq!(
            rows,
            vec![
                ActorTotal { actor: 2, total: 10 },
                ActorTotal { actor: 1, total: 7 },
            ]
        );
    }

    #[test]
    fn totals_respects_ranges_and_predicates() {
        let (_dir, db) = open_temp();
        let store = LedgerStore::new(db);

        store.append(entry(1, 1, 50)).unwrap();
        store.append(entry(1, 2, 150)).unwrap();
        store.append(entry(2, 4, 150)).unwrap();
        store.append(entry(2, 8, 450)).unwrap();

        // Two disjoint ranges act as an OR.
        let query = TotalsQuery::new(
            vec![Predicate::eq(Field::Actor, Value::Id(2))],
            vec![
                TimeRange { after: 100, before: 200 },
                TimeRange { after: 400, before: 500 },
            ],
        );

        let rows = store.totals(&query).unwrap();
        assert_eq!(rows, vec![ActorTotal { actor: 2, total: 12 }]);
    }

    #[test]
    fn totals_applies_thresholds_and_pagination() {
        let (_dir, db) = open_temp();
        let store = LedgerStore::new(db);

        store.append(entry(1, 1, 100)).unwrap();
        store.append(entry(2, 5, 100)).unwrap();
        store.append(entry(3, 9, 100)).unwrap();

        let mut query = TotalsQuery::new(vec![], vec![]);
        query.totals = vec![tallydb_api::TotalCondition {
            op: tallydb_api::CompareOp::Ge,
            value: 5,
        }];
        query.order = Some(Order::Desc);
        query.offset = 1;
        query.limit = Some(1);

        let rows = store.totals(&query).unwrap();
        assert_eq!(rows, vec![ActorTotal { actor: 2, total: 5 }]);
    }
}
