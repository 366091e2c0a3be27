//! Persistence for the cache invalidation index.
//!
//! The engine keeps one structured record per scope; this store treats
//! it as opaque bytes, the way a generic key-value backend would.

use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tallydb_api::Scope;

use crate::Result;

pub(crate) const TABLE_CACHE_INDEX: TableDefinition<&str, &[u8]> =
    TableDefinition::new("cache_index");

/// Handle on the per-scope cache-index records.
#[derive(Debug, Clone)]
pub struct CacheIndexStore {
    db: Arc<Database>,
}

impl CacheIndexStore {
    pub fn new(db: Arc<Database>) -> Self {
        CacheIndexStore { db }
    }

    pub fn load(&self, scope: Scope) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE_CACHE_INDEX)?;
        Ok(table.get(scope.as_str())?.map(|bytes| bytes.value().to_vec()))
    }

    pub fn save(&self, scope: Scope, bytes: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TABLE_CACHE_INDEX)?;
            table.insert(scope.as_str(), bytes)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::open_temp;

    #[test]
    fn scopes_are_separate_records() {
        let (_dir, db) = open_temp();
        let store = CacheIndexStore::new(db);

        assert!(store.load(Scope::Site).unwrap().is_none());

        store.save(Scope::Site, b"site-record").unwrap();
        store.save(Scope::Network, b"network-record").unwrap();

        assert_eq!(store.load(Scope::Site).unwrap().unwrap(), b"site-record");
        assert_eq!(
            store.load(Scope::Network).unwrap().unwrap(),
            b"network-record"
        );
    }
}
