//! Query signatures.
//!
//! Queries are matched against the blocks tables by signature: a stable
//! hash of the canonicalized filter arguments. Two queries with the same
//! filter semantics share one signature and therefore one set of blocks;
//! anything else gets its own. The args behind each signature are kept
//! as JSON for introspection and bulk cleanup.

use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::{Result, decode, encode, next_id};

pub(crate) const TABLE_SIGNATURES: TableDefinition<u64, &[u8]> =
    TableDefinition::new("signatures");
pub(crate) const TABLE_SIGNATURES_BY_HASH: TableDefinition<&str, u64> =
    TableDefinition::new("signatures_by_hash");

/// One canonicalized filter-argument set and its stable identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub id: u64,
    pub signature: String,
    pub args_json: String,
}

/// Handle on the signature tables.
#[derive(Debug, Clone)]
pub struct SignatureStore {
    db: Arc<Database>,
}

impl SignatureStore {
    pub fn new(db: Arc<Database>) -> Self {
        SignatureStore { db }
    }

    /// Looks up a signature's id, inserting it on first use.
    ///
    /// The insert re-checks the unique hash index inside the exclusive
    /// write transaction, so two callers racing on the same first use
    /// both end up with the winner's id instead of one of them erroring.
    pub fn resolve(&self, signature: &str, args_json: &str) -> Result<u64> {
        {
            let read_txn = self.db.begin_read()?;
            let by_hash = read_txn.open_table(TABLE_SIGNATURES_BY_HASH)?;
            if let Some(id) = by_hash.get(signature)? {
                return Ok(id.value());
            }
        }

        let write_txn = self.db.begin_write()?;
        let id = {
            let mut by_hash = write_txn.open_table(TABLE_SIGNATURES_BY_HASH)?;
            let existing = by_hash.get(signature)?.map(|id| id.value());
            match existing {
                Some(id) => id,
                None => {
                    let id = next_id(&write_txn, "signature")?;
                    let record = SignatureRecord {
                        id,
                        signature: signature.to_string(),
                        args_json: args_json.to_string(),
                    };
                    let bytes = encode(&record)?;
                    let mut table = write_txn.open_table(TABLE_SIGNATURES)?;
                    table.insert(id, bytes.as_slice())?;
                    by_hash.insert(signature, id)?;
                    id
                }
            }
        };
        write_txn.commit()?;
        Ok(id)
    }

    pub fn get(&self, id: u64) -> Result<Option<SignatureRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE_SIGNATURES)?;
        match table.get(id)? {
            Some(bytes) => Ok(Some(decode(bytes.value())?)),
            None => Ok(None),
        }
    }

    pub fn list(&self) -> Result<Vec<SignatureRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE_SIGNATURES)?;

        let mut records = Vec::new();
        for item in table.iter()? {
            let (_, bytes) = item?;
            records.push(decode(bytes.value())?);
        }
        Ok(records)
    }

    /// Deletes a signature row and its hash index entry. Blocks and
    /// aggregate rows referencing it are the caller's to cascade.
    pub fn delete(&self, id: u64) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TABLE_SIGNATURES)?;
            let record: Option<SignatureRecord> = match table.get(id)? {
                Some(bytes) => Some(decode(bytes.value())?),
                None => None,
            };
            if let Some(record) = record {
                table.remove(id)?;
                let mut by_hash = write_txn.open_table(TABLE_SIGNATURES_BY_HASH)?;
                by_hash.remove(record.signature.as_str())?;
            }
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
    fn resolve_is_idempotent() {
        let (_dir, db) = open_temp();
        let store = SignatureStore::new(db);

        let first = store.resolve("abc123", "[]").unwrap();
        let second = store.resolve("abc123", "[]").unwrap();
        assert_eq!(first, second);

        let other = store.resolve("def456", "[]").unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn records_keep_their_args() {
        let (_dir, db) = open_temp();
        let store = SignatureStore::new(db);

        let id = store.resolve("abc123", r#"[{"field":"category"}]"#).unwrap();
        let record = store.get(id).unwrap().unwrap();
        assert_eq!(record.signature, "abc123");
        assert_eq!(record.args_json, r#"[{"field":"category"}]"#);
    }

    #[test]
    fn delete_frees_the_hash() {
        let (_dir, db) = open_temp();
        let store = SignatureStore::new(db);

        let id = store.resolve("abc123", "[]").unwrap();
        store.delete(id).unwrap();

        assert!(store.get(id).unwrap().is_none());
        let fresh = store.resolve("abc123", "[]").unwrap();
        assert_ne!(fresh, id);
    }
}
