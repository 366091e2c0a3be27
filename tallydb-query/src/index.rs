//! Index of the cache entries that future ledger writes may invalidate.
//!
//! Only open-ended queries (and bounded queries whose end is still in
//! the future) are tracked; a period that already ended cannot be
//! affected by new data. The index is one structured record per scope,
//! keyed by the filter-argument signature rather than per cache entry,
//! which bounds its growth to the number of distinct filter sets.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tallydb_api::{QueryArgs, Scope, Timestamp};
use tallydb_storage::CacheIndexStore;

use crate::Result;
use crate::signature::args_signature;

/// All indexed cache entries for one filter signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// The canonical args behind the signature, kept so the flusher can
    /// re-derive exact cache keys and match transaction dimensions.
    pub args: QueryArgs,
    /// backend slug -> start timestamp -> set of end timestamps
    /// (`None` marks an open-ended query).
    pub caches: BTreeMap<String, BTreeMap<Timestamp, BTreeSet<Option<Timestamp>>>>,
}

/// One scope's full index record: filter signature -> entry.
pub type IndexRecord = BTreeMap<String, IndexEntry>;

/// The persistent invalidation index.
pub struct CacheIndex {
    store: CacheIndexStore,
}

impl CacheIndex {
    pub fn new(store: CacheIndexStore) -> Self {
        CacheIndex { store }
    }

    pub fn load(&self, scope: Scope) -> Result<IndexRecord> {
        match self.store.load(scope)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(IndexRecord::new()),
        }
    }

    pub fn save(&self, scope: Scope, record: &IndexRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.store.save(scope, &bytes)?;
        Ok(())
    }

    /// Records that a cache entry exists for this query. `args` must be
    /// canonical.
    pub fn add(
        &self,
        scope: Scope,
        backend: &str,
        args: &QueryArgs,
        start: Timestamp,
        end: Option<Timestamp>,
    ) -> Result<()> {
        let mut record = self.load(scope)?;

        let signature = args_signature(args);
        let entry = record.entry(signature).or_insert_with(|| IndexEntry {
            args: args.clone(),
            caches: BTreeMap::new(),
        });
        entry
            .caches
            .entry(backend.to_string())
            .or_default()
            .entry(start)
            .or_default()
            .insert(end);

        self.save(scope, &record)
    }
}
