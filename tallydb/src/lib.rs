//! # TallyDB
//!
//! An embedded engine answering "who earned the most within an
//! arbitrary time window" over an append-only ledger of scored
//! transactions, without rescanning the ledger on every request.
//!
//! Whole tiles of the timeline are aggregated once into per-actor sums
//! and reused; the ragged edges of a period are scanned live and
//! blended in. Results are cached, and open-ended queries ("since X,
//! continuing to now") are tracked so new writes invalidate exactly the
//! caches they affect.
//!
//! ## Quickstart
//!
//! ```rust,no_run
//! use tallydb::{LedgerEntry, QueryArgs, TallyDb};
//!
//! fn main() -> tallydb::Result<()> {
//!     let db = TallyDb::open("tally.redb")?;
//!
//!     db.append(LedgerEntry {
//!         actor: 1,
//!         amount: 25,
//!         category: "points".into(),
//!         kind: "register".into(),
//!         site: 1,
//!         timestamp: 1_490_908_830,
//!     })?;
//!
//!     // Top actors since a timestamp, continuing to now.
//!     let top = db.top(1_490_832_000, None, QueryArgs::default())?;
//!     println!("{top:?}");
//!
//!     Ok(())
//! }
//! ```

mod error;

use std::path::Path;

use tallydb_query::{Engine, FlushArgs};
use tallydb_storage::{AggregateStore, BlockStore, LedgerStore, SignatureStore};

pub use crate::error::{Error, Result};
pub use tallydb_api::{
    ActorId, ActorTotal, BlockBounds, BlockType, CompareOp, Field, LedgerEntry, Op, Order,
    Predicate, PredicateValue, QueryArgs, Scope, SiteId, TimeRange, Timestamp, TotalCondition,
    Value,
};
pub use tallydb_query as query;
pub use tallydb_storage as storage;

/// The main database handle.
///
/// Safe to share across threads; writers are serialized by the
/// underlying store.
pub struct TallyDb {
    engine: Engine,
    ledger: LedgerStore,
    blocks: BlockStore,
    aggregates: AggregateStore,
    signatures: SignatureStore,
}

impl TallyDb {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = tallydb_storage::open_database(path)?;
        Ok(TallyDb {
            engine: Engine::new(db.clone()),
            ledger: LedgerStore::new(db.clone()),
            blocks: BlockStore::new(db.clone()),
            aggregates: AggregateStore::new(db.clone()),
            signatures: SignatureStore::new(db),
        })
    }

    /// The top actors for an inclusive period. `end = None` means the
    /// period continues to the present.
    pub fn top(
        &self,
        start: Timestamp,
        end: Option<Timestamp>,
        args: QueryArgs,
    ) -> Result<Vec<ActorTotal>> {
        Ok(self.engine.query(start, end, args).get()?)
    }

    /// Appends a transaction and invalidates the cached queries it
    /// could affect.
    pub fn append(&self, entry: LedgerEntry) -> Result<u64> {
        let row = self.ledger.append(entry)?;
        self.engine.flusher(FlushArgs::from(&row.entry)).flush(false, false);
        Ok(row.id)
    }

    /// Removes an actor's aggregate rows, and flushes only the caches
    /// whose results actually contain the actor. Returns how many
    /// aggregate rows were removed.
    ///
    /// The actor's raw ledger rows are the host's to deal with.
    pub fn delete_actor(&self, actor: u64) -> Result<u64> {
        let removed = self.aggregates.delete_for_actor(actor)?;
        self.engine
            .flusher(FlushArgs { actor: Some(actor), ..FlushArgs::default() })
            .flush(true, true);
        Ok(removed)
    }

    /// Deletes every signature, block, and aggregate row that could
    /// reference a category, then flushes matching caches, ended
    /// periods included.
    pub fn delete_category(&self, category: &str) -> Result<()> {
        for record in self.signatures.list()? {
            let predicates: Vec<Predicate> =
                serde_json::from_str(&record.args_json).unwrap_or_default();

            if category_excluded(&predicates, category) {
                continue;
            }

            for block in self.blocks.list_for_signature(record.id)? {
                self.aggregates.delete_for_block(block.id)?;
                self.blocks.delete(block.id)?;
            }
            self.signatures.delete(record.id)?;
        }

        self.engine
            .flusher(FlushArgs { category: Some(category.to_string()), ..FlushArgs::default() })
            .flush(true, false);

        Ok(())
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    /// Block metadata access, e.g. for inspecting stuck drafts.
    pub fn blocks(&self) -> &BlockStore {
        &self.blocks
    }

    pub fn aggregates(&self) -> &AggregateStore {
        &self.aggregates
    }

    pub fn signatures(&self) -> &SignatureStore {
        &self.signatures
    }
}

/// Whether a signature's predicates affirmatively exclude `category`.
///
/// A signature pinned to a different category (`Eq` other, or `In` not
/// containing it) is kept; one that merely negates the category would
/// not be queried again after the deletion, so it is deleted too.
fn category_excluded(predicates: &[Predicate], category: &str) -> bool {
    let value = Value::Text(category.to_string());
    predicates.iter().any(|p| {
        p.field == Field::Category
            && match (&p.op, &p.value) {
                (Op::Eq, PredicateValue::One(v)) => *v != value,
                (Op::In, PredicateValue::Many(vs)) => !vs.contains(&value),
                _ => false,
            }
    })
}
