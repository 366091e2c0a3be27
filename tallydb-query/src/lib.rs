//! TallyDB query engine.
//!
//! Answers "who earned the most within an arbitrary time window" over
//! the append-only ledger without rescanning it on every request:
//! periods are classified against a time-tiling scheme, whole tiles are
//! served from lazily materialized per-actor aggregates, ragged edges
//! from raw-ledger scans, and finished results go through a cache with
//! targeted invalidation for open-ended queries.

mod error;

pub mod block_type;
pub mod cache;
pub mod datetime;
pub mod flusher;
pub mod index;
pub mod period;
pub mod signature;

pub use crate::block_type::{BlockTypeRegistry, WEEK_IN_SECONDS, WeekInSeconds};
pub use crate::cache::{CacheKey, CacheRegistry, MemoryCache, QueryCache};
pub use crate::datetime::parse_datetime;
pub use crate::error::{Error, Result};
pub use crate::flusher::{CacheFlusher, FlushArgs};
pub use crate::index::{CacheIndex, IndexEntry, IndexRecord};
pub use crate::period::{Engine, PeriodQuery, PolicyInput};
pub use crate::signature::{args_signature, block_signature, cache_signature};

pub(crate) fn now_ts() -> tallydb_api::Timestamp {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
