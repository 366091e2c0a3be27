//! Canonical signatures for filter-argument sets and cache keys.
//!
//! Callers are expected to pass canonicalized args (see
//! [`QueryArgs::canonicalized`]); the hash here is only as stable as the
//! canonical form underneath it.

use serde::Serialize;
use sha2::{Digest, Sha256};
use tallydb_api::{Predicate, QueryArgs, Timestamp};

/// Signature over the full argument set, time bounds excluded. Keys the
/// cache invalidation index.
pub fn args_signature(args: &QueryArgs) -> String {
    hash_json(args)
}

/// Signature over the block-relevant predicates only. Keys the blocks
/// tables.
pub fn block_signature(predicates: &[Predicate]) -> String {
    hash_json(&predicates)
}

#[derive(Serialize)]
struct CacheKeyArgs<'a> {
    args: &'a QueryArgs,
    start: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    end: Option<Timestamp>,
}

/// Signature over args plus period bounds; the end is folded in only
/// for bounded queries so an open-ended query keeps one cache slot as
/// "now" advances.
pub fn cache_signature(args: &QueryArgs, start: Timestamp, end: Option<Timestamp>) -> String {
    hash_json(&CacheKeyArgs { args, start, end })
}

fn hash_json<T: Serialize>(value: &T) -> String {
    let json = serde_json::to_string(value).expect("canonical args should serialize");
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}
