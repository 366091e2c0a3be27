//! Invalidation flow: open-ended queries are indexed, matching writes
//! flush exactly their cache entries, and everything else stays put.

use std::time::{SystemTime, UNIX_EPOCH};

use tallydb_api::{ActorTotal, Field, LedgerEntry, Predicate, QueryArgs, Scope, Value};
use tallydb_query::{CacheKey, Engine, FlushArgs, cache_signature};
use tallydb_storage::open_database;

fn engine() -> (tempfile::TempDir, Engine) {
    let dir = tempfile::tempdir().unwrap();
    let db = open_database(dir.path().join("tally.redb")).unwrap();
    (dir, Engine::new(db))
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

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

fn cached(engine: &Engine, args: &QueryArgs, start: i64, end: Option<i64>) -> Option<Vec<ActorTotal>> {
    let cache = engine.caches().get("memory").unwrap();
    let key = CacheKey {
        signature: cache_signature(&args.canonicalized(), start, end),
        scope: Scope::Network,
    };
    cache.get(&key)
}

#[test]
fn matching_write_invalidates_an_open_ended_query() {
    let (_dir, engine) = engine();
    let start = now() - 100;

    engine.ledger().append(entry(1, 5, start + 10)).unwrap();

    let args = QueryArgs::default();
    let first = engine.query(start, None, args.clone()).get().unwrap();
    assert_eq!(first, vec![ActorTotal { actor: 1, total: 5 }]);

    // The open-ended query is cached and indexed.
    assert!(cached(&engine, &args, start, None).is_some());
    assert!(!engine.cache_index().load(Scope::Network).unwrap().is_empty());

    // A matching write flushes it...
    let new_entry = entry(2, 3, now() - 5);
    engine.ledger().append(new_entry.clone()).unwrap();
    engine.flusher(FlushArgs::from(&new_entry)).flush(false, false);
    assert!(cached(&engine, &args, start, None).is_none());

    // ...and the flushed tuple is pruned from the index.
    assert!(engine.cache_index().load(Scope::Network).unwrap().is_empty());

    // A fresh get() recomputes instead of serving the stale value.
    let second = engine.query(start, None, args).get().unwrap();
    assert_eq!(
        second,
        vec![ActorTotal { actor: 1, total: 5 }, ActorTotal { actor: 2, total: 3 }]
    );
}

#[test]
fn unrelated_write_leaves_the_cache_untouched() {
    let (_dir, engine) = engine();
    let start = now() - 100;

    engine.ledger().append(entry(1, 5, start + 10)).unwrap();

    let args = QueryArgs {
        predicates: vec![Predicate::eq(Field::Category, Value::Text("points".into()))],
        ..Default::default()
    };
    engine.query(start, None, args.clone()).get().unwrap();
    assert!(cached(&engine, &args, start, None).is_some());

    // A write restricted away by the indexed filter changes nothing.
    engine
        .flusher(FlushArgs { category: Some("credits".into()), ..FlushArgs::default() })
        .flush(false, false);
    assert!(cached(&engine, &args, start, None).is_some());

    // The matching category does flush it.
    engine
        .flusher(FlushArgs { category: Some("points".into()), ..FlushArgs::default() })
        .flush(false, false);
    assert!(cached(&engine, &args, start, None).is_none());
}

#[test]
fn queries_ending_in_the_future_are_indexed_too() {
    let (_dir, engine) = engine();
    let start = now() - 100;
    let end = now() + 500;

    engine.ledger().append(entry(1, 5, start + 10)).unwrap();
    engine.query(start, Some(end), QueryArgs::default()).get().unwrap();

    let record = engine.cache_index().load(Scope::Network).unwrap();
    let entry_record = record.values().next().expect("future-ended query should be indexed");
    let starts = &entry_record.caches["memory"];
    assert!(starts[&start].contains(&Some(end)));
}

#[test]
fn bounded_past_queries_are_not_indexed() {
    let (_dir, engine) = engine();
    let start = now() - 10_000;
    let end = now() - 5_000;

    engine.query(start, Some(end), QueryArgs::default()).get().unwrap();

    assert!(engine.cache_index().load(Scope::Network).unwrap().is_empty());
    // The result is still cached; it just never needs invalidation.
    assert!(cached(&engine, &QueryArgs::default(), start, Some(end)).is_some());
}

#[test]
fn ended_periods_are_skipped_unless_flush_ended() {
    let (_dir, engine) = engine();
    let args = QueryArgs::default().canonicalized();
    let start = now() - 10_000;
    let past_end = now() - 5_000;

    // Index an entry whose period has since ended, the way a
    // future-ended query looks once time passes it.
    let cache = engine.caches().get("memory").unwrap();
    let key = CacheKey {
        signature: cache_signature(&args, start, Some(past_end)),
        scope: Scope::Network,
    };
    cache.set(&key, &[ActorTotal { actor: 1, total: 5 }]);
    engine
        .cache_index()
        .add(Scope::Network, "memory", &args, start, Some(past_end))
        .unwrap();

    // A normal write flush skips the ended period.
    engine.flusher(FlushArgs::default()).flush(false, false);
    assert!(cache.get(&key).is_some());

    // Cleanup flows flush it explicitly.
    engine.flusher(FlushArgs::default()).flush(true, false);
    assert!(cache.get(&key).is_none());
}

#[test]
fn actor_gated_flush_only_hits_caches_containing_the_actor() {
    let (_dir, engine) = engine();
    let start = now() - 100;

    engine.ledger().append(entry(1, 5, start + 10)).unwrap();

    let args = QueryArgs::default();
    engine.query(start, None, args.clone()).get().unwrap();
    assert!(cached(&engine, &args, start, None).is_some());

    // Actor 2 is not in the cached result; the delete is skipped.
    engine
        .flusher(FlushArgs { actor: Some(2), ..FlushArgs::default() })
        .flush(true, true);
    assert!(cached(&engine, &args, start, None).is_some());

    // Actor 1 is; the cache goes away.
    engine
        .flusher(FlushArgs { actor: Some(1), ..FlushArgs::default() })
        .flush(true, true);
    assert!(cached(&engine, &args, start, None).is_none());
}
