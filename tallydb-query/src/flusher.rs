//! Deletes the cached results a new ledger transaction could affect.
//!
//! The invalidation index is consulted per filter signature: a cache
//! entry is flushed only when every dimension the indexed filter
//! restricts is satisfied by the new transaction's value for it. A
//! dimension the filter never references is always compatible.

use tallydb_api::{Field, LedgerEntry, QueryArgs, Scope, Value};
use tracing::{debug, warn};

use crate::Result;
use crate::cache::CacheKey;
use crate::now_ts;
use crate::period::Engine;
use crate::signature::cache_signature;

/// The dimensions of a new transaction, matched against indexed
/// filters. Unset dimensions impose no restriction on what gets
/// flushed.
#[derive(Debug, Clone, Default)]
pub struct FlushArgs {
    pub actor: Option<u64>,
    pub category: Option<String>,
    pub kind: Option<String>,
    pub site: Option<u64>,
}

impl From<&LedgerEntry> for FlushArgs {
    fn from(entry: &LedgerEntry) -> Self {
        FlushArgs {
            actor: Some(entry.actor),
            category: Some(entry.category.clone()),
            kind: Some(entry.kind.clone()),
            site: Some(entry.site),
        }
    }
}

impl FlushArgs {
    fn dimensions(&self) -> Vec<(Field, Value)> {
        let mut values = Vec::new();
        if let Some(actor) = self.actor {
            values.push((Field::Actor, Value::Id(actor)));
        }
        if let Some(category) = &self.category {
            values.push((Field::Category, Value::Text(category.clone())));
        }
        if let Some(kind) = &self.kind {
            values.push((Field::Kind, Value::Text(kind.clone())));
        }
        if let Some(site) = self.site {
            values.push((Field::Site, Value::Id(site)));
        }
        values
    }
}

fn args_compatible(args: &QueryArgs, dimensions: &[(Field, Value)]) -> bool {
    dimensions.iter().all(|(field, value)| {
        args.predicates
            .iter()
            .filter(|p| p.field == *field)
            .all(|p| p.accepts(value))
    })
}

/// Flushes query caches in reference to one new transaction.
pub struct CacheFlusher<'e> {
    engine: &'e Engine,
    args: FlushArgs,
}

impl Engine {
    pub fn flusher(&self, args: FlushArgs) -> CacheFlusher<'_> {
        CacheFlusher { engine: self, args }
    }
}

impl CacheFlusher<'_> {
    /// Flushes every affected cache entry in both scopes.
    ///
    /// `flush_ended` also flushes entries whose bounded period already
    /// ended (needed for cleanup flows like actor or category
    /// deletion, where even settled answers become wrong).
    /// `only_if_actor_matches` first reads each cached value and skips
    /// the delete unless the transaction's actor appears in it, keeping
    /// actor-deletion cleanup from flushing unrelated caches.
    ///
    /// Index trouble is logged and swallowed; invalidation is cache
    /// maintenance and must never fail a write.
    pub fn flush(&self, flush_ended: bool, only_if_actor_matches: bool) {
        for scope in [Scope::Site, Scope::Network] {
            if let Err(err) = self.flush_scope(scope, flush_ended, only_if_actor_matches) {
                warn!(scope = scope.as_str(), %err, "cache flush skipped");
            }
        }
    }

    fn flush_scope(
        &self,
        scope: Scope,
        flush_ended: bool,
        only_if_actor_matches: bool,
    ) -> Result<()> {
        let now = now_ts();
        let dimensions = self.args.dimensions();

        let mut record = self.engine.cache_index.load(scope)?;
        let mut changed = false;

        for entry in record.values_mut() {
            if !args_compatible(&entry.args, &dimensions) {
                continue;
            }

            for (slug, starts) in entry.caches.iter_mut() {
                let Some(cache) = self.engine.caches.get(slug) else {
                    continue;
                };

                for (start, ends) in starts.iter_mut() {
                    let mut flushed = Vec::new();

                    for end in ends.iter() {
                        if let Some(end_ts) = end {
                            // A period that already ended cannot be
                            // affected by new transactions.
                            if *end_ts < now && !flush_ended {
                                continue;
                            }
                        }

                        let key = CacheKey {
                            signature: cache_signature(&entry.args, *start, *end),
                            scope,
                        };

                        if only_if_actor_matches {
                            match cache.get(&key) {
                                Some(rows) => {
                                    if !rows.iter().any(|row| Some(row.actor) == self.args.actor) {
                                        continue;
                                    }
                                }
                                None => continue,
                            }
                        }

                        cache.delete(&key);
                        debug!(slug = %slug, start, "flushed cached query result");
                        flushed.push(*end);
                    }

                    if !flushed.is_empty() {
                        changed = true;
                        for end in flushed {
                            ends.remove(&end);
                        }
                    }
                }

                starts.retain(|_, ends| !ends.is_empty());
            }

            entry.caches.retain(|_, starts| !starts.is_empty());
        }

        if changed {
            record.retain(|_, entry| !entry.caches.is_empty());
            self.engine.cache_index.save(scope, &record)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tallydb_api::Predicate;

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    fn category_args(category: &str) -> QueryArgs {
        QueryArgs {
            predicates: vec![Predicate::eq(Field::Category, text(category))],
            ..Default::default()
        }
        .canonicalized()
    }

    #[test]
    fn unreferenced_dimensions_are_always_compatible() {
        let args = category_args("points");
        let flush = FlushArgs { actor: Some(7), ..Default::default() };
        assert!(args_compatible(&args, &flush.dimensions()));
    }

    #[test]
    fn equality_restrictions_must_match() {
        let args = category_args("points");

        let matching = FlushArgs { category: Some("points".into()), ..Default::default() };
        assert!(args_compatible(&args, &matching.dimensions()));

        let other = FlushArgs { category: Some("credits".into()), ..Default::default() };
        assert!(!args_compatible(&args, &other.dimensions()));
    }

    #[test]
    fn list_and_negated_restrictions() {
        let args = QueryArgs {
            predicates: vec![
                Predicate::is_in(Field::Actor, vec![Value::Id(1), Value::Id(2)]),
                Predicate::ne(Field::Kind, text("register")),
            ],
            ..Default::default()
        }
        .canonicalized();

        let inside = FlushArgs {
            actor: Some(2),
            kind: Some("comment".into()),
            ..Default::default()
        };
        assert!(args_compatible(&args, &inside.dimensions()));

        let excluded_actor = FlushArgs { actor: Some(3), ..Default::default() };
        assert!(!args_compatible(&args, &excluded_actor.dimensions()));

        let excluded_kind = FlushArgs { kind: Some("register".into()), ..Default::default() };
        assert!(!args_compatible(&args, &excluded_kind.dimensions()));
    }
}
