//! The period aggregation orchestrator.
//!
//! A query names an inclusive period and a filter set. The orchestrator
//! probes the result cache, classifies the period against the active
//! tiling scheme, resolves (and lazily fills) the aggregate blocks it
//! needs, blends block sums with raw-ledger scans over the ragged
//! period edges, and finally caches what it computed.

use std::collections::BTreeMap;
use std::sync::Arc;

use redb::Database;
use tallydb_api::{
    ActorTotal, BlockBounds, BlockType, Field, LedgerQuery, Op, PredicateValue, QueryArgs, Scope,
    SiteId, TimeRange, Timestamp, TotalsQuery, Value, sort_totals,
};
use tallydb_storage::{
    AggregateStore, BlockRecord, BlockStatus, BlockStore, CacheIndexStore, LedgerStore,
    SignatureStore,
};
use tracing::{debug, info, warn};

use crate::block_type::{BlockTypeRegistry, WeekInSeconds};
use crate::cache::{CacheKey, CacheRegistry, MemoryCache};
use crate::index::CacheIndex;
use crate::signature::{block_signature, cache_signature};
use crate::{Error, Result, now_ts};

/// What a block-use policy hook gets to look at when overriding the
/// default classification.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInput {
    pub start: Timestamp,
    pub end: Timestamp,
    pub start_block: BlockBounds,
    pub end_block: BlockBounds,
    pub default_decision: bool,
}

type BlockPolicy = dyn Fn(&PolicyInput) -> bool + Send + Sync;

/// The period aggregation engine: stores, registries, configuration.
pub struct Engine {
    pub(crate) ledger: LedgerStore,
    pub(crate) blocks: BlockStore,
    pub(crate) aggregates: AggregateStore,
    pub(crate) signatures: SignatureStore,
    pub(crate) cache_index: CacheIndex,
    pub(crate) block_types: BlockTypeRegistry,
    pub(crate) caches: CacheRegistry,
    block_type_slug: String,
    cache_slug: String,
    local_site: SiteId,
    block_policy: Option<Box<BlockPolicy>>,
}

impl Engine {
    /// Creates an engine over an opened database, with the
    /// week-in-seconds scheme and the in-memory cache backend
    /// registered and active.
    pub fn new(db: Arc<Database>) -> Self {
        let mut block_types = BlockTypeRegistry::new();
        block_types.register(Arc::new(WeekInSeconds::default()));

        let mut caches = CacheRegistry::new();
        caches.register(Arc::new(MemoryCache::new("memory")));

        Engine {
            ledger: LedgerStore::new(db.clone()),
            blocks: BlockStore::new(db.clone()),
            aggregates: AggregateStore::new(db.clone()),
            signatures: SignatureStore::new(db.clone()),
            cache_index: CacheIndex::new(CacheIndexStore::new(db)),
            block_types,
            caches,
            block_type_slug: "week_in_seconds".to_string(),
            cache_slug: "memory".to_string(),
            local_site: 1,
            block_policy: None,
        }
    }

    /// Selects the active tiling scheme by slug.
    pub fn set_block_type(&mut self, slug: impl Into<String>) {
        self.block_type_slug = slug.into();
    }

    /// Selects the active cache backend by slug.
    pub fn set_cache_backend(&mut self, slug: impl Into<String>) {
        self.cache_slug = slug.into();
    }

    /// The site id that queries are scoped against.
    pub fn set_local_site(&mut self, site: SiteId) {
        self.local_site = site;
    }

    /// Installs a hook that may override the default use-blocks
    /// classification.
    pub fn set_block_policy(
        &mut self,
        policy: impl Fn(&PolicyInput) -> bool + Send + Sync + 'static,
    ) {
        self.block_policy = Some(Box::new(policy));
    }

    pub fn local_site(&self) -> SiteId {
        self.local_site
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    pub fn blocks(&self) -> &BlockStore {
        &self.blocks
    }

    pub fn aggregates(&self) -> &AggregateStore {
        &self.aggregates
    }

    pub fn signatures(&self) -> &SignatureStore {
        &self.signatures
    }

    pub fn cache_index(&self) -> &CacheIndex {
        &self.cache_index
    }

    pub fn block_types_mut(&mut self) -> &mut BlockTypeRegistry {
        &mut self.block_types
    }

    pub fn caches(&self) -> &CacheRegistry {
        &self.caches
    }

    pub fn caches_mut(&mut self) -> &mut CacheRegistry {
        &mut self.caches
    }

    /// Builds a query for an inclusive period. `end = None` means the
    /// period continues to the present, and the query stays registered
    /// for invalidation as new transactions arrive.
    pub fn query(&self, start: Timestamp, end: Option<Timestamp>, args: QueryArgs) -> PeriodQuery<'_> {
        PeriodQuery {
            engine: self,
            start,
            end,
            args: args.canonicalized(),
        }
    }
}

/// One top-actors query over an inclusive period.
pub struct PeriodQuery<'e> {
    engine: &'e Engine,
    start: Timestamp,
    end: Option<Timestamp>,
    args: QueryArgs,
}

impl PeriodQuery<'_> {
    /// The canonicalized args this query runs with.
    pub fn args(&self) -> &QueryArgs {
        &self.args
    }

    /// A query is network scope unless its site predicates pin it to
    /// exactly the engine's local site.
    pub fn scope(&self) -> Scope {
        scope_of(&self.args, self.engine.local_site)
    }

    /// Runs the query.
    pub fn get(&self) -> Result<Vec<ActorTotal>> {
        let now = now_ts();
        let end = self.end.unwrap_or(now);
        if end < self.start {
            return Err(Error::InvalidPeriod);
        }

        let scope = self.scope();
        let cache = self.engine.caches.get(&self.engine.cache_slug);
        let key = CacheKey {
            signature: cache_signature(&self.args, self.start, self.end),
            scope,
        };

        if let Some(cache) = &cache {
            if let Some(rows) = cache.get(&key) {
                debug!(start = self.start, "period query served from cache");
                return Ok(rows);
            }
        }

        let rows = self.compute(end)?;

        if let Some(cache) = &cache {
            cache.set(&key, &rows);

            // Track entries that future ledger writes can affect, so
            // the flusher can find them without scanning every key.
            if self.end.is_none() || end > now {
                if let Err(err) =
                    self.engine
                        .cache_index
                        .add(scope, cache.slug(), &self.args, self.start, self.end)
                {
                    warn!(%err, "failed indexing cached query for invalidation");
                }
            }
        }

        Ok(rows)
    }

    fn compute(&self, end: Timestamp) -> Result<Vec<ActorTotal>> {
        let block_type = self
            .engine
            .block_types
            .get(&self.engine.block_type_slug)
            .ok_or_else(|| Error::UnknownBlockType(self.engine.block_type_slug.clone()))?;

        let start_block = block_type.block_info(self.start);
        let end_block = block_type.block_info(end);

        let default_decision = should_use_blocks(self.start, end, start_block, end_block);
        let use_blocks = match &self.engine.block_policy {
            Some(policy) => policy(&PolicyInput {
                start: self.start,
                end,
                start_block,
                end_block,
                default_decision,
            }),
            None => default_decision,
        };

        if !use_blocks {
            return self.ledger_totals(end);
        }

        if self.start == start_block.start && end == end_block.end {
            self.block_totals(block_type.as_ref(), end)
        } else {
            self.hybrid_totals(block_type.as_ref(), end)
        }
    }

    /// Pure raw-ledger path: one scan with the period as a date filter.
    fn ledger_totals(&self, end: Timestamp) -> Result<Vec<ActorTotal>> {
        debug!(start = self.start, end, "serving period from the raw ledger");

        let query = TotalsQuery {
            predicates: self.args.predicates.clone(),
            ranges: vec![TimeRange { after: self.start, before: end }],
            totals: self.args.totals.clone(),
            order: Some(self.args.order),
            limit: self.args.limit,
            offset: self.args.offset,
        };

        Ok(self.engine.ledger.totals(&query)?)
    }

    /// Pure block path: the period is exactly a run of whole tiles.
    fn block_totals(&self, block_type: &dyn BlockType, end: Timestamp) -> Result<Vec<ActorTotal>> {
        let blocks = self.verified_blocks(block_type, end)?;
        let ids: Vec<u64> = blocks.iter().map(|b| b.id).collect();
        let sums = self.engine.aggregates.sum_for_blocks(&ids)?;
        Ok(self.finalize(sums))
    }

    /// Hybrid path: interior tiles come from aggregates, the ragged
    /// edges from at most two residual ledger scans.
    fn hybrid_totals(&self, block_type: &dyn BlockType, end: Timestamp) -> Result<Vec<ActorTotal>> {
        let blocks = self.verified_blocks(block_type, end)?;
        let (Some(first), Some(last)) = (blocks.first(), blocks.last()) else {
            // Classification guarantees at least one interior tile;
            // degrade to a plain scan if that is ever violated.
            return self.ledger_totals(end);
        };

        let mut ranges = Vec::new();
        if self.start != first.start {
            ranges.push(TimeRange { after: self.start, before: first.start - 1 });
        }
        if end != last.end {
            ranges.push(TimeRange { after: last.end + 1, before: end });
        }

        let ids: Vec<u64> = blocks.iter().map(|b| b.id).collect();
        let mut sums = self.engine.aggregates.sum_for_blocks(&ids)?;

        if !ranges.is_empty() {
            let residuals = self
                .engine
                .ledger
                .totals(&TotalsQuery::new(self.args.predicates.clone(), ranges))?;
            for row in residuals {
                *sums.entry(row.actor).or_insert(0) += row.total;
            }
        }

        Ok(self.finalize(sums))
    }

    /// Applies the restrictions block sums cannot: actor predicates,
    /// total conditions, ordering, pagination.
    fn finalize(&self, sums: BTreeMap<u64, i64>) -> Vec<ActorTotal> {
        let mut rows: Vec<ActorTotal> = sums
            .into_iter()
            .filter(|(actor, _)| self.args.actor_passes(*actor))
            .filter(|(_, total)| self.args.total_passes(*total))
            .map(|(actor, total)| ActorTotal { actor, total })
            .collect();

        sort_totals(&mut rows, self.args.order);

        if self.args.offset > 0 {
            rows.drain(..self.args.offset.min(rows.len()));
        }
        if let Some(limit) = self.args.limit {
            rows.truncate(limit);
        }
        rows
    }

    /// Returns the filled blocks covering the period's interior tiles,
    /// reserving and filling any that are missing.
    ///
    /// Observed drafts mean another caller is mid-fill; this fails fast
    /// with [`Error::DraftBlocksPresent`] rather than waiting, and the
    /// caller decides the retry policy.
    fn verified_blocks(
        &self,
        block_type: &dyn BlockType,
        end: Timestamp,
    ) -> Result<Vec<BlockRecord>> {
        let predicates = self.args.block_predicates();
        let signature = block_signature(&predicates);
        let args_json = serde_json::to_string(&predicates)?;
        let signature_id = self
            .engine
            .signatures
            .resolve(&signature, &args_json)
            .map_err(Error::SignatureInsertFailed)?;

        loop {
            let blocks = self.engine.blocks.list_for_period(
                block_type.slug(),
                signature_id,
                self.start,
                end,
            )?;

            let drafts = blocks
                .iter()
                .filter(|b| b.status == BlockStatus::Draft)
                .count();
            if drafts > 0 {
                return Err(Error::DraftBlocksPresent { count: drafts });
            }

            let missing = self.note_missing_blocks(block_type, signature_id, &blocks, end)?;
            if missing.is_empty() {
                return Ok(blocks);
            }

            for block in &missing {
                self.fill_block(block)?;
            }

            // Our picture of the existing blocks is stale now; re-run
            // the whole procedure instead of trusting it.
        }
    }

    /// Walks the existing blocks in start order and reserves a draft for
    /// every tile the period's interior expects but the store lacks.
    fn note_missing_blocks(
        &self,
        block_type: &dyn BlockType,
        signature_id: u64,
        blocks: &[BlockRecord],
        end: Timestamp,
    ) -> Result<Vec<BlockRecord>> {
        let start_block = block_type.block_info(self.start);
        let mut expected_start = start_block.start;
        if expected_start != self.start {
            // The leading tile is ragged, so interior coverage starts
            // with the next tile.
            expected_start = start_block.end + 1;
        }

        let mut end_block = block_type.block_info(end);
        if end_block.end != end {
            end_block = block_type.block_info(end_block.start - 1);
        }

        let mut missing = Vec::new();

        if blocks.is_empty() {
            self.note_gap(block_type, signature_id, end_block.end + 1, expected_start, &mut missing)?;
            return Ok(missing);
        }

        let first = &blocks[0];
        if first.start != expected_start {
            self.note_gap(block_type, signature_id, first.start, expected_start, &mut missing)?;
        }

        for pair in blocks.windows(2) {
            self.note_gap(block_type, signature_id, pair[1].start, pair[0].end + 1, &mut missing)?;
        }

        let last = &blocks[blocks.len() - 1];
        if last.start != end_block.start {
            self.note_gap(block_type, signature_id, end_block.end + 1, last.end + 1, &mut missing)?;
        }

        Ok(missing)
    }

    /// Enumerates the tiles expected between `expected_start` and
    /// `actual_start`, eagerly reserving a draft row for each. The draft
    /// insert is what makes a concurrent caller deciding the same tiles
    /// are missing lose the race instead of double-filling.
    fn note_gap(
        &self,
        block_type: &dyn BlockType,
        signature_id: u64,
        actual_start: Timestamp,
        expected_start: Timestamp,
        missing: &mut Vec<BlockRecord>,
    ) -> Result<()> {
        if actual_start <= expected_start {
            return Ok(());
        }

        let mut block_end = expected_start - 1;
        while block_end + 1 < actual_start {
            let bounds = block_type.block_info(block_end + 1);
            block_end = bounds.end;

            let draft = self
                .engine
                .blocks
                .insert_draft(block_type.slug(), signature_id, bounds)
                .map_err(|source| Error::BlockFillFailed {
                    start: bounds.start,
                    end: bounds.end,
                    source,
                })?;
            missing.push(draft);
        }

        Ok(())
    }

    /// Aggregates one drafted tile from the raw ledger and publishes it.
    /// On failure the draft row stays behind as an explicit, inspectable
    /// marker of the failed fill.
    fn fill_block(&self, block: &BlockRecord) -> Result<()> {
        info!(start = block.start, end = block.end, "filling aggregate block");

        let fill_failed = |source| Error::BlockFillFailed {
            start: block.start,
            end: block.end,
            source,
        };

        let query = TotalsQuery::new(
            self.args.block_predicates(),
            vec![TimeRange { after: block.start, before: block.end }],
        );

        let totals = self.engine.ledger.totals(&query).map_err(fill_failed)?;
        self.engine
            .aggregates
            .fill(block.id, &totals)
            .map_err(fill_failed)?;
        self.engine.blocks.publish(block.id).map_err(fill_failed)?;

        Ok(())
    }
}

/// Default classification: blocks only pay off once at least one whole
/// tile falls inside the period.
fn should_use_blocks(
    start: Timestamp,
    end: Timestamp,
    start_block: BlockBounds,
    end_block: BlockBounds,
) -> bool {
    let one_block_only = start_block == end_block;

    // More than two tiles are involved,
    (start_block.end + 1 != end_block.start && !one_block_only)
        // or exactly two and at least one period edge is tile-aligned,
        || (start_block.end + 1 == end_block.start
            && (start_block.start == start || end_block.end == end))
        // or a single tile spanned exactly.
        || (one_block_only && start_block.start == start && end_block.end == end)
}

pub(crate) fn scope_of(args: &QueryArgs, local_site: SiteId) -> Scope {
    let mut site_predicates = args.predicates.iter().filter(|p| p.field == Field::Site);
    match (site_predicates.next(), site_predicates.next()) {
        (Some(p), None)
            if p.op == Op::Eq && p.value == PredicateValue::One(Value::Id(local_site)) =>
        {
            Scope::Site
        }
        _ => Scope::Network,
    }
}
