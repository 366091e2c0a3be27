//! Time-tiling schemes and their registry.

use std::collections::HashMap;
use std::sync::Arc;

use tallydb_api::{BlockBounds, BlockType, Timestamp};

/// One week's worth of seconds.
pub const WEEK_IN_SECONDS: i64 = 604_800;

/// Fixed-width tiles of one week's worth of seconds, anchored at epoch
/// zero. Tile edges deliberately do not align with calendar weeks; they
/// are just week-length spans counted from the epoch.
#[derive(Debug, Clone)]
pub struct WeekInSeconds {
    slug: String,
}

impl WeekInSeconds {
    pub fn new(slug: impl Into<String>) -> Self {
        WeekInSeconds { slug: slug.into() }
    }
}

impl Default for WeekInSeconds {
    fn default() -> Self {
        WeekInSeconds::new("week_in_seconds")
    }
}

impl BlockType for WeekInSeconds {
    fn slug(&self) -> &str {
        &self.slug
    }

    fn block_info(&self, instant: Timestamp) -> BlockBounds {
        let start = instant - instant.rem_euclid(WEEK_IN_SECONDS);

        // One short of the next tile's start, because both bounds are
        // inclusive.
        BlockBounds { start, end: start + WEEK_IN_SECONDS - 1 }
    }
}

/// Explicit slug -> scheme map, injected into the engine at
/// construction instead of a process-wide registry.
#[derive(Clone, Default)]
pub struct BlockTypeRegistry {
    types: HashMap<String, Arc<dyn BlockType>>,
}

impl BlockTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, block_type: Arc<dyn BlockType>) {
        self.types.insert(block_type.slug().to_string(), block_type);
    }

    pub fn get(&self, slug: &str) -> Option<Arc<dyn BlockType>> {
        self.types.get(slug).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_info_tiles_from_the_epoch() {
        let scheme = WeekInSeconds::default();

        let bounds = scheme.block_info(1_490_908_830);
        assert_eq!(bounds.start, 1_490_832_000);
        assert_eq!(bounds.end, 1_491_436_800 - 1);
    }

    #[test]
    fn bounds_are_inclusive_and_exhaustive() {
        let scheme = WeekInSeconds::default();

        let bounds = scheme.block_info(0);
        assert_eq!(bounds.start, 0);
        assert_eq!(bounds.end, WEEK_IN_SECONDS - 1);

        // The last second of a tile still belongs to it; the next
        // second starts the next tile.
        assert_eq!(scheme.block_info(bounds.end).start, 0);
        assert_eq!(scheme.block_info(bounds.end + 1).start, WEEK_IN_SECONDS);
    }

    #[test]
    fn pre_epoch_instants_tile_correctly() {
        let scheme = WeekInSeconds::default();

        let bounds = scheme.block_info(-1);
        assert_eq!(bounds.start, -WEEK_IN_SECONDS);
        assert_eq!(bounds.end, -1);
    }

    #[test]
    fn registry_resolves_by_slug() {
        let mut registry = BlockTypeRegistry::new();
        registry.register(Arc::new(WeekInSeconds::default()));

        assert!(registry.get("week_in_seconds").is_some());
        assert!(registry.get("fortnight").is_none());
    }
}
