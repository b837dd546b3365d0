use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;

use crate::protocol::chunk::{ChunkCoord, ChunkDims};
use crate::protocol::dto::{PlayerSnapshot, Tile};
use crate::session::Identity;
use crate::world::provider::{WorldError, WorldProvider};

pub const DEFAULT_CHUNK_CACHE_CAPACITY: usize = 256;

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64) / (total as f64)
        }
    }
}

struct ChunkCache {
    chunks: LruCache<u32, Arc<[Tile]>>,
    stats: CacheStats,
}

/// Keeps the most recently sent chunks of an inner provider in memory.
pub struct CachedWorld<W> {
    inner: W,
    cache: Mutex<ChunkCache>,
}

impl<W: WorldProvider> CachedWorld<W> {
    pub fn new(inner: W, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(ChunkCache {
                chunks: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats
    }
}

impl<W: WorldProvider> WorldProvider for CachedWorld<W> {
    fn player_snapshot(&self, identity: &Identity) -> Result<PlayerSnapshot, WorldError> {
        self.inner.player_snapshot(identity)
    }

    fn chunk_tiles(&self, coord: &ChunkCoord, dims: ChunkDims) -> Result<Vec<Tile>, WorldError> {
        {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(tiles) = cache.chunks.get(&coord.id).cloned() {
                cache.stats.hits += 1;
                return Ok(tiles.to_vec());
            }
            cache.stats.misses += 1;
        }

        // Loaded outside the lock; a racing loader just overwrites the entry.
        let tiles = self.inner.chunk_tiles(coord, dims)?;
        let shared: Arc<[Tile]> = Arc::from(tiles.as_slice());
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((evicted, _)) = cache.chunks.push(coord.id, shared) {
            if evicted != coord.id {
                cache.stats.evictions += 1;
            }
        }
        Ok(tiles)
    }

    fn spells(&self, identity: &Identity) -> Vec<u8> {
        self.inner.spells(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::position::Position;
    use crate::world::provider::TemplateWorld;

    const DIMS: ChunkDims = ChunkDims {
        width: 9,
        height: 7,
        depth: 8,
    };

    fn coord(x: u16, y: u16) -> ChunkCoord {
        ChunkCoord::for_position(Position::new(x, y, 7), DIMS, 2048, 2048)
    }

    #[test]
    fn repeated_chunks_hit_the_cache() {
        let world = CachedWorld::new(TemplateWorld::default(), 4);
        let first = world.chunk_tiles(&coord(100, 100), DIMS).expect("tiles");
        let second = world.chunk_tiles(&coord(100, 100), DIMS).expect("tiles");
        assert_eq!(first, second);
        assert_eq!(
            world.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                evictions: 0
            }
        );
        assert!((world.stats().hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn least_recently_used_chunk_is_evicted() {
        let world = CachedWorld::new(TemplateWorld::default(), 2);
        for (x, y) in [(0, 0), (100, 0), (0, 0), (200, 0)] {
            world.chunk_tiles(&coord(x, y), DIMS).expect("tiles");
        }
        assert_eq!(world.stats().evictions, 1);
        world.chunk_tiles(&coord(0, 0), DIMS).expect("tiles");
        assert_eq!(world.stats().hits, 2);
        world.chunk_tiles(&coord(100, 0), DIMS).expect("tiles");
        assert_eq!(world.stats().misses, 4);
    }

    #[test]
    fn snapshots_pass_through() {
        let world = CachedWorld::new(TemplateWorld::default(), 1);
        let player = world
            .player_snapshot(&Identity::new("Alice"))
            .expect("snapshot");
        assert_eq!(player.name, "Alice");
    }
}
