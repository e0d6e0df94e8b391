//! Engine facade
//!
//! Composes the page pool, tile registry, tile cache, and prefetch pipeline
//! behind one handle. The steady-state loop is: register a block, queue a
//! prefetch, and consume; each consumed tile lands in the cache, swaps the
//! staging buffer, and (for grid tiles with an attached pool) is bound
//! resident to a pool page.
//!
//! Teardown order is encoded in field declaration order: the pipeline stops
//! and joins its worker first, then the cache, block map, registry, and
//! pool are torn down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::block::{BlockDescriptor, BlockMetadata};
use crate::cache::{CacheStats, TileCache};
use crate::error::{CoreError, Result};
use crate::memory::PagePool;
use crate::prefetch::{FetchFn, PrefetchPipeline, PrefetchRequest, ReadyTile, WaitOutcome};
use crate::registry::TileRegistry;
use crate::{Scalar, SCALAR_BYTES};

/// Engine construction parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Byte budget of the tile cache; half of it sizes each staging half
    pub cache_bytes: usize,
    /// Pages in the scratch pool; zero attaches no pool
    pub pool_pages: usize,
    /// Scalars per pool page
    pub page_elements: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_bytes: 64 * 1024 * 1024,
            pool_pages: 16,
            page_elements: 64 * 64 * 64,
        }
    }
}

impl EngineConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.pool_pages > 0 && self.page_elements == 0 {
            return Err(CoreError::InvalidConfig(
                "pool pages need a non-zero page size".to_string(),
            ));
        }
        Ok(())
    }
}

/// Engine activity counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Prefetch requests handed to the pipeline
    pub queued: u64,
    /// Ready tiles consumed (including failures)
    pub consumed: u64,
    /// Ready tiles that reported a fetch failure
    pub fetch_failures: u64,
    /// Prefetches short-circuited because the block is virtual zero
    pub zero_shortcuts: u64,
}

struct RegisteredBlock {
    meta: BlockMetadata,
    /// Grid coordinates when the block was registered through the registry
    coords: Option<Vec<usize>>,
}

/// Out-of-core engine facade
pub struct Engine {
    // Field order is teardown order: pipeline first (stops and joins the
    // worker), then cache, blocks, registry, pool.
    pipeline: PrefetchPipeline,
    cache: TileCache,
    blocks: RwLock<HashMap<String, RegisteredBlock>>,
    registry: Option<Arc<TileRegistry>>,
    pool: Option<Arc<PagePool>>,
    stats: Mutex<EngineStats>,
}

impl Engine {
    /// Create an engine whose fetch callback materializes zero-filled tiles
    /// (the fill-value contract of unwritten chunks).
    pub fn new(cache_bytes: usize) -> Self {
        Self::with_fetch(
            cache_bytes,
            Box::new(|req| vec![0.0; req.descriptor.tile_elements()]),
        )
    }

    /// Create an engine with an injected fetch callback.
    pub fn with_fetch(cache_bytes: usize, fetch: FetchFn) -> Self {
        Self {
            pipeline: PrefetchPipeline::new(cache_bytes / 2, fetch),
            cache: TileCache::new(cache_bytes),
            blocks: RwLock::new(HashMap::new()),
            registry: None,
            pool: None,
            stats: Mutex::new(EngineStats::default()),
        }
    }

    /// Create an engine from a config, attaching a pool when the config
    /// asks for one.
    pub fn with_config(config: EngineConfig, fetch: FetchFn) -> Result<Self> {
        config.validate()?;
        let mut engine = Self::with_fetch(config.cache_bytes, fetch);
        if config.pool_pages > 0 {
            engine.pool = Some(Arc::new(PagePool::new(
                config.pool_pages,
                config.page_elements,
            )?));
        }
        Ok(engine)
    }

    /// Attach a tile registry; grid tiles registered afterwards get
    /// residency tracking.
    pub fn attach_registry(&mut self, registry: Arc<TileRegistry>) {
        self.registry = Some(registry);
    }

    /// Attach a page pool backing grid-tile residency.
    pub fn attach_pool(&mut self, pool: Arc<PagePool>) {
        self.pool = Some(pool);
    }

    /// Register a named block.
    pub fn register_block(&self, key: &str, meta: BlockMetadata) {
        self.blocks.write().insert(
            key.to_string(),
            RegisteredBlock { meta, coords: None },
        );
    }

    /// Register the grid tile at `coords` under its canonical key.
    ///
    /// Requires an attached registry; geometry and the zero flag come from
    /// the registry's metadata slot. Returns the canonical key.
    pub fn register_grid_tile(&self, coords: &[usize]) -> Result<String> {
        let registry = self
            .registry
            .as_ref()
            .ok_or_else(|| CoreError::InvalidArgument("no registry attached".to_string()))?;

        let tile = registry.get_tile(coords)?;
        let tile_shape = registry.tile_shape(coords)?;
        let descriptor =
            BlockDescriptor::aligned(&tile_shape, registry.chunk_dims(), SCALAR_BYTES)?;

        let key = TileRegistry::tile_key(coords);
        self.blocks.write().insert(
            key.clone(),
            RegisteredBlock {
                meta: BlockMetadata {
                    is_zero: tile.is_zero(),
                    dataset_path: String::new(),
                    descriptor,
                },
                coords: Some(coords.to_vec()),
            },
        );
        Ok(key)
    }

    /// Registered block keys, sorted.
    pub fn block_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blocks.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Queue a prefetch for a registered block.
    ///
    /// Virtual-zero blocks never reach the pipeline: the call succeeds
    /// without performing any I/O.
    pub fn queue_prefetch(&self, key: &str) -> Result<()> {
        let (is_zero, descriptor) = {
            let blocks = self.blocks.read();
            let block = blocks
                .get(key)
                .ok_or_else(|| CoreError::NotFound(format!("block '{}' not registered", key)))?;
            (block.meta.is_zero, block.meta.descriptor.clone())
        };

        if is_zero {
            self.stats.lock().zero_shortcuts += 1;
            debug!(key, "zero tile, skipping prefetch");
            return Ok(());
        }

        self.pipeline.enqueue(PrefetchRequest {
            key: key.to_string(),
            descriptor,
        })?;
        self.stats.lock().queued += 1;
        Ok(())
    }

    /// Consume one ready tile if available.
    pub fn try_consume(&self) -> bool {
        match self.pipeline.pop_ready() {
            Some(tile) => {
                self.accept(tile);
                true
            }
            None => false,
        }
    }

    /// Block up to `timeout` for a ready tile and consume it.
    pub fn wait_consume(&self, timeout: Duration) -> bool {
        match self.pipeline.wait_ready(timeout) {
            WaitOutcome::Ready(tile) => {
                self.accept(tile);
                true
            }
            WaitOutcome::TimedOut | WaitOutcome::Stopped => false,
        }
    }

    /// Accept a ready tile: cache it, bind residency when possible, and
    /// swap the staging buffer so the next prefetch overlaps this read.
    fn accept(&self, tile: ReadyTile) {
        let mut stats = self.stats.lock();
        stats.consumed += 1;
        if tile.is_failure() {
            stats.fetch_failures += 1;
            drop(stats);
            warn!(key = %tile.key, "dropping failed fetch");
        } else {
            drop(stats);
            self.bind_residency(&tile);
            self.cache.put(&tile.key, tile.payload);
        }
        self.pipeline.swap_staging();
    }

    /// Mark a consumed grid tile resident in a pool page, copying the
    /// payload in. Pool exhaustion degrades to cache-only residency.
    fn bind_residency(&self, tile: &ReadyTile) {
        let (registry, pool) = match (&self.registry, &self.pool) {
            (Some(r), Some(p)) => (r, p),
            _ => return,
        };
        let coords = {
            let blocks = self.blocks.read();
            match blocks.get(&tile.key).and_then(|b| b.coords.clone()) {
                Some(c) => c,
                None => return,
            }
        };

        let page = match pool.acquire() {
            Ok(page) => page,
            Err(_) => {
                debug!(key = %tile.key, "pool exhausted, tile stays cache-only");
                return;
            }
        };

        // Safety: the page was just acquired and is exclusively ours until
        // released through release_tile.
        unsafe {
            if let Ok(region) = pool.page_slice_mut(page) {
                let n = tile.payload.len().min(region.len());
                region[..n].copy_from_slice(&tile.payload[..n]);
            }
        }

        if let Err(err) = registry.bind_page(&coords, page) {
            warn!(key = %tile.key, %err, "residency bind failed, returning page");
            let _ = pool.release(page);
        }
    }

    /// Drop a grid tile's residency, returning its page to the pool.
    pub fn release_tile(&self, key: &str) -> Result<()> {
        let registry = self
            .registry
            .as_ref()
            .ok_or_else(|| CoreError::InvalidArgument("no registry attached".to_string()))?;
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| CoreError::InvalidArgument("no pool attached".to_string()))?;

        let coords = {
            let blocks = self.blocks.read();
            blocks
                .get(key)
                .and_then(|b| b.coords.clone())
                .ok_or_else(|| CoreError::NotFound(format!("block '{}' is not a grid tile", key)))?
        };

        let page = registry
            .get_tile(&coords)?
            .page_id()
            .ok_or_else(|| {
                CoreError::InvalidArgument(format!("tile '{}' is not resident", key))
            })?;
        registry.unbind_page(&coords)?;
        pool.release(page)
    }

    /// Current cache payload bytes.
    pub fn cache_bytes(&self) -> usize {
        self.cache.current_bytes()
    }

    /// Look up a cached tile payload.
    pub fn lookup_cache(&self, key: &str) -> Option<Vec<Scalar>> {
        self.cache.get(key)
    }

    /// Cache access counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Depth of the prefetch request queue.
    pub fn pending_prefetches(&self) -> usize {
        self.pipeline.pending()
    }

    /// Engine activity counters.
    pub fn stats(&self) -> EngineStats {
        *self.stats.lock()
    }

    /// Stop the pipeline early; destruction does this implicitly.
    pub fn shutdown(&self) {
        self.pipeline.stop();
    }

    /// Align a tile shape to the container's chunk alignment.
    ///
    /// `chunk_shape[i]` is the smallest multiple of `chunk_alignment[i]`
    /// (1 when zero) not less than `tile_shape[i]`; `bytes` is
    /// `Π tile_shape * element_bytes`. Rank mismatch is caller error.
    pub fn align_chunk_to_tile(
        tile_shape: &[usize],
        chunk_alignment: &[usize],
        element_bytes: usize,
    ) -> Result<BlockDescriptor> {
        BlockDescriptor::aligned(tile_shape, chunk_alignment, element_bytes)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("cache_bytes", &self.cache_bytes())
            .field("pending", &self.pending_prefetches())
            .field("registry", &self.registry.is_some())
            .field("pool", &self.pool.is_some())
            .finish()
    }
}
