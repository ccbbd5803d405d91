use super::{metrics::Metrics, Config};
use crate::{
    block::{self, Block},
    chunk::{self, ReadGuard, Registry},
    io::IoEngine,
    memory::{Category, Tracker},
    meta::{self, BlocksExt, Meta},
    BlockId, ChunkId, Error,
};
use bytes::Bytes;
use commonware_runtime::{Clock, Metrics as RuntimeMetrics, Spawner};
use std::sync::Arc;
use tracing::{debug, warn};

/// Serves blocks and metadata of the chunks resident on the node.
#[derive(Clone)]
pub struct Store<E: Spawner + Clock + RuntimeMetrics, I: IoEngine> {
    context: E,
    io: I,
    registry: Registry<E, I>,
    meta: meta::Manager,
    blocks: block::Cache,
    metrics: Arc<Metrics>,
}

impl<E: Spawner + Clock + RuntimeMetrics, I: IoEngine> Store<E, I> {
    /// Create a new [Store].
    ///
    /// The capacity of each cache is also installed as the limit of its category in `tracker`.
    pub fn new(context: E, io: I, tracker: &Tracker, cfg: Config) -> Self {
        tracker.set_limit(Category::BlockCache, Some(cfg.block_cache.capacity));
        tracker.set_limit(Category::ChunkMeta, Some(cfg.meta_cache.capacity));
        tracker.set_limit(Category::ChunkBlocksExt, Some(cfg.blocks_ext_cache.capacity));

        let meta = meta::Manager::new(
            context.with_label("meta"),
            cfg.meta_cache,
            cfg.blocks_ext_cache,
            tracker,
        );
        let blocks = block::Cache::new(
            context.with_label("block_cache"),
            cfg.block_cache,
            tracker,
        );
        let registry = Registry::new(
            context.with_label("chunks"),
            io.clone(),
            meta.clone(),
            blocks.clone(),
            chunk::Config {
                reader_sweep_grace: cfg.reader_sweep_grace,
            },
        );
        let metrics = Arc::new(Metrics::init(context.clone()));
        Self {
            context,
            io,
            registry,
            meta,
            blocks,
            metrics,
        }
    }

    /// Read block `index` of `chunk`.
    ///
    /// Cached blocks are returned immediately, even if the chunk is not registered (blocks may be
    /// received from peers). Otherwise concurrent callers share a single disk read, performed
    /// under a read lock of the chunk. Dropping the returned future does not cancel the read.
    pub async fn get_block(
        &self,
        chunk: ChunkId,
        index: u32,
        priority: i64,
    ) -> Result<Bytes, Error> {
        let id = BlockId::new(chunk, index);
        let cookie = self.blocks.begin_insert(id);
        let lookup = cookie.lookup();
        if cookie.is_active() {
            let guard = match self.read_lock(chunk) {
                Ok(guard) => guard,
                Err(err) => {
                    cookie.cancel(err.clone());
                    return Err(err);
                }
            };
            debug!(block = %id, priority, "block cache miss");
            self.metrics.block_reads.inc();

            let io = self.io.clone();
            let metrics = self.metrics.clone();
            self.context
                .with_label("read_block")
                .spawn(move |_| async move {
                    metrics.inflight.inc();
                    let result = io
                        .read_block(guard.chunk().location(), chunk, index, priority)
                        .await;
                    metrics.inflight.dec();
                    match result {
                        Ok(data) => {
                            cookie.end_insert(Block::new(data, None));
                        }
                        Err(err) => {
                            metrics.read_failures.inc();
                            warn!(block = %id, %err, "failed to read block");
                            cookie.cancel(err);
                        }
                    }
                    drop(guard);
                });
        }
        let entry = lookup.await?;
        Ok(entry.value().data.clone())
    }

    /// Read up to `count` blocks of `chunk` starting at `first`.
    ///
    /// Range reads bypass the block cache but hold a read lock of the chunk while reading.
    pub async fn get_blocks(
        &self,
        chunk: ChunkId,
        first: u32,
        count: u32,
        priority: i64,
    ) -> Result<Vec<Bytes>, Error> {
        let guard = self.read_lock(chunk)?;
        self.metrics.range_reads.inc();
        let result = self
            .io
            .read_blocks(guard.chunk().location(), chunk, first, count, priority)
            .await;
        if let Err(err) = &result {
            self.metrics.read_failures.inc();
            warn!(%chunk, first, count, %err, "failed to read blocks");
        }
        result
    }

    /// Cache `data` as block `index` of `chunk`, received from `source` (if known).
    ///
    /// Returns the cached content, which may have been inserted by a concurrent reader.
    ///
    /// # Panics
    ///
    /// Panics if different content is already cached for the block.
    pub async fn put_block(
        &self,
        chunk: ChunkId,
        index: u32,
        data: Bytes,
        source: Option<String>,
    ) -> Bytes {
        self.blocks
            .put(BlockId::new(chunk, index), data, source)
            .await
    }

    /// Return block `index` of `chunk` if it is cached.
    pub fn find_block(&self, chunk: ChunkId, index: u32) -> Option<Bytes> {
        self.blocks.find(BlockId::new(chunk, index))
    }

    /// Read the metadata of `chunk`.
    ///
    /// Concurrent callers share a single disk read, after which both the metadata and the block
    /// index of the chunk are cached.
    pub async fn get_meta(&self, chunk: ChunkId) -> Result<Arc<Meta>, Error> {
        let cookie = self.meta.begin_insert_cached_meta(chunk);
        let lookup = cookie.lookup();
        if cookie.is_active() {
            let guard = match self.read_lock(chunk) {
                Ok(guard) => guard,
                Err(err) => {
                    cookie.cancel(err.clone());
                    return Err(err);
                }
            };
            self.metrics.meta_reads.inc();

            let io = self.io.clone();
            let manager = self.meta.clone();
            let metrics = self.metrics.clone();
            self.context
                .with_label("read_meta")
                .spawn(move |_| async move {
                    metrics.inflight.inc();
                    let result = io.read_meta(guard.chunk().location(), chunk).await;
                    metrics.inflight.dec();
                    match result {
                        Ok(loaded) => {
                            let loaded = Arc::new(loaded);
                            manager.put_cached_blocks_ext(chunk, loaded.blocks.clone());
                            manager.end_insert_cached_meta(cookie, loaded);
                        }
                        Err(err) => {
                            metrics.read_failures.inc();
                            warn!(%chunk, %err, "failed to read chunk meta");
                            cookie.cancel(err);
                        }
                    }
                    drop(guard);
                });
        }
        let entry = lookup.await?;
        Ok(entry.value().clone())
    }

    /// Return the block index of `chunk`, reading its metadata if the index is not cached.
    pub async fn get_blocks_ext(&self, chunk: ChunkId) -> Result<Arc<BlocksExt>, Error> {
        if let Some(blocks) = self.meta.find_cached_blocks_ext(chunk) {
            return Ok(blocks);
        }
        Ok(self.get_meta(chunk).await?.blocks.clone())
    }

    /// The registry of resident chunks.
    pub fn registry(&self) -> &Registry<E, I> {
        &self.registry
    }

    /// The caches of chunk metadata and block indexes.
    pub fn meta(&self) -> &meta::Manager {
        &self.meta
    }

    /// The cache of blocks.
    pub fn blocks(&self) -> &block::Cache {
        &self.blocks
    }

    /// Identifiers of all cached blocks.
    pub fn cached_blocks(&self) -> Vec<BlockId> {
        self.blocks.entries()
    }

    fn read_lock(&self, chunk: ChunkId) -> Result<ReadGuard, Error> {
        ReadGuard::acquire(self.registry.get(chunk)?)
    }
}
