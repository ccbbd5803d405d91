//! Cache chunk metadata and per-chunk block indexes.
//!
//! Chunk metadata ([Meta]) is loaded from disk whenever a chunk is opened for reading. The
//! [Manager] keeps recently used metadata in a [WeightedCache] (charged to
//! [Category::ChunkMeta]) and the block index of each chunk ([BlocksExt]) in a second cache
//! (charged to [Category::ChunkBlocksExt]). Both caches are purged when a chunk is removed.

use crate::{
    cache::{self, Cookie, WeightedCache},
    memory::{Category, Tracker},
    ChunkId,
};
use bytes::Bytes;
use commonware_runtime::Metrics;
use std::{collections::BTreeMap, mem::size_of, sync::Arc};
use tracing::debug;

/// Location and checksum of a block within a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Size of the block in bytes.
    pub size: u64,

    /// Checksum of the block.
    pub checksum: u32,
}

/// Index of the blocks of a chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlocksExt {
    /// Blocks in chunk order.
    pub blocks: Vec<BlockInfo>,
}

impl BlocksExt {
    /// Create a new [BlocksExt].
    pub fn new(blocks: Vec<BlockInfo>) -> Self {
        Self { blocks }
    }

    /// Number of blocks in the chunk.
    pub fn block_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    /// Approximate memory used by the index.
    pub fn size(&self) -> u64 {
        (size_of::<Self>() + self.blocks.len() * size_of::<BlockInfo>()) as u64
    }
}

/// Metadata of a chunk: its block index and opaque extensions keyed by tag.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Meta {
    /// Index of the chunk's blocks.
    pub blocks: Arc<BlocksExt>,

    /// Extensions keyed by tag.
    pub extensions: BTreeMap<u32, Bytes>,
}

impl Meta {
    /// Create a new [Meta].
    pub fn new(blocks: BlocksExt, extensions: BTreeMap<u32, Bytes>) -> Self {
        Self {
            blocks: Arc::new(blocks),
            extensions,
        }
    }

    /// Approximate memory used by the metadata.
    pub fn size(&self) -> u64 {
        let extensions: usize = self
            .extensions
            .values()
            .map(|extension| size_of::<u32>() + size_of::<Bytes>() + extension.len())
            .sum();
        self.blocks.size() + (size_of::<Self>() + extensions) as u64
    }

    /// Returns a copy of the metadata that only retains the extensions in `tags`.
    pub fn filter(&self, tags: &[u32]) -> Self {
        Self {
            blocks: self.blocks.clone(),
            extensions: self
                .extensions
                .iter()
                .filter(|(tag, _)| tags.contains(tag))
                .map(|(tag, extension)| (*tag, extension.clone()))
                .collect(),
        }
    }
}

/// Ticket for inserting chunk metadata (see [Cookie]).
pub type MetaCookie = Cookie<ChunkId, Arc<Meta>>;

/// Ticket for inserting a block index (see [Cookie]).
pub type BlocksExtCookie = Cookie<ChunkId, Arc<BlocksExt>>;

/// Caches of chunk metadata and block indexes.
#[derive(Clone)]
pub struct Manager {
    meta: WeightedCache<ChunkId, Arc<Meta>>,
    blocks_ext: WeightedCache<ChunkId, Arc<BlocksExt>>,
}

impl Manager {
    /// Create a new [Manager], charging cached data to `tracker`.
    pub fn new(
        context: impl Metrics,
        meta_cfg: cache::Config,
        blocks_ext_cfg: cache::Config,
        tracker: &Tracker,
    ) -> Self {
        let meta = WeightedCache::new(
            context.with_label("meta_cache"),
            meta_cfg,
            |meta: &Arc<Meta>| meta.size(),
            tracker.with_category(Category::ChunkMeta),
        );
        let blocks_ext = WeightedCache::new(
            context.with_label("blocks_ext_cache"),
            blocks_ext_cfg,
            |blocks: &Arc<BlocksExt>| blocks.size(),
            tracker.with_category(Category::ChunkBlocksExt),
        );
        Self { meta, blocks_ext }
    }

    /// Return the cached metadata of `chunk`.
    ///
    /// If `tags` is provided, only the listed extensions are returned.
    pub fn find_cached_meta(&self, chunk: ChunkId, tags: Option<&[u32]>) -> Option<Arc<Meta>> {
        let entry = self.meta.find(&chunk)?;
        let meta = entry.value();
        Some(match tags {
            Some(tags) => Arc::new(meta.filter(tags)),
            None => meta.clone(),
        })
    }

    /// Cache the metadata of `chunk` unless it is already cached or being loaded.
    pub fn put_cached_meta(&self, chunk: ChunkId, meta: Arc<Meta>) {
        let cookie = self.begin_insert_cached_meta(chunk);
        if cookie.is_active() {
            self.end_insert_cached_meta(cookie, meta);
        } else {
            debug!(%chunk, "failed to cache chunk meta due to concurrent read");
        }
    }

    /// Begin loading the metadata of `chunk` (see [WeightedCache::begin_insert]).
    pub fn begin_insert_cached_meta(&self, chunk: ChunkId) -> MetaCookie {
        self.meta.begin_insert(chunk)
    }

    /// Complete loading the metadata of a chunk.
    pub fn end_insert_cached_meta(&self, cookie: MetaCookie, meta: Arc<Meta>) {
        let chunk = *cookie.key();
        cookie.end_insert(meta);
        debug!(%chunk, "chunk meta put into cache");
    }

    /// Drop the cached metadata of `chunk`.
    pub fn remove_cached_meta(&self, chunk: ChunkId) -> bool {
        self.meta.remove(&chunk)
    }

    /// Return the cached block index of `chunk`.
    pub fn find_cached_blocks_ext(&self, chunk: ChunkId) -> Option<Arc<BlocksExt>> {
        self.blocks_ext
            .find(&chunk)
            .map(|entry| entry.value().clone())
    }

    /// Cache the block index of `chunk` unless it is already cached or being loaded.
    pub fn put_cached_blocks_ext(&self, chunk: ChunkId, blocks: Arc<BlocksExt>) {
        let cookie = self.begin_insert_cached_blocks_ext(chunk);
        if cookie.is_active() {
            self.end_insert_cached_blocks_ext(cookie, blocks);
        } else {
            debug!(%chunk, "failed to cache blocks ext due to concurrent read");
        }
    }

    /// Begin loading the block index of `chunk` (see [WeightedCache::begin_insert]).
    pub fn begin_insert_cached_blocks_ext(&self, chunk: ChunkId) -> BlocksExtCookie {
        self.blocks_ext.begin_insert(chunk)
    }

    /// Complete loading the block index of a chunk.
    pub fn end_insert_cached_blocks_ext(&self, cookie: BlocksExtCookie, blocks: Arc<BlocksExt>) {
        let chunk = *cookie.key();
        cookie.end_insert(blocks);
        debug!(%chunk, "blocks ext put into cache");
    }

    /// Drop the cached block index of `chunk`.
    pub fn remove_cached_blocks_ext(&self, chunk: ChunkId) -> bool {
        self.blocks_ext.remove(&chunk)
    }

    /// The underlying metadata cache.
    pub fn meta_cache(&self) -> &WeightedCache<ChunkId, Arc<Meta>> {
        &self.meta
    }

    /// The underlying block index cache.
    pub fn blocks_ext_cache(&self) -> &WeightedCache<ChunkId, Arc<BlocksExt>> {
        &self.blocks_ext
    }
}
