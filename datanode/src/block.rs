//! Cache of individual blocks.

use crate::{
    cache::{self, Cookie, WeightedCache},
    memory::{Category, Tracker},
    BlockId, ChunkId,
};
use bytes::Bytes;
use commonware_runtime::Metrics;
use tracing::debug;

/// A cached block.
#[derive(Clone, Debug)]
pub struct Block {
    /// Content of the block.
    pub data: Bytes,

    /// Address of the peer the block was received from (if it did not come from local disk).
    pub source: Option<String>,
}

impl Block {
    /// Create a new [Block].
    pub fn new(data: Bytes, source: Option<String>) -> Self {
        Self { data, source }
    }
}

// Blocks are content-addressed, so only the payload is compared
impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for Block {}

/// Ticket for inserting a block (see [Cookie]).
pub type BlockCookie = Cookie<BlockId, Block>;

/// Cache of blocks, weighted by payload size and charged to [Category::BlockCache].
#[derive(Clone)]
pub struct Cache {
    cache: WeightedCache<BlockId, Block>,
}

impl Cache {
    /// Create a new [Cache].
    pub fn new(context: impl Metrics, cfg: cache::Config, tracker: &Tracker) -> Self {
        Self {
            cache: WeightedCache::new(
                context,
                cfg,
                |block: &Block| block.data.len() as u64,
                tracker.with_category(Category::BlockCache),
            ),
        }
    }

    /// Return the cached content of `id`, if any.
    pub fn find(&self, id: BlockId) -> Option<Bytes> {
        let entry = self.cache.find(&id)?;
        debug!(block = %id, "block cache hit");
        Some(entry.value().data.clone())
    }

    /// Cache `data` for `id`.
    ///
    /// If the block is already cached (or being read), the existing content is returned instead.
    ///
    /// # Panics
    ///
    /// Panics if different content is already cached for `id`.
    pub async fn put(&self, id: BlockId, data: Bytes, source: Option<String>) -> Bytes {
        let entry = self.cache.put(id, Block::new(data, source)).await;
        debug!(block = %id, size = entry.weight(), source = ?entry.value().source, "block put");
        entry.value().data.clone()
    }

    /// Begin reading `id` into the cache (see [WeightedCache::begin_insert]).
    pub fn begin_insert(&self, id: BlockId) -> BlockCookie {
        self.cache.begin_insert(id)
    }

    /// Drop every cached block of `chunk`. Returns the number of blocks dropped.
    pub fn remove_chunk(&self, chunk: ChunkId) -> usize {
        self.cache.remove_if(|id| id.chunk == chunk)
    }

    /// Identifiers of all cached blocks (in no particular order).
    pub fn entries(&self) -> Vec<BlockId> {
        self.cache
            .entries()
            .into_iter()
            .map(|entry| *entry.key())
            .collect()
    }

    /// Number of cached blocks.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Returns true if no blocks are cached.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Total size of cached blocks.
    pub fn weight(&self) -> u64 {
        self.cache.weight()
    }
}
