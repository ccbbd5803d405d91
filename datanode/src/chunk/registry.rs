use super::{
    handle::{Completion, Owner},
    metrics::Metrics,
    Chunk, Config, Kind, Location, Removal,
};
use crate::{block, io::IoEngine, meta, ChunkId, Error};
use commonware_runtime::{Clock, Metrics as RuntimeMetrics, Spawner};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, RwLock, Weak},
    time::Duration,
};
use tracing::debug;

pub(super) struct Inner<E, I> {
    context: E,
    io: I,
    reader_sweep_grace: Duration,
    chunks: RwLock<HashMap<ChunkId, Arc<Chunk>>>,

    // Keyed by handle address, stable while the sweep task holds the handle
    sweeps: Mutex<HashSet<usize>>,
    meta: meta::Manager,
    blocks: block::Cache,
    metrics: Metrics,
}

impl<E, I> Inner<E, I>
where
    E: Spawner + Clock + RuntimeMetrics,
    I: IoEngine,
{
    /// Purge the cached content of a removed chunk and forget it.
    fn on_removed(&self, chunk: &Arc<Chunk>) {
        let id = chunk.id();
        self.meta.remove_cached_meta(id);
        self.meta.remove_cached_blocks_ext(id);
        let blocks = self.blocks.remove_chunk(id);

        let mut chunks = self.chunks.write().unwrap();
        if chunks
            .get(&id)
            .is_some_and(|registered| Arc::ptr_eq(registered, chunk))
        {
            chunks.remove(&id);
        }
        self.metrics.chunks.set(chunks.len() as i64);
        drop(chunks);
        debug!(chunk = %id, blocks, "chunk unregistered");
    }
}

impl<E, I> Owner for Inner<E, I>
where
    E: Spawner + Clock + RuntimeMetrics,
    I: IoEngine,
{
    fn schedule_reader_sweep(self: Arc<Self>, chunk: Arc<Chunk>) {
        let key = Arc::as_ptr(&chunk) as usize;
        if !self.sweeps.lock().unwrap().insert(key) {
            return;
        }
        self.metrics.sweeps.inc();
        self.context
            .with_label("reader_sweep")
            .spawn(move |context| async move {
                context.sleep(self.reader_sweep_grace).await;
                self.sweeps.lock().unwrap().remove(&key);
                chunk.try_sweep_reader();
            });
    }

    fn start_remove(self: Arc<Self>, chunk: Arc<Chunk>, completion: Completion) {
        self.context
            .with_label("remove")
            .spawn(move |_| async move {
                let result = self.io.remove_chunk(chunk.location(), chunk.id()).await;
                if result.is_ok() {
                    self.metrics.removals.inc();
                } else {
                    self.metrics.removal_failures.inc();
                }
                self.on_removed(&chunk);
                chunk.finish_remove(completion, result);
            });
    }

    fn close_reader(&self, location: &Location, chunk: ChunkId) {
        self.io.close_reader(location, chunk);
    }
}

/// Lookup of the chunks resident on the node.
///
/// The registry owns every registered [Chunk] until its removal completes, at which point the
/// chunk is forgotten and its cached metadata and blocks are purged.
pub struct Registry<E, I> {
    inner: Arc<Inner<E, I>>,
}

impl<E, I> Clone for Registry<E, I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E, I> Registry<E, I>
where
    E: Spawner + Clock + RuntimeMetrics,
    I: IoEngine,
{
    /// Create a new [Registry].
    ///
    /// `meta` and `blocks` are the caches purged when a chunk is removed.
    pub fn new(
        context: E,
        io: I,
        meta: meta::Manager,
        blocks: block::Cache,
        cfg: Config,
    ) -> Self {
        let metrics = Metrics::init(context.with_label("registry"));
        Self {
            inner: Arc::new(Inner {
                context,
                io,
                reader_sweep_grace: cfg.reader_sweep_grace,
                chunks: RwLock::new(HashMap::new()),
                sweeps: Mutex::new(HashSet::new()),
                meta,
                blocks,
                metrics,
            }),
        }
    }

    /// Register a chunk stored in `location`.
    ///
    /// Fails with [Error::ChunkExists] if a chunk with the same id is registered.
    pub fn register(
        &self,
        id: ChunkId,
        location: Arc<Location>,
        kind: Kind,
    ) -> Result<Arc<Chunk>, Error> {
        let inner = Arc::downgrade(&self.inner);
        let owner: Weak<dyn Owner> = inner;
        let mut chunks = self.inner.chunks.write().unwrap();
        if chunks.contains_key(&id) {
            return Err(Error::ChunkExists(id));
        }
        let chunk = Arc::new(Chunk::new(id, location, kind, owner));
        chunks.insert(id, chunk.clone());
        self.inner.metrics.chunks.set(chunks.len() as i64);
        drop(chunks);
        debug!(chunk = %id, ?kind, "chunk registered");
        Ok(chunk)
    }

    /// Return the chunk registered as `id`, if any.
    pub fn find(&self, id: ChunkId) -> Option<Arc<Chunk>> {
        self.inner.chunks.read().unwrap().get(&id).cloned()
    }

    /// Return the chunk registered as `id` or [Error::NoSuchChunk].
    pub fn get(&self, id: ChunkId) -> Result<Arc<Chunk>, Error> {
        self.find(id).ok_or(Error::NoSuchChunk(id))
    }

    /// All registered chunks (in no particular order).
    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        self.inner.chunks.read().unwrap().values().cloned().collect()
    }

    /// Number of registered chunks.
    pub fn len(&self) -> usize {
        self.inner.chunks.read().unwrap().len()
    }

    /// Returns true if no chunk is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep the reader of `chunk` once the grace period elapses.
    ///
    /// Requests made while a sweep of the same chunk is pending are coalesced into that sweep.
    pub fn schedule_reader_sweep(&self, chunk: &Arc<Chunk>) {
        self.inner.clone().schedule_reader_sweep(chunk.clone());
    }

    /// Schedule removal of the chunk registered as `id` (see [Chunk::schedule_remove]).
    pub fn schedule_remove(&self, id: ChunkId) -> Result<Removal, Error> {
        Ok(self.get(id)?.schedule_remove())
    }

    /// Number of reader sweeps pending.
    pub fn pending_sweeps(&self) -> usize {
        self.inner.sweeps.lock().unwrap().len()
    }
}
