use super::{Kind, Location, Removal, State};
use crate::{ChunkId, Error};
use futures::{channel::oneshot, FutureExt};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc, RwLock, RwLockWriteGuard, Weak,
};
use tracing::{debug, trace, warn};

/// Sender used to resolve a [Removal].
pub(crate) type Completion = oneshot::Sender<Result<(), Error>>;

/// Services a [Chunk] requires from the registry that owns it.
pub(crate) trait Owner: Send + Sync + 'static {
    /// Call [Chunk::try_sweep_reader] after the configured grace period.
    fn schedule_reader_sweep(self: Arc<Self>, chunk: Arc<Chunk>);

    /// Physically remove `chunk` and resolve `completion` with the outcome.
    fn start_remove(self: Arc<Self>, chunk: Arc<Chunk>, completion: Completion);

    /// Release the cached reader of a chunk.
    fn close_reader(&self, location: &Location, chunk: ChunkId);
}

#[derive(Default)]
struct Lifetime {
    removal: Option<Removal>,
    completion: Option<Completion>,
}

/// A chunk resident on the node.
///
/// Readers and updaters pin the chunk with read locks (shared) and update locks (exclusive).
/// Removal requested with [Chunk::schedule_remove] only starts once every lock has been
/// released, and no new lock can be acquired once removal is scheduled.
pub struct Chunk {
    id: ChunkId,
    location: Arc<Location>,
    kind: Kind,
    version: AtomicU64,
    owner: Weak<dyn Owner>,

    // Serializes lock acquisition with scheduling removal and sweeping the reader
    lifetime: RwLock<Lifetime>,
    read_locks: AtomicUsize,
    update_locks: AtomicUsize,
    remove_scheduled: AtomicBool,
    removing: AtomicBool,
    removed: AtomicBool,

    // Bit 0 is set while a sweep is pending; every read lock adds 2
    reader_sweep_latch: AtomicU64,
}

impl Chunk {
    pub(crate) fn new(
        id: ChunkId,
        location: Arc<Location>,
        kind: Kind,
        owner: Weak<dyn Owner>,
    ) -> Self {
        Self {
            id,
            location,
            kind,
            version: AtomicU64::new(0),
            owner,
            lifetime: RwLock::new(Lifetime::default()),
            read_locks: AtomicUsize::new(0),
            update_locks: AtomicUsize::new(0),
            remove_scheduled: AtomicBool::new(false),
            removing: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            reader_sweep_latch: AtomicU64::new(0),
        }
    }

    /// Identifier of the chunk.
    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// Storage directory holding the chunk.
    pub fn location(&self) -> &Arc<Location> {
        &self.location
    }

    /// Backend of the chunk.
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Pin the chunk for reading.
    ///
    /// Fails with [Error::ScheduledForRemoval] once removal has been scheduled.
    pub fn acquire_read_lock(&self) -> Result<(), Error> {
        let count = {
            let _lifetime = self.lifetime.read().unwrap();
            if self.remove_scheduled.load(Ordering::SeqCst) {
                return Err(Error::ScheduledForRemoval(self.id));
            }
            self.reader_sweep_latch.fetch_add(2, Ordering::SeqCst);
            self.read_locks.fetch_add(1, Ordering::SeqCst) + 1
        };
        trace!(chunk = %self.id, count, "chunk read lock acquired");
        Ok(())
    }

    /// Release a read lock.
    ///
    /// Releasing the last read lock schedules a reader sweep and, if removal was scheduled and
    /// no update lock is held, starts removal.
    ///
    /// # Panics
    ///
    /// Panics if no read lock is held.
    pub fn release_read_lock(self: &Arc<Self>) {
        let mut remove_now = false;
        let mut schedule_sweep = false;
        let count = {
            let _lifetime = self.lifetime.read().unwrap();
            let previous = self.read_locks.fetch_sub(1, Ordering::SeqCst);
            assert!(previous > 0, "read lock is not held");
            let count = previous - 1;
            if count == 0 {
                if self.update_locks.load(Ordering::SeqCst) == 0
                    && self.remove_scheduled.load(Ordering::SeqCst)
                {
                    remove_now = !self.removing.swap(true, Ordering::SeqCst);
                }
                schedule_sweep = self.reader_sweep_latch.swap(1, Ordering::SeqCst) & 1 == 0;
            }
            count
        };
        trace!(chunk = %self.id, count, "chunk read lock released");

        if schedule_sweep {
            if let Some(owner) = self.owner.upgrade() {
                owner.schedule_reader_sweep(self.clone());
            }
        }
        if remove_now {
            self.start_async_remove();
        }
    }

    /// Lock the chunk for an in-place update. At most one update lock is held at a time.
    ///
    /// Fails with [Error::ScheduledForRemoval] once removal has been scheduled and with
    /// [Error::ConcurrentChunkUpdate] if another update lock is held.
    pub fn acquire_update_lock(&self) -> Result<(), Error> {
        {
            let _lifetime = self.lifetime.write().unwrap();
            if self.remove_scheduled.load(Ordering::SeqCst) {
                return Err(Error::ScheduledForRemoval(self.id));
            }
            if self.update_locks.load(Ordering::SeqCst) > 0 {
                return Err(Error::ConcurrentChunkUpdate(self.id));
            }
            self.update_locks.store(1, Ordering::SeqCst);
        }
        debug!(chunk = %self.id, "chunk update lock acquired");
        Ok(())
    }

    /// Release the update lock, starting removal if it was scheduled and no reader remains.
    ///
    /// # Panics
    ///
    /// Panics if the update lock is not held.
    pub fn release_update_lock(self: &Arc<Self>) {
        let remove_now = {
            let _lifetime = self.lifetime.write().unwrap();
            let previous = self.update_locks.swap(0, Ordering::SeqCst);
            assert_eq!(previous, 1, "update lock is not held");
            self.read_locks.load(Ordering::SeqCst) == 0
                && self.remove_scheduled.load(Ordering::SeqCst)
                && !self.removing.swap(true, Ordering::SeqCst)
        };
        debug!(chunk = %self.id, "chunk update lock released");
        if remove_now {
            self.start_async_remove();
        }
    }

    /// Request removal of the chunk.
    ///
    /// Removal starts as soon as no lock is held. The returned future resolves once the chunk has
    /// been removed from disk, unregistered and purged from the caches. Calling this again returns
    /// the same future. Dropping the future does not cancel removal.
    pub fn schedule_remove(self: &Arc<Self>) -> Removal {
        let (removal, remove_now) = {
            let mut lifetime = self.lifetime.write().unwrap();
            if let Some(removal) = &lifetime.removal {
                return removal.clone();
            }
            let (sender, receiver) = oneshot::channel();
            let removal: Removal = receiver
                .map(|result| result.unwrap_or(Err(Error::Shutdown)))
                .boxed()
                .shared();
            lifetime.removal = Some(removal.clone());
            lifetime.completion = Some(sender);
            self.remove_scheduled.store(true, Ordering::SeqCst);

            let remove_now = self.read_locks.load(Ordering::SeqCst) == 0
                && self.update_locks.load(Ordering::SeqCst) == 0
                && !self.removing.swap(true, Ordering::SeqCst);
            (removal, remove_now)
        };
        debug!(chunk = %self.id, remove_now, "chunk removal scheduled");
        if remove_now {
            self.start_async_remove();
        }
        removal
    }

    /// Returns true once removal has been requested (it stays true after removal completes).
    pub fn is_remove_scheduled(&self) -> bool {
        self.remove_scheduled.load(Ordering::SeqCst)
    }

    /// The current lifecycle state.
    pub fn state(&self) -> State {
        if self.removed.load(Ordering::SeqCst) {
            State::Removed
        } else if self.removing.load(Ordering::SeqCst) {
            State::Removing
        } else if self.remove_scheduled.load(Ordering::SeqCst) {
            State::RemoveScheduled
        } else {
            State::Live
        }
    }

    /// Number of read locks held.
    pub fn read_lock_count(&self) -> usize {
        self.read_locks.load(Ordering::SeqCst)
    }

    /// Returns true if the update lock is held.
    pub fn is_update_locked(&self) -> bool {
        self.update_locks.load(Ordering::SeqCst) > 0
    }

    /// Version of the chunk content, bumped by every in-place update.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Bump the version of the chunk content and return the new version.
    ///
    /// # Panics
    ///
    /// Panics if the update lock is not held.
    pub fn increment_version(&self) -> u64 {
        assert!(self.is_update_locked(), "update lock is not held");
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(chunk = %self.id, version, "chunk version incremented");
        version
    }

    /// Release the cached reader if no read lock was acquired since the sweep was scheduled.
    ///
    /// If readers are active, the sweep is dropped and rescheduled when the last one releases its
    /// lock. If a reader came and went since the sweep was scheduled, the sweep is rescheduled.
    /// Once removal has started the reader is already closed and the sweep does nothing.
    pub fn try_sweep_reader(self: &Arc<Self>) {
        let lifetime = self.lifetime.write().unwrap();
        if self.removing.load(Ordering::SeqCst) {
            return;
        }
        let latch = self.reader_sweep_latch.load(Ordering::SeqCst);
        if latch & 1 == 0 {
            return;
        }
        if self.read_locks.load(Ordering::SeqCst) > 0 {
            self.reader_sweep_latch.store(latch & !1, Ordering::SeqCst);
            return;
        }
        if latch != 1 {
            self.reader_sweep_latch.store(1, Ordering::SeqCst);
            drop(lifetime);
            trace!(chunk = %self.id, "reader sweep rescheduled");
            if let Some(owner) = self.owner.upgrade() {
                owner.schedule_reader_sweep(self.clone());
            }
            return;
        }
        self.reader_sweep_latch.store(0, Ordering::SeqCst);
        self.release_reader(&lifetime);
    }

    /// Close the cached reader. Only invoked under the lifetime write lock, so no read lock can
    /// be acquired concurrently.
    fn release_reader(&self, _lifetime: &RwLockWriteGuard<'_, Lifetime>) {
        match self.kind {
            Kind::Blob => {
                if let Some(owner) = self.owner.upgrade() {
                    owner.close_reader(&self.location, self.id);
                }
                trace!(chunk = %self.id, "chunk reader released");
            }
            Kind::Journal => {}
        }
    }

    fn start_async_remove(self: &Arc<Self>) {
        let completion = {
            let mut lifetime = self.lifetime.write().unwrap();
            self.reader_sweep_latch.store(0, Ordering::SeqCst);
            self.release_reader(&lifetime);
            lifetime.completion.take()
        };
        let Some(completion) = completion else {
            unreachable!("removal started twice");
        };
        debug!(chunk = %self.id, "chunk removal started");
        match self.owner.upgrade() {
            Some(owner) => owner.start_remove(self.clone(), completion),
            None => self.finish_remove(completion, Err(Error::Shutdown)),
        }
    }

    /// Mark the chunk as removed and resolve the [Removal] with `result`.
    pub(crate) fn finish_remove(&self, completion: Completion, result: Result<(), Error>) {
        self.removed.store(true, Ordering::SeqCst);
        match &result {
            Ok(()) => debug!(chunk = %self.id, "chunk removed"),
            Err(err) => warn!(chunk = %self.id, %err, "chunk removal failed"),
        }
        let _ = completion.send(result);
    }
}
