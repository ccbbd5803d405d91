//! Coordinate the lifetime of chunks resident on the node.
//!
//! # Locks
//!
//! A [Chunk] is pinned by _read locks_ (any number of concurrent holders) and by an _update
//! lock_ (a single holder performing an in-place mutation). A second update lock is refused
//! with [crate::Error::ConcurrentChunkUpdate]. [ReadGuard] and [UpdateGuard] release their lock
//! when dropped.
//!
//! # Removal
//!
//! [Chunk::schedule_remove] only records the request. The chunk moves through
//! [State::RemoveScheduled] (no new lock can be acquired), [State::Removing] (the last lock was
//! released and the [crate::io::IoEngine] is deleting the chunk) and finally [State::Removed]
//! (the chunk is unregistered and its cached metadata and blocks are purged). Physical removal
//! never starts while any lock is held and, once started, cannot be canceled by callers.
//!
//! # Reader Sweeps
//!
//! Blob chunks keep a reader (such as an open file) across read locks. When the last read lock is
//! released, the [Registry] schedules a sweep that closes the reader after a grace period unless
//! new readers show up in the meantime. Sweeps are coalesced with a latch: every read lock adds 2,
//! the low bit marks a pending sweep, and a sweep that finds the latch dirty reschedules itself.

use crate::{ChunkId, Error};
use futures::future::{BoxFuture, Shared};
use std::{path::PathBuf, time::Duration};

mod guard;
pub use guard::{ReadGuard, UpdateGuard};
mod handle;
pub use handle::Chunk;
mod metrics;
mod registry;
pub use registry::Registry;

/// Future resolving once a chunk has been removed. Cloning it (or scheduling removal again)
/// yields the same outcome.
pub type Removal = Shared<BoxFuture<'static, Result<(), Error>>>;

/// Configuration for the [Registry].
#[derive(Clone, Debug)]
pub struct Config {
    /// Time to wait after the last read lock is released before closing a chunk's reader.
    pub reader_sweep_grace: Duration,
}

/// Storage directory hosting chunks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    /// Name of the location.
    pub id: String,

    /// Root directory of the location.
    pub root: PathBuf,
}

impl Location {
    /// Create a new [Location].
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
        }
    }

    /// Path of the file storing `chunk`, sharded by the low byte of its id.
    pub fn chunk_path(&self, chunk: ChunkId) -> PathBuf {
        self.root
            .join(format!("{:02x}", chunk.low_byte()))
            .join(chunk.to_string())
    }
}

/// Storage backend of a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Immutable chunk read through a cached reader.
    Blob,
    /// Append-style chunk without a cached reader.
    Journal,
}

/// Lifecycle state of a [Chunk].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    /// Locks may be acquired.
    Live,
    /// Removal was requested and waits for held locks to be released.
    RemoveScheduled,
    /// The chunk is being removed.
    Removing,
    /// The chunk was removed.
    Removed,
}
