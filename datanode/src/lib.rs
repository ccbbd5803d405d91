//! Cache chunk content and coordinate chunk lifetimes on a storage node.
//!
//! A storage node serves immutable blocks of the chunks it hosts. This crate keeps recently used
//! blocks and chunk metadata in memory, deduplicates concurrent fetches of the same content, and
//! makes sure a chunk is never physically removed while a reader or updater still holds it.
//!
//! # Overview
//!
//! - [cache::WeightedCache]: a weight-bounded, single-flight cache used for blocks and metadata.
//! - [meta::Manager]: caches of chunk metadata and block indexes.
//! - [block::Cache]: the cache of individual blocks.
//! - [chunk::Chunk]: a chunk resident on the node, with read/update locks and deferred removal.
//! - [chunk::Registry]: lookup of resident chunks and scheduling of reader sweeps.
//! - [store::Store]: the entrypoint used by the node's service layer to read and put blocks.
//!
//! Physical I/O is delegated to an [io::IoEngine] and memory accounting to a
//! [memory::MemoryTracker].
//!
//! # Status
//!
//! `commonware-datanode` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

use std::{fmt, sync::Arc};
use thiserror::Error;

pub mod block;
pub mod cache;
pub mod chunk;
pub mod io;
pub mod memory;
pub mod meta;
pub mod store;

#[cfg(test)]
pub mod mocks;

/// Errors that can occur when interacting with the node's chunks and caches.
///
/// Errors are cloned to every caller waiting on a shared fetch, so variants only carry
/// cheaply cloneable payloads.
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("no such chunk: {0}")]
    NoSuchChunk(ChunkId),
    #[error("chunk {0} is scheduled for removal")]
    ScheduledForRemoval(ChunkId),
    #[error("chunk {0} is already locked by another update")]
    ConcurrentChunkUpdate(ChunkId),
    #[error("chunk already registered: {0}")]
    ChunkExists(ChunkId),
    #[error("no such block: {0}")]
    NoSuchBlock(BlockId),
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
    #[error("cache insertion aborted")]
    InsertAborted,
    #[error("memory limit exceeded: requested {requested}, available {available}")]
    MemoryLimitExceeded { requested: u64, available: u64 },
    #[error("shutdown")]
    Shutdown,
}

impl Error {
    /// Returns true if the chunk should be treated as absent from this node (either unknown or
    /// already scheduled for removal). Callers typically retry against another replica.
    pub fn is_no_such_chunk(&self) -> bool {
        matches!(self, Error::NoSuchChunk(_) | Error::ScheduledForRemoval(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

/// Stable identifier of a chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(u128);

impl ChunkId {
    /// Create a new [ChunkId] from its raw value.
    pub const fn new(value: u128) -> Self {
        Self(value)
    }

    /// Returns the raw value of the identifier.
    pub const fn value(&self) -> u128 {
        self.0
    }

    /// Returns the low byte of the identifier (used to shard chunk files across directories).
    pub const fn low_byte(&self) -> u8 {
        self.0 as u8
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", commonware_utils::hex(&self.0.to_be_bytes()))
    }
}

/// Identifier of a block within a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId {
    /// The chunk containing the block.
    pub chunk: ChunkId,

    /// The index of the block within the chunk.
    pub index: u32,
}

impl BlockId {
    /// Create a new [BlockId].
    pub const fn new(chunk: ChunkId, index: u32) -> Self {
        Self { chunk, index }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chunk, self.index)
    }
}
