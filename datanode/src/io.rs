//! Interface to the engine that performs physical chunk I/O.
//!
//! The node never touches chunk files directly. Reads, metadata loads and removals are delegated
//! to an [IoEngine], which may take arbitrarily long and may fail. Callers never hold a lock while
//! awaiting the engine.

use crate::{chunk::Location, meta::Meta, ChunkId, Error};
use bytes::Bytes;
use std::future::Future;

/// Reads and removes chunks stored in a [Location].
pub trait IoEngine: Clone + Send + Sync + 'static {
    /// Read a single block of a chunk.
    ///
    /// Requests with a higher `priority` should be served first.
    fn read_block(
        &self,
        location: &Location,
        chunk: ChunkId,
        index: u32,
        priority: i64,
    ) -> impl Future<Output = Result<Bytes, Error>> + Send;

    /// Read up to `count` consecutive blocks of a chunk starting at `first`.
    ///
    /// Fewer blocks are returned if the chunk ends before `first + count`.
    fn read_blocks(
        &self,
        location: &Location,
        chunk: ChunkId,
        first: u32,
        count: u32,
        priority: i64,
    ) -> impl Future<Output = Result<Vec<Bytes>, Error>> + Send;

    /// Read the metadata of a chunk.
    fn read_meta(
        &self,
        location: &Location,
        chunk: ChunkId,
    ) -> impl Future<Output = Result<Meta, Error>> + Send;

    /// Remove a chunk from its location.
    fn remove_chunk(
        &self,
        location: &Location,
        chunk: ChunkId,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Release any reader state (such as an open file handle) kept for a chunk.
    ///
    /// Must not block.
    fn close_reader(&self, location: &Location, chunk: ChunkId);
}
