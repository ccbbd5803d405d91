//! In-memory [IoEngine] for tests.

use crate::{
    chunk::Location,
    io::IoEngine,
    meta::{BlockInfo, BlocksExt, Meta},
    BlockId, ChunkId, Error,
};
use bytes::Bytes;
use commonware_runtime::Clock;
use std::{
    collections::{BTreeMap, HashMap},
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

struct Stored {
    blocks: Vec<Bytes>,
    extensions: BTreeMap<u32, Bytes>,
}

#[derive(Default)]
struct State {
    chunks: HashMap<ChunkId, Stored>,

    block_reads: HashMap<BlockId, usize>,
    range_reads: usize,
    meta_reads: usize,
    removed: Vec<ChunkId>,
    closed_readers: Vec<ChunkId>,

    fail_reads: bool,
    fail_removals: bool,
}

/// An [IoEngine] that serves chunks from memory after a fixed latency.
#[derive(Clone)]
pub struct Engine<E: Clock> {
    context: E,
    latency: Duration,
    state: Arc<Mutex<State>>,
}

impl<E: Clock> Engine<E> {
    pub fn new(context: E, latency: Duration) -> Self {
        Self {
            context,
            latency,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Store a chunk made of `blocks`.
    pub fn insert_chunk(&self, chunk: ChunkId, blocks: Vec<Bytes>) {
        self.insert_chunk_with_extensions(chunk, blocks, BTreeMap::new());
    }

    /// Store a chunk made of `blocks` with metadata `extensions`.
    pub fn insert_chunk_with_extensions(
        &self,
        chunk: ChunkId,
        blocks: Vec<Bytes>,
        extensions: BTreeMap<u32, Bytes>,
    ) {
        self.state.lock().unwrap().chunks.insert(
            chunk,
            Stored {
                blocks,
                extensions,
            },
        );
    }

    /// Number of times `block` was read individually.
    pub fn block_reads(&self, block: BlockId) -> usize {
        let state = self.state.lock().unwrap();
        state.block_reads.get(&block).copied().unwrap_or(0)
    }

    /// Number of range reads.
    pub fn range_reads(&self) -> usize {
        self.state.lock().unwrap().range_reads
    }

    /// Number of metadata reads.
    pub fn meta_reads(&self) -> usize {
        self.state.lock().unwrap().meta_reads
    }

    /// Chunks removed (in order of removal, including failed attempts).
    pub fn removed(&self) -> Vec<ChunkId> {
        self.state.lock().unwrap().removed.clone()
    }

    /// Chunks whose reader was closed (in order).
    pub fn closed_readers(&self) -> Vec<ChunkId> {
        self.state.lock().unwrap().closed_readers.clone()
    }

    /// Fail every subsequent read.
    pub fn set_fail_reads(&self, fail: bool) {
        self.state.lock().unwrap().fail_reads = fail;
    }

    /// Fail every subsequent removal.
    pub fn set_fail_removals(&self, fail: bool) {
        self.state.lock().unwrap().fail_removals = fail;
    }
}

fn failure(operation: &str) -> Error {
    io::Error::other(format!("{operation} failed")).into()
}

impl<E: Clock> IoEngine for Engine<E> {
    async fn read_block(
        &self,
        _location: &Location,
        chunk: ChunkId,
        index: u32,
        _priority: i64,
    ) -> Result<Bytes, Error> {
        self.context.sleep(self.latency).await;
        let mut state = self.state.lock().unwrap();
        let block = BlockId::new(chunk, index);
        *state.block_reads.entry(block).or_default() += 1;
        if state.fail_reads {
            return Err(failure("read"));
        }
        let stored = state.chunks.get(&chunk).ok_or(Error::NoSuchChunk(chunk))?;
        stored
            .blocks
            .get(index as usize)
            .cloned()
            .ok_or(Error::NoSuchBlock(block))
    }

    async fn read_blocks(
        &self,
        _location: &Location,
        chunk: ChunkId,
        first: u32,
        count: u32,
        _priority: i64,
    ) -> Result<Vec<Bytes>, Error> {
        self.context.sleep(self.latency).await;
        let mut state = self.state.lock().unwrap();
        state.range_reads += 1;
        if state.fail_reads {
            return Err(failure("read"));
        }
        let stored = state.chunks.get(&chunk).ok_or(Error::NoSuchChunk(chunk))?;
        Ok(stored
            .blocks
            .iter()
            .skip(first as usize)
            .take(count as usize)
            .cloned()
            .collect())
    }

    async fn read_meta(&self, _location: &Location, chunk: ChunkId) -> Result<Meta, Error> {
        self.context.sleep(self.latency).await;
        let mut state = self.state.lock().unwrap();
        state.meta_reads += 1;
        if state.fail_reads {
            return Err(failure("read"));
        }
        let stored = state.chunks.get(&chunk).ok_or(Error::NoSuchChunk(chunk))?;
        let blocks = stored
            .blocks
            .iter()
            .map(|block| BlockInfo {
                size: block.len() as u64,
                checksum: block.iter().fold(0u32, |sum, byte| {
                    sum.wrapping_mul(31).wrapping_add(*byte as u32)
                }),
            })
            .collect();
        Ok(Meta::new(BlocksExt::new(blocks), stored.extensions.clone()))
    }

    async fn remove_chunk(&self, _location: &Location, chunk: ChunkId) -> Result<(), Error> {
        self.context.sleep(self.latency).await;
        let mut state = self.state.lock().unwrap();
        state.removed.push(chunk);
        if state.fail_removals {
            return Err(failure("remove"));
        }
        state.chunks.remove(&chunk);
        Ok(())
    }

    fn close_reader(&self, _location: &Location, chunk: ChunkId) {
        self.state.lock().unwrap().closed_readers.push(chunk);
    }
}
