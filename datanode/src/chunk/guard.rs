use super::Chunk;
use crate::Error;
use std::sync::Arc;

/// A read lock on a [Chunk], released on drop.
pub struct ReadGuard {
    chunk: Arc<Chunk>,
}

impl ReadGuard {
    /// Acquire a read lock on `chunk`.
    pub fn acquire(chunk: Arc<Chunk>) -> Result<Self, Error> {
        chunk.acquire_read_lock()?;
        Ok(Self { chunk })
    }

    /// The locked chunk.
    pub fn chunk(&self) -> &Arc<Chunk> {
        &self.chunk
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.chunk.release_read_lock();
    }
}

/// The update lock of a [Chunk], released on drop.
pub struct UpdateGuard {
    chunk: Arc<Chunk>,
}

impl UpdateGuard {
    /// Acquire the update lock of `chunk`.
    pub fn acquire(chunk: Arc<Chunk>) -> Result<Self, Error> {
        chunk.acquire_update_lock()?;
        Ok(Self { chunk })
    }

    /// The locked chunk.
    pub fn chunk(&self) -> &Arc<Chunk> {
        &self.chunk
    }
}

impl Drop for UpdateGuard {
    fn drop(&mut self) {
        self.chunk.release_update_lock();
    }
}
