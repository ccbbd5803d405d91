//! Serve blocks and metadata of the chunks resident on the node.
//!
//! [Store] is the entrypoint used by the node's service layer. It wires the block cache, the
//! metadata caches and the chunk [crate::chunk::Registry] to an [crate::io::IoEngine]:
//!
//! - [Store::get_block] consults the block cache first. On a miss, exactly one caller acquires a
//!   read lock on the chunk (failing if the chunk is unknown or scheduled for removal) and reads
//!   the block in a spawned task. Every concurrent caller for the same block receives the outcome
//!   of that read.
//! - [Store::get_blocks] reads a range of blocks under a read lock without touching the cache.
//! - [Store::put_block] caches a block received from a peer.
//! - [Store::get_meta] loads chunk metadata with the same single-flight discipline as blocks.
//!
//! A failed read is delivered to every waiter but never cached, so a later call retries.
//!
//! # Example
//!
//! ```rust
//! use bytes::Bytes;
//! use commonware_datanode::{
//!     cache,
//!     chunk::{Kind, Location},
//!     io::IoEngine,
//!     memory::Tracker,
//!     meta::Meta,
//!     store::{Config, Store},
//!     ChunkId, Error,
//! };
//! use commonware_runtime::{deterministic, Metrics, Runner};
//! use std::{sync::Arc, time::Duration};
//!
//! #[derive(Clone)]
//! struct Zeros;
//!
//! impl IoEngine for Zeros {
//!     async fn read_block(&self, _: &Location, _: ChunkId, _: u32, _: i64) -> Result<Bytes, Error> {
//!         Ok(Bytes::from(vec![0; 16]))
//!     }
//!
//!     async fn read_blocks(
//!         &self,
//!         _: &Location,
//!         _: ChunkId,
//!         _: u32,
//!         count: u32,
//!         _: i64,
//!     ) -> Result<Vec<Bytes>, Error> {
//!         Ok(vec![Bytes::from(vec![0; 16]); count as usize])
//!     }
//!
//!     async fn read_meta(&self, _: &Location, _: ChunkId) -> Result<Meta, Error> {
//!         Ok(Meta::default())
//!     }
//!
//!     async fn remove_chunk(&self, _: &Location, _: ChunkId) -> Result<(), Error> {
//!         Ok(())
//!     }
//!
//!     fn close_reader(&self, _: &Location, _: ChunkId) {}
//! }
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     let tracker = Tracker::new(context.with_label("memory"), 1024 * 1024);
//!     let cache = cache::Config { capacity: 64 * 1024, younger_size_fraction: 0.25 };
//!     let store = Store::new(
//!         context.with_label("store"),
//!         Zeros,
//!         &tracker,
//!         Config {
//!             block_cache: cache.clone(),
//!             meta_cache: cache.clone(),
//!             blocks_ext_cache: cache,
//!             reader_sweep_grace: Duration::from_secs(10),
//!         },
//!     );
//!
//!     let chunk = ChunkId::new(1);
//!     let location = Arc::new(Location::new("disk0", "/data/disk0"));
//!     store.registry().register(chunk, location, Kind::Blob).unwrap();
//!
//!     let block = store.get_block(chunk, 0, 0).await.unwrap();
//!     assert_eq!(block.len(), 16);
//!     assert_eq!(store.find_block(chunk, 0), Some(block));
//! });
//! ```

use crate::cache;
use std::time::Duration;

mod metrics;
mod storage;
pub use storage::Store;

/// Configuration for the [Store].
#[derive(Clone, Debug)]
pub struct Config {
    /// Configuration of the block cache.
    pub block_cache: cache::Config,

    /// Configuration of the chunk metadata cache.
    pub meta_cache: cache::Config,

    /// Configuration of the block index cache.
    pub blocks_ext_cache: cache::Config,

    /// Time to wait after the last read lock of a chunk is released before closing its reader.
    pub reader_sweep_grace: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chunk::{Kind, Location, ReadGuard},
        memory::{Category, Tracker},
        mocks::Engine,
        BlockId, ChunkId, Error,
    };
    use bytes::Bytes;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Clock, Metrics, Runner, Spawner};
    use futures::future::{self, join_all, Either};
    use std::{collections::BTreeMap, sync::Arc};

    const LATENCY: Duration = Duration::from_millis(10);
    const A_JIFFY: Duration = Duration::from_millis(1);

    type TestStore = Store<deterministic::Context, Engine<deterministic::Context>>;

    fn blocks(count: u8) -> Vec<Bytes> {
        (0..count).map(|i| Bytes::from(vec![i; 64])).collect()
    }

    fn setup(
        context: &deterministic::Context,
    ) -> (TestStore, Engine<deterministic::Context>, Tracker) {
        let tracker = Tracker::new(context.with_label("memory"), 1024 * 1024);
        let engine = Engine::new(context.with_label("engine"), LATENCY);
        let cache = cache::Config {
            capacity: 64 * 1024,
            younger_size_fraction: 0.25,
        };
        let store = Store::new(
            context.with_label("store"),
            engine.clone(),
            &tracker,
            Config {
                block_cache: cache.clone(),
                meta_cache: cache.clone(),
                blocks_ext_cache: cache,
                reader_sweep_grace: Duration::from_secs(1),
            },
        );
        (store, engine, tracker)
    }

    fn register(store: &TestStore, engine: &Engine<deterministic::Context>, chunk: ChunkId) {
        engine.insert_chunk(chunk, blocks(8));
        let location = Arc::new(Location::new("disk0", "/data/disk0"));
        store
            .registry()
            .register(chunk, location, Kind::Blob)
            .unwrap();
    }

    #[test_traced]
    fn test_get_block_single_flight() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (store, engine, tracker) = setup(&context);
            let chunk = ChunkId::new(1);
            register(&store, &engine, chunk);

            let mut handles = Vec::new();
            for i in 0..10 {
                let store = store.clone();
                handles.push(
                    context
                        .with_label(&format!("reader_{i}"))
                        .spawn(move |_| async move { store.get_block(chunk, 3, i).await }),
                );
            }
            for result in join_all(handles).await {
                assert_eq!(result.unwrap().unwrap(), Bytes::from(vec![3; 64]));
            }
            assert_eq!(engine.block_reads(BlockId::new(chunk, 3)), 1);

            // Served from the cache afterwards
            assert_eq!(store.get_block(chunk, 3, 0).await.unwrap(), Bytes::from(vec![3; 64]));
            assert_eq!(engine.block_reads(BlockId::new(chunk, 3)), 1);
            assert_eq!(store.cached_blocks(), vec![BlockId::new(chunk, 3)]);
            assert_eq!(tracker.category_used(Category::BlockCache), 64);

            let buffer = context.encode();
            assert!(buffer.contains("store_block_reads_total 1"));
            assert!(buffer.contains("store_inflight 0"));

            // Joining an in-flight read is neither a hit nor a miss
            assert!(buffer.contains("store_block_cache_misses_total 1"));
            assert!(buffer.contains("store_block_cache_hits_total 1"));
        });
    }

    #[test_traced]
    fn test_get_block_read_lock_held_while_reading() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (store, engine, _) = setup(&context);
            let chunk = ChunkId::new(1);
            register(&store, &engine, chunk);
            let handle = context.with_label("reader").spawn({
                let store = store.clone();
                move |_| async move { store.get_block(chunk, 0, 0).await }
            });
            context.sleep(A_JIFFY).await;
            let registered = store.registry().get(chunk).unwrap();
            assert_eq!(registered.read_lock_count(), 1);

            handle.await.unwrap().unwrap();
            assert_eq!(registered.read_lock_count(), 0);
        });
    }

    #[test_traced]
    fn test_get_block_not_canceled_by_caller() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (store, engine, _) = setup(&context);
            let chunk = ChunkId::new(1);
            register(&store, &engine, chunk);

            // Abandon the read before it completes
            let read = Box::pin(store.get_block(chunk, 5, 0));
            let timeout = Box::pin(context.sleep(A_JIFFY));
            assert!(matches!(future::select(read, timeout).await, Either::Right(_)));

            context.sleep(LATENCY * 2).await;
            assert_eq!(store.find_block(chunk, 5), Some(Bytes::from(vec![5; 64])));
            assert_eq!(engine.block_reads(BlockId::new(chunk, 5)), 1);
            assert_eq!(store.registry().get(chunk).unwrap().read_lock_count(), 0);
        });
    }

    #[test_traced]
    fn test_get_block_unknown_chunk() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (store, engine, _) = setup(&context);
            let chunk = ChunkId::new(1);
            let err = store.get_block(chunk, 0, 0).await.unwrap_err();
            assert!(matches!(err, Error::NoSuchChunk(c) if c == chunk));
            assert!(store.find_block(chunk, 0).is_none());

            // The failure is not cached
            register(&store, &engine, chunk);
            assert_eq!(store.get_block(chunk, 0, 0).await.unwrap(), Bytes::from(vec![0; 64]));
        });
    }

    #[test_traced]
    fn test_get_block_scheduled_for_removal() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (store, engine, _) = setup(&context);
            let chunk = ChunkId::new(1);
            register(&store, &engine, chunk);

            let registered = store.registry().get(chunk).unwrap();
            let guard = ReadGuard::acquire(registered.clone()).unwrap();
            let removal = registered.schedule_remove();

            let err = store.get_block(chunk, 0, 0).await.unwrap_err();
            assert!(matches!(err, Error::ScheduledForRemoval(c) if c == chunk));
            assert!(err.is_no_such_chunk());
            assert!(store.get_blocks(chunk, 0, 2, 0).await.is_err());
            assert!(store.get_meta(chunk).await.is_err());
            assert_eq!(engine.block_reads(BlockId::new(chunk, 0)), 0);

            drop(guard);
            removal.await.unwrap();
            assert!(matches!(
                store.get_block(chunk, 0, 0).await,
                Err(Error::NoSuchChunk(_))
            ));
        });
    }

    #[test_traced]
    fn test_removal_waits_for_inflight_read() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (store, engine, _) = setup(&context);
            let chunk = ChunkId::new(1);
            register(&store, &engine, chunk);

            let handle = context.with_label("reader").spawn({
                let store = store.clone();
                move |_| async move { store.get_block(chunk, 1, 0).await }
            });
            context.sleep(A_JIFFY).await;
            let removal = store.registry().schedule_remove(chunk).unwrap();

            // The read started before removal was scheduled, so it completes
            assert_eq!(handle.await.unwrap().unwrap(), Bytes::from(vec![1; 64]));
            removal.await.unwrap();
            assert_eq!(engine.removed(), vec![chunk]);

            // Removal purged the block read just before
            assert!(store.find_block(chunk, 1).is_none());
            assert!(store.blocks().is_empty());
        });
    }

    #[test_traced]
    fn test_cached_block_served_for_unknown_chunk() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (store, engine, _) = setup(&context);
            let chunk = ChunkId::new(7);
            let data = Bytes::from_static(b"peered");
            let cached = store
                .put_block(chunk, 0, data.clone(), Some("10.0.0.2:9012".into()))
                .await;
            assert_eq!(cached, data);
            assert_eq!(store.get_block(chunk, 0, 0).await.unwrap(), data);
            assert_eq!(engine.block_reads(BlockId::new(chunk, 0)), 0);

            // Identical content is accepted again
            store.put_block(chunk, 0, data.clone(), None).await;
            assert_eq!(store.blocks().len(), 1);
        });
    }

    #[test_traced]
    #[should_panic(expected = "different content cached for key")]
    fn test_put_block_content_mismatch() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (store, engine, _) = setup(&context);
            let chunk = ChunkId::new(1);
            register(&store, &engine, chunk);
            store.get_block(chunk, 2, 0).await.unwrap();
            store
                .put_block(chunk, 2, Bytes::from_static(b"corrupted"), None)
                .await;
        });
    }

    #[test_traced]
    fn test_put_block_joins_inflight_read() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (store, engine, _) = setup(&context);
            let chunk = ChunkId::new(1);
            register(&store, &engine, chunk);

            let handle = context.with_label("reader").spawn({
                let store = store.clone();
                move |_| async move { store.get_block(chunk, 4, 0).await }
            });
            context.sleep(A_JIFFY).await;

            // The put waits for the read and compares the content it produced
            let cached = store
                .put_block(chunk, 4, Bytes::from(vec![4; 64]), None)
                .await;
            assert_eq!(cached, Bytes::from(vec![4; 64]));
            assert_eq!(handle.await.unwrap().unwrap(), cached);
            assert_eq!(engine.block_reads(BlockId::new(chunk, 4)), 1);
        });
    }

    #[test_traced]
    fn test_io_failure_not_cached() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (store, engine, _) = setup(&context);
            let chunk = ChunkId::new(1);
            register(&store, &engine, chunk);
            engine.set_fail_reads(true);

            let mut handles = Vec::new();
            for i in 0..3 {
                let store = store.clone();
                handles.push(
                    context
                        .with_label(&format!("reader_{i}"))
                        .spawn(move |_| async move { store.get_block(chunk, 0, 0).await }),
                );
            }
            for result in join_all(handles).await {
                assert!(matches!(result.unwrap(), Err(Error::Io(_))));
            }
            assert_eq!(engine.block_reads(BlockId::new(chunk, 0)), 1);
            assert!(store.find_block(chunk, 0).is_none());

            engine.set_fail_reads(false);
            assert_eq!(store.get_block(chunk, 0, 0).await.unwrap(), Bytes::from(vec![0; 64]));
            assert_eq!(engine.block_reads(BlockId::new(chunk, 0)), 2);

            let buffer = context.encode();
            assert!(buffer.contains("store_read_failures_total 1"));
        });
    }

    #[test_traced]
    fn test_get_blocks_bypasses_cache() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (store, engine, _) = setup(&context);
            let chunk = ChunkId::new(1);
            register(&store, &engine, chunk);

            let range = store.get_blocks(chunk, 2, 3, 0).await.unwrap();
            assert_eq!(range, blocks(8)[2..5].to_vec());
            assert!(store.blocks().is_empty());
            assert_eq!(engine.range_reads(), 1);

            // Ranges past the end of the chunk are truncated
            let range = store.get_blocks(chunk, 6, 5, 0).await.unwrap();
            assert_eq!(range.len(), 2);
            assert_eq!(store.registry().get(chunk).unwrap().read_lock_count(), 0);

            assert!(matches!(
                store.get_blocks(ChunkId::new(2), 0, 1, 0).await,
                Err(Error::NoSuchChunk(_))
            ));
        });
    }

    #[test_traced]
    fn test_get_meta_single_flight() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (store, engine, tracker) = setup(&context);
            let chunk = ChunkId::new(1);
            engine.insert_chunk_with_extensions(
                chunk,
                blocks(4),
                BTreeMap::from([(1, Bytes::from_static(b"schema"))]),
            );
            let location = Arc::new(Location::new("disk0", "/data/disk0"));
            store
                .registry()
                .register(chunk, location, Kind::Blob)
                .unwrap();

            let mut handles = Vec::new();
            for i in 0..2 {
                let store = store.clone();
                handles.push(
                    context
                        .with_label(&format!("caller_{i}"))
                        .spawn(move |_| async move { store.get_meta(chunk).await }),
                );
            }
            let metas: Vec<_> = join_all(handles)
                .await
                .into_iter()
                .map(|result| result.unwrap().unwrap())
                .collect();
            assert_eq!(engine.meta_reads(), 1);
            assert!(Arc::ptr_eq(&metas[0], &metas[1]));
            assert_eq!(metas[0].blocks.block_count(), 4);
            assert_eq!(metas[0].extensions[&1], Bytes::from_static(b"schema"));

            // The block index is cached alongside
            let blocks_ext = store.get_blocks_ext(chunk).await.unwrap();
            assert!(Arc::ptr_eq(&blocks_ext, &metas[0].blocks));
            assert_eq!(engine.meta_reads(), 1);
            assert!(tracker.category_used(Category::ChunkMeta) > 0);
            assert!(tracker.category_used(Category::ChunkBlocksExt) > 0);

            // Filtered lookups keep only the requested extensions
            let filtered = store.meta().find_cached_meta(chunk, Some(&[2])).unwrap();
            assert!(filtered.extensions.is_empty());
        });
    }

    #[test_traced]
    fn test_get_meta_failure_not_cached() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (store, engine, _) = setup(&context);
            let chunk = ChunkId::new(1);
            register(&store, &engine, chunk);
            engine.set_fail_reads(true);
            assert!(matches!(store.get_meta(chunk).await, Err(Error::Io(_))));
            assert!(store.meta().find_cached_meta(chunk, None).is_none());

            engine.set_fail_reads(false);
            assert_eq!(store.get_meta(chunk).await.unwrap().blocks.block_count(), 8);
            assert_eq!(engine.meta_reads(), 2);
        });
    }

    #[test_traced]
    fn test_memory_limit_bounds_block_cache() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (store, engine, tracker) = setup(&context);
            let chunk = ChunkId::new(1);
            register(&store, &engine, chunk);

            // Shrink the category below the cache capacity
            tracker.set_limit(Category::BlockCache, Some(256));
            for index in 0..8 {
                store.get_block(chunk, index, 0).await.unwrap();
                assert!(tracker.category_used(Category::BlockCache) <= 256);
            }
            assert_eq!(store.blocks().len(), 4);
        });
    }
}
