//! A weight-bounded cache that deduplicates concurrent fetches of the same content.
//!
//! [WeightedCache] maps keys to immutable values and bounds the total *weight* (typically bytes)
//! of the values it retains. It is used by the node to cache data blocks and chunk metadata.
//!
//! # Single-Flight Inserts
//!
//! Values are produced outside of the cache. To avoid fetching the same content more than once,
//! a caller that misses calls [WeightedCache::begin_insert] and receives a [Cookie]:
//!
//! - If nothing is cached or in flight for the key, the cookie is *active* and its holder is the
//!   only producer. It must call [Cookie::end_insert] with the value or [Cookie::cancel] with an
//!   error (dropping the cookie cancels it).
//! - Otherwise the cookie is *resolved*: [Cookie::lookup] completes with the cached value or with
//!   the outcome of the in-flight insert.
//!
//! A canceled insert delivers its error to every waiter and frees the key so that a later caller
//! may retry. Waiters never observe a value before it is visible in the cache.
//!
//! # Eviction
//!
//! Retained entries are split across two LRU segments. New entries enter the _younger_ segment
//! and a hit promotes an entry to the _older_ segment. When the older segment grows beyond
//! `capacity * (1 - younger_size_fraction)`, its least recently used entries are demoted back to
//! the younger segment. Entries are only evicted from the tail of the younger segment, so an
//! entry that is read once never displaces an entry that is read repeatedly.
//!
//! Inserts that are still in flight are not part of either segment and are never evicted.
//!
//! # Memory Accounting
//!
//! The weight of each retained entry is reserved against a [crate::memory::MemoryTracker]. If the
//! tracker refuses a reservation, the cache evicts its least recently used entries until the
//! reservation succeeds. If the cache runs out of entries to evict, the value is still delivered
//! to every waiter but is not retained.
//!
//! # Content Addressing
//!
//! Keys identify content: the same key must never map to two different values.
//! [WeightedCache::put] tolerates losing a race to another producer of the same key, but panics
//! if the two values differ.
//!
//! # Example
//!
//! ```rust
//! use commonware_runtime::{deterministic, Metrics, Runner};
//! use commonware_datanode::{
//!     cache::{Config, WeightedCache},
//!     memory::{Category, Tracker},
//! };
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     let tracker = Tracker::new(context.with_label("memory"), 1024);
//!     let cache = WeightedCache::new(
//!         context.with_label("cache"),
//!         Config { capacity: 1024, younger_size_fraction: 0.25 },
//!         |value: &Vec<u8>| value.len() as u64,
//!         tracker.with_category(Category::BlockCache),
//!     );
//!
//!     // The first caller becomes the producer
//!     let cookie = cache.begin_insert(1u64);
//!     assert!(cookie.is_active());
//!
//!     // Concurrent callers join the in-flight insert
//!     let waiter = cache.begin_insert(1u64);
//!     assert!(!waiter.is_active());
//!
//!     cookie.end_insert(vec![1, 2, 3]);
//!     let entry = waiter.lookup().await.unwrap();
//!     assert_eq!(entry.value(), &vec![1, 2, 3]);
//!     assert_eq!(cache.weight(), 3);
//! });
//! ```

use crate::Error;
use futures::future::{BoxFuture, Shared};
use std::sync::Arc;

mod cookie;
pub use cookie::Cookie;
mod metrics;
mod storage;
pub use storage::WeightedCache;

/// Configuration for [WeightedCache].
#[derive(Clone, Debug)]
pub struct Config {
    /// The maximum total weight of retained entries.
    pub capacity: u64,

    /// The share of `capacity` reserved for entries that have not been hit since insertion.
    ///
    /// Must be within `[0, 1]`.
    pub younger_size_fraction: f64,
}

/// Computes the weight of a cached value.
pub trait Weigher<V>: Send + Sync + 'static {
    /// Returns the weight of `value`.
    fn weigh(&self, value: &V) -> u64;
}

impl<V, F> Weigher<V> for F
where
    F: Fn(&V) -> u64 + Send + Sync + 'static,
{
    fn weigh(&self, value: &V) -> u64 {
        self(value)
    }
}

/// A value retained by a [WeightedCache].
///
/// Entries are shared by the cache and every caller that received them; the value is
/// dropped once the last holder releases it.
#[derive(Debug)]
pub struct Entry<K, V> {
    key: K,
    value: V,
    weight: u64,
}

impl<K, V> Entry<K, V> {
    fn new(key: K, value: V, weight: u64) -> Self {
        Self { key, value, weight }
    }

    /// The key of the entry.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The cached value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// The weight charged for the entry.
    pub fn weight(&self) -> u64 {
        self.weight
    }
}

/// Completes with the outcome of an insert.
pub type Lookup<K, V> = Shared<BoxFuture<'static, Result<Arc<Entry<K, V>>, Error>>>;
