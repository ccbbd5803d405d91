//! Account for memory held by the node's caches against a node-wide budget.
//!
//! Caches do not own the budget they consume. Each cache is handed a [MemoryTracker] for its
//! [Category] and reserves the weight of every retained entry against it, releasing that weight
//! when the entry is evicted or removed. A cache that cannot reserve weight must shrink or refuse
//! the insert rather than overcommit.

use crate::Error;
use commonware_runtime::Metrics;
use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{family::Family, gauge::Gauge},
};
use std::sync::{Arc, Mutex};

/// Reserve and release bytes against a memory budget.
pub trait MemoryTracker: Send + Sync + 'static {
    /// Reserve `bytes`, failing if the budget would be exceeded.
    fn try_acquire(&self, bytes: u64) -> Result<(), Error>;

    /// Return `bytes` previously reserved with [MemoryTracker::try_acquire].
    fn release(&self, bytes: u64);

    /// Number of bytes currently reserved.
    fn used(&self) -> u64;
}

/// Consumers of node memory tracked separately.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Category {
    /// Cached chunk blocks.
    BlockCache,
    /// Cached chunk metadata.
    ChunkMeta,
    /// Cached per-chunk block indexes.
    ChunkBlocksExt,
}

impl Category {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        match self {
            Category::BlockCache => 0,
            Category::ChunkMeta => 1,
            Category::ChunkBlocksExt => 2,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct Label {
    category: Category,
}

#[derive(Default)]
struct State {
    total: u64,
    used: [u64; Category::COUNT],
    limits: [Option<u64>; Category::COUNT],
}

struct Inner {
    limit: u64,
    state: Mutex<State>,
    usage: Family<Label, Gauge>,
}

/// Node-wide memory tracker with an overall limit and optional per-[Category] limits.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<Inner>,
}

impl Tracker {
    /// Create a new tracker that allows at most `limit` bytes to be reserved across all
    /// categories.
    pub fn new(context: impl Metrics, limit: u64) -> Self {
        let usage = Family::<Label, Gauge>::default();
        context.register(
            "memory_usage",
            "Bytes reserved by category",
            usage.clone(),
        );
        Self {
            inner: Arc::new(Inner {
                limit,
                state: Mutex::new(State::default()),
                usage,
            }),
        }
    }

    /// Returns a [MemoryTracker] that reserves memory on behalf of `category`.
    pub fn with_category(&self, category: Category) -> CategoryTracker {
        CategoryTracker {
            tracker: self.clone(),
            category,
        }
    }

    /// Set (or clear) the limit of a single category. Lowering a limit below current usage does
    /// not reclaim memory, it only fails subsequent reservations.
    pub fn set_limit(&self, category: Category, limit: Option<u64>) {
        self.inner.state.lock().unwrap().limits[category.index()] = limit;
    }

    /// Total bytes reserved across all categories.
    pub fn used(&self) -> u64 {
        self.inner.state.lock().unwrap().total
    }

    /// Bytes reserved by `category`.
    pub fn category_used(&self, category: Category) -> u64 {
        self.inner.state.lock().unwrap().used[category.index()]
    }

    fn try_acquire(&self, category: Category, bytes: u64) -> Result<(), Error> {
        let index = category.index();
        let mut state = self.inner.state.lock().unwrap();
        let mut available = self.inner.limit.saturating_sub(state.total);
        if let Some(limit) = state.limits[index] {
            available = available.min(limit.saturating_sub(state.used[index]));
        }
        if bytes > available {
            return Err(Error::MemoryLimitExceeded {
                requested: bytes,
                available,
            });
        }
        state.total += bytes;
        state.used[index] += bytes;
        self.inner
            .usage
            .get_or_create(&Label { category })
            .set(state.used[index] as i64);
        Ok(())
    }

    fn release(&self, category: Category, bytes: u64) {
        let index = category.index();
        let mut state = self.inner.state.lock().unwrap();
        assert!(
            state.used[index] >= bytes,
            "released more memory than reserved"
        );
        state.total -= bytes;
        state.used[index] -= bytes;
        self.inner
            .usage
            .get_or_create(&Label { category })
            .set(state.used[index] as i64);
    }
}

/// A [MemoryTracker] scoped to a single [Category] of a [Tracker].
#[derive(Clone)]
pub struct CategoryTracker {
    tracker: Tracker,
    category: Category,
}

impl MemoryTracker for CategoryTracker {
    fn try_acquire(&self, bytes: u64) -> Result<(), Error> {
        self.tracker.try_acquire(self.category, bytes)
    }

    fn release(&self, bytes: u64) {
        self.tracker.release(self.category, bytes)
    }

    fn used(&self) -> u64 {
        self.tracker.category_used(self.category)
    }
}
