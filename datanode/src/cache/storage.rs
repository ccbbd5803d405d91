use super::{metrics::Metrics, Config, Cookie, Entry, Lookup, Weigher};
use crate::{memory::MemoryTracker, Error};
use commonware_runtime::Metrics as RuntimeMetrics;
use futures::{
    channel::oneshot,
    future::{self, FutureExt},
};
use std::{
    collections::{BTreeMap, HashMap},
    fmt::Debug,
    hash::Hash,
    sync::{Arc, Mutex},
};
use tracing::{debug, error, warn};

/// Segment of the LRU an entry lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Segment {
    Younger,
    Older,
}

/// An entry retained by the cache.
struct Resident<K, V> {
    entry: Arc<Entry<K, V>>,
    segment: Segment,
    tick: u64,
}

enum Slot<K, V> {
    /// An insert is in flight and will resolve the lookup.
    Pending(Lookup<K, V>),
    /// The value is retained by the cache.
    Resident(Resident<K, V>),
}

struct State<K, V> {
    slots: HashMap<K, Slot<K, V>>,

    // Recency order of each segment (smallest tick is the least recently used)
    younger: BTreeMap<u64, K>,
    older: BTreeMap<u64, K>,
    younger_weight: u64,
    older_weight: u64,

    next_tick: u64,
    capacity: u64,
}

impl<K: Clone + Eq + Hash, V> State<K, V> {
    fn tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn weight(&self) -> u64 {
        self.younger_weight + self.older_weight
    }

    /// Move a resident entry to the front of the older segment.
    fn touch(&mut self, key: &K) -> Option<Arc<Entry<K, V>>> {
        let tick = self.tick();
        let Some(Slot::Resident(resident)) = self.slots.get_mut(key) else {
            return None;
        };
        let weight = resident.entry.weight();
        match resident.segment {
            Segment::Younger => {
                self.younger.remove(&resident.tick);
                self.younger_weight -= weight;
                self.older_weight += weight;
            }
            Segment::Older => {
                self.older.remove(&resident.tick);
            }
        }
        resident.segment = Segment::Older;
        resident.tick = tick;
        self.older.insert(tick, key.clone());
        Some(resident.entry.clone())
    }

    /// Place a new entry at the front of the younger segment.
    fn push(&mut self, entry: Arc<Entry<K, V>>) {
        let tick = self.tick();
        let key = entry.key().clone();
        self.younger_weight += entry.weight();
        self.younger.insert(tick, key.clone());
        self.slots.insert(
            key,
            Slot::Resident(Resident {
                entry,
                segment: Segment::Younger,
                tick,
            }),
        );
    }

    /// Remove a resident entry (pending inserts are left untouched).
    fn detach(&mut self, key: &K) -> Option<Arc<Entry<K, V>>> {
        if !matches!(self.slots.get(key), Some(Slot::Resident(_))) {
            return None;
        }
        let Some(Slot::Resident(resident)) = self.slots.remove(key) else {
            unreachable!("slot checked above");
        };
        let weight = resident.entry.weight();
        match resident.segment {
            Segment::Younger => {
                self.younger.remove(&resident.tick);
                self.younger_weight -= weight;
            }
            Segment::Older => {
                self.older.remove(&resident.tick);
                self.older_weight -= weight;
            }
        }
        Some(resident.entry)
    }

    /// Remove the least recently used entry, preferring the younger segment.
    fn evict_one(&mut self) -> Option<Arc<Entry<K, V>>> {
        let key = self
            .younger
            .first_key_value()
            .or_else(|| self.older.first_key_value())
            .map(|(_, key)| key.clone())?;
        self.detach(&key)
    }
}

pub(super) struct Inner<K, V> {
    younger_size_fraction: f64,
    state: Mutex<State<K, V>>,
    weigher: Box<dyn Weigher<V>>,
    tracker: Box<dyn MemoryTracker>,
    metrics: Metrics,
}

/// A weight-bounded cache that deduplicates concurrent inserts of the same key.
///
/// Entries are immutable once inserted. Producers obtain an active [Cookie] from
/// [WeightedCache::begin_insert] and must resolve it with [Cookie::end_insert] or
/// [Cookie::cancel] (dropping the cookie cancels it). Every other caller asking for the same key
/// in the meantime receives a resolved [Cookie] that shares the producer's outcome.
pub struct WeightedCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for WeightedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> WeightedCache<K, V>
where
    K: Clone + Debug + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Create a new cache.
    ///
    /// Metrics are registered with `context`. The weight of every retained entry is reserved
    /// against `tracker`.
    pub fn new(
        context: impl RuntimeMetrics,
        cfg: Config,
        weigher: impl Weigher<V>,
        tracker: impl MemoryTracker,
    ) -> Self {
        assert!(
            (0.0..=1.0).contains(&cfg.younger_size_fraction),
            "younger size fraction must be within [0, 1]"
        );
        Self {
            inner: Arc::new(Inner {
                younger_size_fraction: cfg.younger_size_fraction,
                state: Mutex::new(State {
                    slots: HashMap::new(),
                    younger: BTreeMap::new(),
                    older: BTreeMap::new(),
                    younger_weight: 0,
                    older_weight: 0,
                    next_tick: 0,
                    capacity: cfg.capacity,
                }),
                weigher: Box::new(weigher),
                tracker: Box::new(tracker),
                metrics: Metrics::init(context),
            }),
        }
    }

    /// Return the entry cached for `key`, if any.
    ///
    /// An insert that is still in flight is not waited on (use [WeightedCache::begin_insert]
    /// to join it).
    pub fn find(&self, key: &K) -> Option<Arc<Entry<K, V>>> {
        let mut state = self.inner.state.lock().unwrap();
        let Some(entry) = state.touch(key) else {
            self.inner.metrics.misses.inc();
            return None;
        };
        self.inner.metrics.hits.inc();
        self.trim(&mut state);
        self.update_gauges(&state);
        Some(entry)
    }

    /// Begin inserting `key`.
    ///
    /// If the key is neither cached nor being inserted, the returned [Cookie] is active and the
    /// caller is responsible for producing the value. Otherwise the cookie is resolved and its
    /// [Cookie::lookup] yields the cached (or eventual) value.
    pub fn begin_insert(&self, key: K) -> Cookie<K, V> {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(entry) = state.touch(&key) {
            self.inner.metrics.hits.inc();
            self.trim(&mut state);
            self.update_gauges(&state);
            drop(state);
            return Cookie::resolved(key, future::ready(Ok::<_, Error>(entry)).boxed().shared());
        }
        if let Some(Slot::Pending(lookup)) = state.slots.get(&key) {
            let lookup = lookup.clone();
            drop(state);
            return Cookie::resolved(key, lookup);
        }

        self.inner.metrics.misses.inc();
        let (sender, receiver) = oneshot::channel();
        let lookup: Lookup<K, V> = receiver
            .map(|result| result.unwrap_or(Err(Error::InsertAborted)))
            .boxed()
            .shared();
        state
            .slots
            .insert(key.clone(), Slot::Pending(lookup.clone()));
        drop(state);
        Cookie::active(self.clone(), key, sender, lookup)
    }

    /// Complete an insert started by an active cookie.
    pub(super) fn end_insert(
        &self,
        key: K,
        sender: oneshot::Sender<Result<Arc<Entry<K, V>>, Error>>,
        value: V,
    ) -> Arc<Entry<K, V>> {
        let weight = self.inner.weigher.weigh(&value);
        let entry = Arc::new(Entry::new(key.clone(), value, weight));

        let mut state = self.inner.state.lock().unwrap();
        let pending = state.slots.remove(&key);
        assert!(
            matches!(pending, Some(Slot::Pending(_))),
            "insert completed without a pending slot"
        );

        // Reserve memory for the entry, shrinking the cache if the tracker refuses
        let mut evicted = Vec::new();
        let retained = loop {
            match self.inner.tracker.try_acquire(weight) {
                Ok(()) => break true,
                Err(err) => match state.evict_one() {
                    Some(victim) => {
                        self.release(&victim);
                        self.inner.metrics.evictions.inc();
                        evicted.push(victim);
                    }
                    None => {
                        warn!(?key, weight, %err, "refusing to cache entry");
                        break false;
                    }
                },
            }
        };
        if retained {
            state.push(entry.clone());
            self.inner.metrics.inserts.inc();
            evicted.extend(self.trim(&mut state));
        } else {
            self.inner.metrics.rejected.inc();
        }
        self.update_gauges(&state);
        drop(state);

        // Waiters only observe the value once it is visible in the cache
        let _ = sender.send(Ok(entry.clone()));
        drop(evicted);
        entry
    }

    /// Abandon an insert started by an active cookie, delivering `error` to every waiter.
    pub(super) fn cancel(
        &self,
        key: &K,
        sender: oneshot::Sender<Result<Arc<Entry<K, V>>, Error>>,
        error: Error,
    ) {
        let mut state = self.inner.state.lock().unwrap();
        let pending = state.slots.remove(key);
        assert!(
            matches!(pending, Some(Slot::Pending(_))),
            "insert canceled without a pending slot"
        );
        drop(state);
        debug!(?key, %error, "cache insert canceled");
        let _ = sender.send(Err(error));
    }

    /// Remove the entry cached for `key`. Returns whether an entry was removed.
    pub fn remove(&self, key: &K) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        let Some(entry) = state.detach(key) else {
            return false;
        };
        self.release(&entry);
        self.update_gauges(&state);
        true
    }

    /// Remove every cached entry whose key matches `predicate`. Returns the number of entries
    /// removed.
    pub fn remove_if(&self, predicate: impl Fn(&K) -> bool) -> usize {
        let mut state = self.inner.state.lock().unwrap();
        let keys: Vec<K> = state
            .slots
            .iter()
            .filter(|(key, slot)| matches!(slot, Slot::Resident(_)) && predicate(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys.iter() {
            if let Some(entry) = state.detach(key) {
                self.release(&entry);
            }
        }
        self.update_gauges(&state);
        keys.len()
    }

    /// Change the capacity of the cache, evicting entries if needed.
    pub fn set_capacity(&self, capacity: u64) {
        let mut state = self.inner.state.lock().unwrap();
        state.capacity = capacity;
        let evicted = self.trim(&mut state);
        self.update_gauges(&state);
        drop(state);
        drop(evicted);
    }

    /// The maximum total weight of retained entries.
    pub fn capacity(&self) -> u64 {
        self.inner.state.lock().unwrap().capacity
    }

    /// The total weight of retained entries.
    pub fn weight(&self) -> u64 {
        self.inner.state.lock().unwrap().weight()
    }

    /// The number of retained entries.
    pub fn len(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.younger.len() + state.older.len()
    }

    /// Returns true if no entries are retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of all retained entries (in no particular order).
    pub fn entries(&self) -> Vec<Arc<Entry<K, V>>> {
        let state = self.inner.state.lock().unwrap();
        state
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Resident(resident) => Some(resident.entry.clone()),
                Slot::Pending(_) => None,
            })
            .collect()
    }

    /// Demote entries from the older to the younger segment and evict from the younger
    /// segment until the cache is within capacity.
    fn trim(&self, state: &mut State<K, V>) -> Vec<Arc<Entry<K, V>>> {
        let older_capacity =
            (state.capacity as f64 * (1.0 - self.inner.younger_size_fraction)) as u64;
        while state.older_weight > older_capacity {
            let Some((_, key)) = state.older.pop_first() else {
                break;
            };
            let tick = state.tick();
            let Some(Slot::Resident(resident)) = state.slots.get_mut(&key) else {
                unreachable!("older segment references missing entry");
            };
            let weight = resident.entry.weight();
            resident.segment = Segment::Younger;
            resident.tick = tick;
            state.older_weight -= weight;
            state.younger_weight += weight;
            state.younger.insert(tick, key);
        }

        let mut evicted = Vec::new();
        while state.weight() > state.capacity {
            let Some(key) = state.younger.first_key_value().map(|(_, key)| key.clone()) else {
                break;
            };
            let Some(entry) = state.detach(&key) else {
                unreachable!("younger segment references missing entry");
            };
            self.release(&entry);
            self.inner.metrics.evictions.inc();
            evicted.push(entry);
        }
        evicted
    }

    fn release(&self, entry: &Entry<K, V>) {
        self.inner.tracker.release(entry.weight());
    }

    #[cfg(test)]
    pub(crate) fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    fn update_gauges(&self, state: &State<K, V>) {
        self.inner
            .metrics
            .items
            .set((state.younger.len() + state.older.len()) as i64);
        self.inner.metrics.weight.set(state.weight() as i64);
    }
}

impl<K, V> WeightedCache<K, V>
where
    K: Clone + Debug + Eq + Hash + Send + Sync + 'static,
    V: PartialEq + Send + Sync + 'static,
{
    /// Insert `value` for `key`, tolerating a concurrent insert of the same content.
    ///
    /// If another producer already inserted (or is inserting) `key`, its value is compared with
    /// `value` and the existing entry is returned.
    ///
    /// # Panics
    ///
    /// Panics if the existing value differs from `value`. Keys identify content, so two
    /// different values for the same key indicate corruption that must not be served.
    pub async fn put(&self, key: K, value: V) -> Arc<Entry<K, V>> {
        loop {
            let cookie = self.begin_insert(key.clone());
            if cookie.is_active() {
                return cookie.end_insert(value);
            }

            // A failed concurrent insert frees the key, so try again
            let Ok(existing) = cookie.lookup().await else {
                continue;
            };
            if existing.value() != &value {
                error!(?key, "different content cached for key");
                panic!("different content cached for key {key:?}");
            }
            debug!(?key, "entry resurrected in cache");
            return existing;
        }
    }
}
