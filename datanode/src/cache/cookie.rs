use super::{Entry, Lookup, WeightedCache};
use crate::Error;
use futures::channel::oneshot;
use std::{fmt::Debug, hash::Hash, sync::Arc};

/// The right (and obligation) to produce the value of a key.
struct Producer<K, V> {
    cache: WeightedCache<K, V>,
    sender: oneshot::Sender<Result<Arc<Entry<K, V>>, Error>>,
}

/// Ticket returned by [WeightedCache::begin_insert].
///
/// An *active* cookie makes its holder the only producer of the key. The holder must call
/// [Cookie::end_insert] or [Cookie::cancel]; dropping an active cookie cancels the insert with
/// [Error::InsertAborted] so waiters are never left pending.
///
/// A *resolved* cookie was handed out because the key is already cached or being produced by
/// someone else. Its [Cookie::lookup] completes with that outcome.
pub struct Cookie<K, V>
where
    K: Clone + Debug + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    key: K,
    lookup: Lookup<K, V>,
    producer: Option<Producer<K, V>>,
}

impl<K, V> Cookie<K, V>
where
    K: Clone + Debug + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub(super) fn active(
        cache: WeightedCache<K, V>,
        key: K,
        sender: oneshot::Sender<Result<Arc<Entry<K, V>>, Error>>,
        lookup: Lookup<K, V>,
    ) -> Self {
        Self {
            key,
            lookup,
            producer: Some(Producer { cache, sender }),
        }
    }

    pub(super) fn resolved(key: K, lookup: Lookup<K, V>) -> Self {
        Self {
            key,
            lookup,
            producer: None,
        }
    }

    /// The key this cookie was created for.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Returns true if the holder is responsible for producing the value.
    pub fn is_active(&self) -> bool {
        self.producer.is_some()
    }

    /// A future that completes with the outcome of the insert.
    ///
    /// Dropping the returned future does not affect the producer.
    pub fn lookup(&self) -> Lookup<K, V> {
        self.lookup.clone()
    }

    /// Insert `value`, waking every caller waiting on the key.
    ///
    /// # Panics
    ///
    /// Panics if the cookie is not active.
    pub fn end_insert(mut self, value: V) -> Arc<Entry<K, V>> {
        let Some(Producer { cache, sender }) = self.producer.take() else {
            panic!("cookie is not active");
        };
        cache.end_insert(self.key.clone(), sender, value)
    }

    /// Abandon the insert, delivering `error` to every caller waiting on the key. The key may
    /// be inserted again afterwards.
    ///
    /// Canceling a resolved cookie has no effect.
    pub fn cancel(mut self, error: Error) {
        if let Some(Producer { cache, sender }) = self.producer.take() {
            cache.cancel(&self.key, sender, error);
        }
    }
}

impl<K, V> Drop for Cookie<K, V>
where
    K: Clone + Debug + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(Producer { cache, sender }) = self.producer.take() {
            cache.cancel(&self.key, sender, Error::InsertAborted);
        }
    }
}
