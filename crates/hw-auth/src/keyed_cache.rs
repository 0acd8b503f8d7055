//! [`ExpiryCache`](crate::expiry_cache::ExpiryCache) partitioned by key.
//!
//! Each key owns an independent slot, created on first use and removed only by
//! [`KeyedExpiryCache::clear_token`]. Keys never block or invalidate each other.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::expiry_cache::{CacheError, CacheableToken, Slot, adopt_existing};

type KeyedGenerator<K, A, T, E> =
    Arc<dyn Fn(K, A) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;
type KeyedLoader<K, E> =
    Arc<dyn Fn(K) -> BoxFuture<'static, Result<Option<Value>, E>> + Send + Sync>;

pub struct KeyedExpiryCache<K, A, T, E> {
    slots: Mutex<HashMap<K, Arc<Slot<T, E>>>>,
    generate: KeyedGenerator<K, A, T, E>,
    load_existing: KeyedLoader<K, E>,
    skew: Duration,
}

impl<K, A, T, E> KeyedExpiryCache<K, A, T, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    A: Send + 'static,
    T: CacheableToken,
    E: CacheError,
{
    pub fn new<G, L>(generate: G, load_existing: L) -> Self
    where
        G: Fn(K, A) -> BoxFuture<'static, Result<T, E>> + Send + Sync + 'static,
        L: Fn(K) -> BoxFuture<'static, Result<Option<Value>, E>> + Send + Sync + 'static,
    {
        Self {
            slots: Mutex::new(HashMap::new()),
            generate: Arc::new(generate),
            load_existing: Arc::new(load_existing),
            skew: Duration::ZERO,
        }
    }

    pub fn with_expiry_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    fn slot(&self, key: &K) -> Arc<Slot<T, E>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Slot::new())),
        )
    }

    pub async fn get_token(&self, key: K, args: A) -> Result<T, E> {
        let slot = self.slot(&key);
        let generate = Arc::clone(&self.generate);
        let load_existing = Arc::clone(&self.load_existing);
        let load_key = key.clone();

        slot.get(
            self.skew,
            move || load_existing(load_key),
            move || generate(key, args),
        )
        .await
    }

    /// Read the durable record for `key` without generating anything.
    pub async fn get_existing_token(&self, key: &K) -> Result<Option<T>, E> {
        let record = (self.load_existing)(key.clone()).await?;
        Ok(adopt_existing(record, self.skew))
    }

    /// Drop the in-memory slot for `key`. Other keys and durable storage are untouched.
    pub fn clear_token(&self, key: &K) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Whether the settled in-memory token for `key` is accepted by `matches`
    pub fn holds_token(&self, key: &K, matches: impl Fn(&T) -> bool) -> bool {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();
        slot.is_some_and(|slot| slot.holds(matches))
    }

    /// Drop the slot for `key` only if `matches` accepts its settled token.
    /// Returns whether it was dropped.
    pub fn clear_token_if(&self, key: &K, matches: impl Fn(&T) -> bool) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let stale = slots.get(key).is_some_and(|slot| slot.holds(&matches));
        if stale {
            slots.remove(key);
        }
        stale
    }
}
