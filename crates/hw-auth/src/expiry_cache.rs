//! Single-flight, expiry-aware token cache.
//!
//! A slot moves `Empty -> Pending -> Ready -> (expired) -> Pending -> Ready ...`.
//! Only one generation per slot is in flight at a time; every caller that finds
//! the slot pending awaits the same [`Resolvable`]. The generation itself runs
//! on a spawned task, so a caller that gives up waiting never cancels it for the
//! others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::date_time::normalize_record;
use crate::resolvable::{Abandoned, Resolvable};
use crate::tokens::Expiring;

/// Bounds for values held by a cache slot
pub trait CacheableToken: Expiring + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> CacheableToken for T where T: Expiring + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Bounds for errors shared between the waiters of one generation
pub trait CacheError: From<Abandoned> + Clone + Send + Sync + 'static {}

impl<E> CacheError for E where E: From<Abandoned> + Clone + Send + Sync + 'static {}

type Generator<A, T, E> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;
type ExistingLoader<E> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Option<Value>, E>> + Send + Sync>;

enum SlotState<T, E> {
    Empty,
    Pending {
        generation: u64,
        result: Resolvable<T, E>,
    },
    Ready(T),
}

enum Step<T, E> {
    Join(Resolvable<T, E>),
    Cold,
    Expired,
}

/// One coalescing cache entry, shared by [`ExpiryCache`] and
/// [`KeyedExpiryCache`](crate::keyed_cache::KeyedExpiryCache).
pub(crate) struct Slot<T, E> {
    state: Mutex<SlotState<T, E>>,
    generations: AtomicU64,
}

impl<T, E> Slot<T, E>
where
    T: CacheableToken,
    E: CacheError,
{
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Empty),
            generations: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState<T, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the cached token, join the in-flight generation, or start one.
    ///
    /// `load_existing` is only consulted when the slot is empty; an expired
    /// in-memory token goes straight to `generate`.
    pub(crate) async fn get<L, G>(
        self: &Arc<Self>,
        skew: Duration,
        load_existing: L,
        generate: G,
    ) -> Result<T, E>
    where
        L: FnOnce() -> BoxFuture<'static, Result<Option<Value>, E>>,
        G: FnOnce() -> BoxFuture<'static, Result<T, E>> + Send + 'static,
    {
        let pending = {
            let mut state = self.lock();
            let step = match &*state {
                SlotState::Ready(token) if is_usable(token, skew) => return Ok(token.clone()),
                SlotState::Pending { result, .. } => Step::Join(result.clone()),
                SlotState::Ready(_) => Step::Expired,
                SlotState::Empty => Step::Cold,
            };

            match step {
                Step::Join(result) => result,
                Step::Expired => {
                    debug!("cached token expired, generating a new one");
                    self.start(&mut state, generate())
                }
                Step::Cold => {
                    let existing = load_existing();
                    self.start(
                        &mut state,
                        async move {
                            if let Some(token) = adopt_existing::<T>(existing.await?, skew) {
                                debug!("adopted persisted token");
                                return Ok(token);
                            }
                            generate().await
                        }
                        .boxed(),
                    )
                }
            }
        };

        pending.wait().await
    }

    fn start(
        self: &Arc<Self>,
        state: &mut SlotState<T, E>,
        work: BoxFuture<'static, Result<T, E>>,
    ) -> Resolvable<T, E> {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let result = Resolvable::new();
        *state = SlotState::Pending {
            generation,
            result: result.clone(),
        };

        let settle = Settle {
            slot: Arc::clone(self),
            generation,
            result: result.clone(),
            done: false,
        };
        tokio::spawn(async move {
            let outcome = work.await;
            settle.finish(outcome);
        });

        result
    }

    /// Move `Pending(generation)` to its final state. A slot that was cleared or
    /// restarted in the meantime is left alone.
    fn settle(&self, generation: u64, outcome: &Result<T, E>) {
        let mut state = self.lock();
        let current = matches!(
            &*state,
            SlotState::Pending { generation: g, .. } if *g == generation
        );
        if current {
            *state = match outcome {
                Ok(token) => SlotState::Ready(token.clone()),
                Err(_) => SlotState::Empty,
            };
        }
    }

    pub(crate) fn clear(&self) {
        *self.lock() = SlotState::Empty;
    }

    /// Whether the slot holds a settled token accepted by `matches`
    pub(crate) fn holds(&self, matches: impl Fn(&T) -> bool) -> bool {
        match &*self.lock() {
            SlotState::Ready(token) => matches(token),
            _ => false,
        }
    }

    /// Empty the slot only while it still holds a token accepted by `matches`.
    pub(crate) fn clear_if(&self, matches: impl Fn(&T) -> bool) -> bool {
        let mut state = self.lock();
        let stale = match &*state {
            SlotState::Ready(token) => matches(token),
            _ => false,
        };
        if stale {
            *state = SlotState::Empty;
        }
        stale
    }
}

/// Completes a generation exactly once, even if the generating task panics.
struct Settle<T, E>
where
    T: CacheableToken,
    E: CacheError,
{
    slot: Arc<Slot<T, E>>,
    generation: u64,
    result: Resolvable<T, E>,
    done: bool,
}

impl<T, E> Settle<T, E>
where
    T: CacheableToken,
    E: CacheError,
{
    fn finish(mut self, outcome: Result<T, E>) {
        self.done = true;
        self.slot.settle(self.generation, &outcome);
        match outcome {
            Ok(token) => self.result.resolve(token),
            Err(err) => self.result.reject(err),
        };
    }
}

impl<T, E> Drop for Settle<T, E>
where
    T: CacheableToken,
    E: CacheError,
{
    fn drop(&mut self) {
        if !self.done {
            warn!("token generation ended without a result");
            let outcome = Err(E::from(Abandoned));
            self.slot.settle(self.generation, &outcome);
            if let Err(err) = outcome {
                self.result.reject(err);
            }
        }
    }
}

pub(crate) fn is_usable<T: Expiring>(token: &T, skew: Duration) -> bool {
    let skew = chrono::Duration::from_std(skew).unwrap_or(chrono::Duration::max_value());
    token.is_valid_at(Utc::now(), skew)
}

/// Normalize a durable record and accept it only if it is still usable.
pub(crate) fn adopt_existing<T: CacheableToken>(record: Option<Value>, skew: Duration) -> Option<T> {
    let Some(record) = normalize_record(record?) else {
        debug!("persisted token has no usable expiry");
        return None;
    };

    match serde_json::from_value::<T>(record) {
        Ok(token) if is_usable(&token, skew) => Some(token),
        Ok(_) => {
            debug!("persisted token expired");
            None
        }
        Err(e) => {
            warn!("Ignoring unreadable persisted token: {}", e);
            None
        }
    }
}

/// Single-slot expiry cache
///
/// Built from a generator (performs the network call) and a loader for an
/// existing durable record. Callers decide separately whether clearing the
/// cache should also clear durable storage.
pub struct ExpiryCache<A, T, E> {
    slot: Arc<Slot<T, E>>,
    generate: Generator<A, T, E>,
    load_existing: ExistingLoader<E>,
    skew: Duration,
}

impl<A, T, E> ExpiryCache<A, T, E>
where
    A: Send + 'static,
    T: CacheableToken,
    E: CacheError,
{
    pub fn new<G, L>(generate: G, load_existing: L) -> Self
    where
        G: Fn(A) -> BoxFuture<'static, Result<T, E>> + Send + Sync + 'static,
        L: Fn() -> BoxFuture<'static, Result<Option<Value>, E>> + Send + Sync + 'static,
    {
        Self {
            slot: Arc::new(Slot::new()),
            generate: Arc::new(generate),
            load_existing: Arc::new(load_existing),
            skew: Duration::ZERO,
        }
    }

    /// Cache without durable storage
    pub fn in_memory<G>(generate: G) -> Self
    where
        G: Fn(A) -> BoxFuture<'static, Result<T, E>> + Send + Sync + 'static,
    {
        Self::new(generate, || async { Ok(None) }.boxed())
    }

    /// Treat tokens expiring within `skew` as already expired
    pub fn with_expiry_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    pub async fn get_token(&self, args: A) -> Result<T, E> {
        let generate = Arc::clone(&self.generate);
        let load_existing = Arc::clone(&self.load_existing);
        self.slot
            .get(self.skew, move || load_existing(), move || generate(args))
            .await
    }

    /// Read the durable record without generating anything.
    pub async fn get_existing_token(&self) -> Result<Option<T>, E> {
        let record = (self.load_existing)().await?;
        Ok(adopt_existing(record, self.skew))
    }

    /// Drop the in-memory slot. Durable storage is untouched.
    pub fn clear_token(&self) {
        self.slot.clear();
    }

    /// Whether the settled in-memory token is accepted by `matches`
    pub fn holds_token(&self, matches: impl Fn(&T) -> bool) -> bool {
        self.slot.holds(matches)
    }

    /// Drop the in-memory token only if `matches` accepts it.
    ///
    /// A slot that is empty, generating, or already holding a newer token is
    /// left alone. Returns whether the slot was cleared.
    pub fn clear_token_if(&self, matches: impl Fn(&T) -> bool) -> bool {
        self.slot.clear_if(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use chrono::DateTime;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct TestToken {
        token: String,
        expires_at: DateTime<Utc>,
    }

    impl Expiring for TestToken {
        fn expires_at(&self) -> DateTime<Utc> {
            self.expires_at
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum TestError {
        Failed,
        Abandoned,
    }

    impl From<Abandoned> for TestError {
        fn from(_: Abandoned) -> Self {
            Self::Abandoned
        }
    }

    fn token(name: &str, minutes: i64) -> TestToken {
        TestToken {
            token: name.to_string(),
            expires_at: Utc::now() + chrono::Duration::minutes(minutes),
        }
    }

    /// Generator returning `T<n>` on call n, expired on the calls listed in `expired`
    fn counting_cache(
        calls: Arc<AtomicUsize>,
        expired: &'static [usize],
        existing: Option<Value>,
    ) -> ExpiryCache<(), TestToken, TestError> {
        ExpiryCache::new(
            move |()| {
                let calls = Arc::clone(&calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    let minutes = if expired.contains(&n) { -2 } else { 5 };
                    Ok(token(&format!("T{n}"), minutes))
                }
                .boxed()
            },
            move || {
                let existing = existing.clone();
                async move { Ok(existing) }.boxed()
            },
        )
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_generation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(Arc::clone(&calls), &[], None);

        let results = futures::future::join_all((0..8).map(|_| cache.get_token(()))).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap().token, "T1");
        }
    }

    #[tokio::test]
    async fn expired_token_is_regenerated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(Arc::clone(&calls), &[1], None);

        let stale = cache.get_token(()).await.unwrap();
        assert_eq!(stale.token, "T1");

        let fresh = cache.get_token(()).await.unwrap();
        assert_eq!(fresh.token, "T2");
        assert_ne!(fresh, stale);

        let again = cache.get_token(()).await.unwrap();
        assert_eq!(again.token, "T2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persisted_token_is_used_first() {
        let calls = Arc::new(AtomicUsize::new(0));
        let future = (Utc::now() + chrono::Duration::minutes(10)).to_rfc3339();
        let cache = counting_cache(
            Arc::clone(&calls),
            &[],
            Some(json!({ "token": "persisted", "expiresAt": future })),
        );

        assert_eq!(cache.get_token(()).await.unwrap().token, "persisted");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_persisted_token_falls_back_to_generation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let past = (Utc::now() - chrono::Duration::minutes(1)).timestamp_millis();
        let cache = counting_cache(
            Arc::clone(&calls),
            &[],
            Some(json!({ "token": "old", "expiresAt": past })),
        );

        assert_eq!(cache.get_token(()).await.unwrap().token, "T1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unparsable_persisted_expiry_is_ignored() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(
            Arc::clone(&calls),
            &[],
            Some(json!({ "token": "odd", "expiresAt": "whenever" })),
        );

        assert_eq!(cache.get_existing_token().await.unwrap(), None);
        assert_eq!(cache.get_token(()).await.unwrap().token, "T1");
    }

    #[tokio::test]
    async fn get_existing_token_never_generates() {
        let calls = Arc::new(AtomicUsize::new(0));
        let future = (Utc::now() + chrono::Duration::minutes(10)).to_rfc3339();
        let cache = counting_cache(
            Arc::clone(&calls),
            &[],
            Some(json!({ "token": "persisted", "expiresAt": { "ISO8601Date": future } })),
        );

        let existing = cache.get_existing_token().await.unwrap().unwrap();
        assert_eq!(existing.token, "persisted");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let empty = counting_cache(Arc::clone(&calls), &[], None);
        assert_eq!(empty.get_existing_token().await.unwrap(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_reaches_every_waiter_and_empties_the_slot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache: ExpiryCache<(), TestToken, TestError> = ExpiryCache::in_memory(move |()| {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(10)).await;
                if n == 1 {
                    Err(TestError::Failed)
                } else {
                    Ok(token("recovered", 5))
                }
            }
            .boxed()
        });

        let (a, b) = tokio::join!(cache.get_token(()), cache.get_token(()));
        assert_eq!(a, Err(TestError::Failed));
        assert_eq!(b, Err(TestError::Failed));

        assert_eq!(cache.get_token(()).await.unwrap().token, "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clear_forces_a_new_generation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(Arc::clone(&calls), &[], None);

        assert_eq!(cache.get_token(()).await.unwrap().token, "T1");
        cache.clear_token();
        assert_eq!(cache.get_token(()).await.unwrap().token, "T2");
    }

    #[tokio::test]
    async fn generation_finishing_after_clear_does_not_repopulate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(counting_cache(Arc::clone(&calls), &[], None));

        let waiter = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.get_token(()).await }
        });
        tokio::task::yield_now().await;
        cache.clear_token();

        assert_eq!(waiter.await.unwrap().unwrap().token, "T1");
        assert_eq!(cache.get_token(()).await.unwrap().token, "T2");
    }

    #[tokio::test]
    async fn abandoned_caller_does_not_cancel_generation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(Arc::clone(&calls), &[], None);

        let timed_out = tokio::time::timeout(Duration::from_millis(1), cache.get_token(())).await;
        assert!(timed_out.is_err());

        assert_eq!(cache.get_token(()).await.unwrap().token, "T1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_generator_reports_abandoned() {
        let cache: ExpiryCache<(), TestToken, TestError> = ExpiryCache::in_memory(|()| {
            async move {
                if true {
                    panic!("generator blew up");
                }
                Ok(token("never", 5))
            }
            .boxed()
        });

        assert_eq!(cache.get_token(()).await, Err(TestError::Abandoned));
    }

    #[tokio::test]
    async fn clear_if_keeps_a_replacement() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(Arc::clone(&calls), &[], None);

        let first = cache.get_token(()).await.unwrap();
        assert!(cache.clear_token_if(|cached| cached.token == first.token));
        let second = cache.get_token(()).await.unwrap();
        assert_eq!(second.token, "T2");

        // A late rejection of T1 must not throw T2 away
        assert!(!cache.holds_token(|cached| cached.token == first.token));
        assert!(!cache.clear_token_if(|cached| cached.token == first.token));
        assert_eq!(cache.get_token(()).await.unwrap(), second);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clear_if_leaves_a_pending_generation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(counting_cache(Arc::clone(&calls), &[], None));

        let waiter = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.get_token(()).await }
        });
        tokio::task::yield_now().await;

        assert!(!cache.clear_token_if(|_| true));
        assert_eq!(waiter.await.unwrap().unwrap().token, "T1");
        assert_eq!(cache.get_token(()).await.unwrap().token, "T1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oversized_skew_treats_every_token_as_expired() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(Arc::clone(&calls), &[], None)
            .with_expiry_skew(Duration::from_secs(u64::MAX));

        assert_eq!(cache.get_token(()).await.unwrap().token, "T1");
        assert_eq!(cache.get_token(()).await.unwrap().token, "T2");
    }

    #[tokio::test]
    async fn skew_renews_early() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(Arc::clone(&calls), &[], None)
            .with_expiry_skew(Duration::from_secs(600));

        // Every generated token lives five minutes, inside the ten minute skew.
        assert_eq!(cache.get_token(()).await.unwrap().token, "T1");
        assert_eq!(cache.get_token(()).await.unwrap().token, "T2");
    }
}
