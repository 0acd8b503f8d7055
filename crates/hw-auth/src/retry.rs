//! Classify-and-retry execution for authorization failures.
//!
//! The policy does not know what a stale credential is; callers register a
//! failure hook that invalidates whatever they depend on, and the policy runs
//! those hooks before the single retry.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use crate::config::RetryConfig;

/// Passed to failure hooks before a retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryEvent {
    /// The attempt that just failed, starting at 1
    pub attempt: u32,
    pub max_attempts: u32,
}

pub type FailureHook<E> =
    Arc<dyn Fn(&E, RetryEvent) -> BoxFuture<'static, Result<(), E>> + Send + Sync>;

type HookList<E> = Mutex<Vec<(u64, FailureHook<E>)>>;

type CallHook<'a, E> = dyn Fn(&E, RetryEvent) -> BoxFuture<'static, Result<(), E>> + Send + Sync + 'a;

pub struct RetryPolicy<E> {
    max_attempts: u32,
    backoff: Duration,
    classify: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    hooks: Arc<HookList<E>>,
    next_hook_id: AtomicU64,
}

impl<E> RetryPolicy<E> {
    pub fn new<C>(config: &RetryConfig, classify: C) -> Self
    where
        C: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff,
            classify: Arc::new(classify),
            hooks: Arc::new(Mutex::new(Vec::new())),
            next_hook_id: AtomicU64::new(0),
        }
    }

    /// Register a hook that runs before each retry of every call on this policy.
    ///
    /// The hook stays registered until the returned guard is dropped.
    pub fn on_failure<H>(&self, hook: H) -> FailureHookGuard<E>
    where
        H: Fn(&E, RetryEvent) -> BoxFuture<'static, Result<(), E>> + Send + Sync + 'static,
    {
        let id = self.next_hook_id.fetch_add(1, Ordering::Relaxed);
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(hook)));

        FailureHookGuard {
            id,
            hooks: Arc::downgrade(&self.hooks),
        }
    }

    fn registered_hooks(&self) -> Vec<FailureHook<E>> {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, hook)| Arc::clone(hook))
            .collect()
    }

    /// Run `op`, retrying classified failures while attempts remain.
    ///
    /// Unclassified failures and the failure of the last attempt are returned
    /// unchanged. A hook error aborts the call with that error.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(None, op).await
    }

    /// Like [`execute`](Self::execute), with `hook` running before each retry of
    /// this call only. Concurrent calls on the same policy never see it.
    pub async fn execute_with_hook<H, F, Fut, T>(&self, hook: H, op: F) -> Result<T, E>
    where
        H: Fn(&E, RetryEvent) -> BoxFuture<'static, Result<(), E>> + Send + Sync,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let hook: &CallHook<'_, E> = &hook;
        self.run(Some(hook), op).await
    }

    async fn run<F, Fut, T>(&self, scoped: Option<&CallHook<'_, E>>, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempt >= self.max_attempts || !(self.classify)(&err) {
                return Err(err);
            }

            debug!(attempt, max_attempts = self.max_attempts, "retrying after authorization failure");
            let event = RetryEvent {
                attempt,
                max_attempts: self.max_attempts,
            };
            for hook in self.registered_hooks() {
                hook(&err, event).await?;
            }
            if let Some(hook) = scoped {
                hook(&err, event).await?;
            }

            if !self.backoff.is_zero() {
                tokio::time::sleep(self.backoff).await;
            }
            attempt += 1;
        }
    }
}

/// Removes its hook from the policy when dropped
#[must_use = "the hook is unregistered as soon as the guard is dropped"]
pub struct FailureHookGuard<E> {
    id: u64,
    hooks: Weak<HookList<E>>,
}

impl<E> Drop for FailureHookGuard<E> {
    fn drop(&mut self) {
        if let Some(hooks) = self.hooks.upgrade() {
            hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}

/// The input handed to the latest attempt of one call
///
/// The operation records what it sent; a failure hook takes it back to
/// invalidate exactly the credential that was rejected.
pub struct AttemptInput<T>(Arc<Mutex<Option<T>>>);

impl<T> AttemptInput<T> {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    pub fn record(&self, input: T) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(input);
    }

    pub fn take(&self) -> Option<T> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl<T> Clone for AttemptInput<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Default for AttemptInput<T> {
    fn default() -> Self {
        Self::new()
    }
}
