//! A future that is completed from outside the code that awaits it.
//!
//! Every clone of a [`Resolvable`] observes the same outcome, which is what lets
//! concurrent token requests share one in-flight generation.

use std::future::IntoFuture;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};

/// Completion error seen by waiters when the completer went away without
/// resolving or rejecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abandoned;

type Outcome<T, E> = std::result::Result<T, E>;

pub struct Resolvable<T, E> {
    sender: Arc<Mutex<Option<oneshot::Sender<Outcome<T, E>>>>>,
    receiver: Shared<oneshot::Receiver<Outcome<T, E>>>,
}

impl<T, E> Clone for Resolvable<T, E>
where
    T: Clone,
    E: Clone,
{
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
            receiver: self.receiver.clone(),
        }
    }
}

impl<T, E> Default for Resolvable<T, E>
where
    T: Clone,
    E: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Resolvable<T, E>
where
    T: Clone,
    E: Clone,
{
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver: receiver.shared(),
        }
    }

    /// Complete with a value. Returns `false` if already completed.
    pub fn resolve(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// Complete with an error. Returns `false` if already completed.
    pub fn reject(&self, error: E) -> bool {
        self.complete(Err(error))
    }

    pub fn is_completed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn complete(&self, outcome: Outcome<T, E>) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match sender {
            // All waiters may already be gone; that still counts as completed.
            Some(sender) => {
                let _ = sender.send(outcome);
                true
            }
            None => false,
        }
    }
}

impl<T, E> Resolvable<T, E>
where
    T: Clone,
    E: Clone + From<Abandoned>,
{
    /// Wait for the outcome without consuming this handle.
    pub async fn wait(&self) -> Outcome<T, E> {
        self.receiver
            .clone()
            .await
            .unwrap_or_else(|_| Err(E::from(Abandoned)))
    }
}

impl<T, E> IntoFuture for Resolvable<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + From<Abandoned> + Send + Sync + 'static,
{
    type Output = Outcome<T, E>;
    type IntoFuture = BoxFuture<'static, Outcome<T, E>>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.wait().await }.boxed()
    }
}
