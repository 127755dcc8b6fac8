use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt};

/// Handle for a mutation whose optimistic patch is already in the cache.
///
/// Awaiting it waits for the remote call and the reconcile/rollback step.
/// Dropping it does not cancel the mutation: the remote call runs in its own
/// task and the cache is reconciled or rolled back either way.
pub struct Pending<T> {
    placeholder_id: Option<String>,
    future: BoxFuture<'static, T>,
}

impl<T> Pending<T> {
    pub(crate) fn new<F>(placeholder_id: Option<String>, future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            placeholder_id,
            future: future.boxed(),
        }
    }

    /// Identifier the optimistic entity carries until the create settles.
    pub fn placeholder_id(&self) -> Option<&str> {
        self.placeholder_id.as_deref()
    }

    pub fn map<U, F>(self, f: F) -> Pending<U>
    where
        T: 'static,
        U: 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        Pending {
            placeholder_id: self.placeholder_id,
            future: self.future.map(f).boxed(),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        self.get_mut().future.as_mut().poll(cx)
    }
}
