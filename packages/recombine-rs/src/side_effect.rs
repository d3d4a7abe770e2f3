//! Side effects - observe post-middleware batches.
//!
//! A side effect sees every batch that is about to be reduced, including
//! batches injected by replay. It cannot alter, filter or delay the flow.
//! Composed side effects run in registration order.

use std::sync::Arc;

type ObserveFn<F, E> = dyn Fn(&[F], &E) + Send + Sync;

/// Observational sink for refined-action batches.
pub struct SideEffect<F, E> {
    observe: Arc<ObserveFn<F, E>>,
}

impl<F, E> Clone for SideEffect<F, E> {
    fn clone(&self) -> Self {
        Self {
            observe: self.observe.clone(),
        }
    }
}

impl<F, E> SideEffect<F, E>
where
    F: 'static,
    E: 'static,
{
    /// Create a side effect from a closure.
    pub fn new<T>(observe: T) -> Self
    where
        T: Fn(&[F], &E) + Send + Sync + 'static,
    {
        Self {
            observe: Arc::new(observe),
        }
    }

    /// A side effect that does nothing.
    pub fn noop() -> Self {
        Self::new(|_, _| {})
    }

    /// Run `self`, then `other`.
    pub fn appending(self, other: Self) -> Self {
        Self::new(move |batch, env| {
            self.run(batch, env);
            other.run(batch, env);
        })
    }

    /// Observe one batch.
    pub fn run(&self, batch: &[F], env: &E) {
        (self.observe)(batch, env)
    }
}

impl<F: 'static, E: 'static> Default for SideEffect<F, E> {
    fn default() -> Self {
        Self::noop()
    }
}

impl<F: 'static, E: 'static> FromIterator<SideEffect<F, E>> for SideEffect<F, E> {
    fn from_iter<I: IntoIterator<Item = SideEffect<F, E>>>(iter: I) -> Self {
        iter.into_iter().fold(Self::noop(), Self::appending)
    }
}

impl<F, E> std::fmt::Debug for SideEffect<F, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideEffect").finish_non_exhaustive()
    }
}
