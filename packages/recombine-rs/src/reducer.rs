//! Reducers - the pure state transition fold.
//!
//! A reducer turns `(state, action, environment)` into the next state. Two
//! authoring styles share one representation:
//! - [`Reducer::pure`] returns a new state
//! - [`Reducer::mutating`] edits the state in place
//!
//! Composed reducers see each other's output: `a.concat(b)` applies `a`,
//! then `b` to the result, for the same action.

use std::sync::Arc;

type ReduceFn<S, F, E> = dyn Fn(S, &F, &E) -> S + Send + Sync;

/// State transition function owned by the store.
pub struct Reducer<S, F, E> {
    reduce: Arc<ReduceFn<S, F, E>>,
}

impl<S, F, E> Clone for Reducer<S, F, E> {
    fn clone(&self) -> Self {
        Self {
            reduce: self.reduce.clone(),
        }
    }
}

impl<S, F, E> Reducer<S, F, E>
where
    S: 'static,
    F: 'static,
    E: 'static,
{
    /// Create a reducer that returns the next state.
    pub fn pure<T>(reduce: T) -> Self
    where
        T: Fn(S, &F, &E) -> S + Send + Sync + 'static,
    {
        Self {
            reduce: Arc::new(reduce),
        }
    }

    /// Create a reducer that mutates the state in place.
    pub fn mutating<T>(reduce: T) -> Self
    where
        T: Fn(&mut S, &F, &E) + Send + Sync + 'static,
    {
        Self::pure(move |mut state, action, env| {
            reduce(&mut state, action, env);
            state
        })
    }

    /// A reducer that leaves the state untouched.
    pub fn identity() -> Self {
        Self::pure(|state, _, _| state)
    }

    /// Apply `self`, then `other`.
    pub fn concat(self, other: Self) -> Self {
        Self::pure(move |state, action, env| {
            let state = self.reduce(state, action, env);
            other.reduce(state, action, env)
        })
    }

    /// Reduce a single action.
    pub fn reduce(&self, state: S, action: &F, env: &E) -> S {
        (self.reduce)(state, action, env)
    }

    /// Fold an ordered batch left to right.
    pub fn reduce_batch(&self, state: S, batch: &[F], env: &E) -> S {
        batch
            .iter()
            .fold(state, |state, action| self.reduce(state, action, env))
    }
}

impl<S, F, E> FromIterator<Reducer<S, F, E>> for Reducer<S, F, E>
where
    S: 'static,
    F: 'static,
    E: 'static,
{
    fn from_iter<I: IntoIterator<Item = Reducer<S, F, E>>>(iter: I) -> Self {
        iter.into_iter().fold(Self::identity(), Self::concat)
    }
}

impl<S, F, E> std::fmt::Debug for Reducer<S, F, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reducer").finish_non_exhaustive()
    }
}
