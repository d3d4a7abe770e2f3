//! Thunks - asynchronous resolution of raw actions.
//!
//! A thunk maps one raw action to a stream of further actions. Anything it
//! emits may itself be raw, in which case resolution continues until only
//! refined actions remain:
//!
//! ```text
//! Raw(a) ─► thunk ─► Refined([x])          ─► yielded
//!                 └► Raw([b, c]) ─► thunk(b) ─► ...   (fully, then)
//!                                └► thunk(c) ─► ...
//! ```
//!
//! # Snapshots
//!
//! Every thunk call made while unfolding one top-level raw action receives a
//! clone of the same state snapshot, taken when that resolution started.
//! Thunks never see a live binding to the store's state.
//!
//! # Failures
//!
//! Resolution cannot fail. A thunk that performs fallible IO must turn the
//! failure into an ordinary refined action.
//!
//! # Cycles
//!
//! A raw action that (transitively) resolves to itself never terminates.
//! This is not detected.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tracing::trace;

use crate::action::Action;

/// Stream of actions produced by a single thunk call.
pub type ActionStream<R, F> = BoxStream<'static, Action<R, F>>;

type ResolveFn<S, R, F, E> = dyn Fn(S, R, Arc<E>) -> ActionStream<R, F> + Send + Sync;

/// Asynchronous resolver for raw actions.
///
/// # Example
///
/// ```ignore
/// let thunk = Thunk::new(|_state: AppState, raw: Fetch, env: Arc<Env>| {
///     async move {
///         match env.client.get(&raw.url).await {
///             Ok(body) => Action::refined(Refined::Loaded(body)),
///             Err(e) => Action::refined(Refined::Failed(e.to_string())),
///         }
///     }
///     .into_stream()
///     .boxed()
/// });
/// ```
pub struct Thunk<S, R, F, E> {
    resolve: Arc<ResolveFn<S, R, F, E>>,
}

impl<S, R, F, E> Clone for Thunk<S, R, F, E> {
    fn clone(&self) -> Self {
        Self {
            resolve: self.resolve.clone(),
        }
    }
}

impl<S, R, F, E> Thunk<S, R, F, E>
where
    S: Clone + Send + 'static,
    R: Send + 'static,
    F: Send + 'static,
    E: Send + Sync + 'static,
{
    /// Create a thunk from a function returning a stream of actions.
    pub fn new<T>(resolve: T) -> Self
    where
        T: Fn(S, R, Arc<E>) -> ActionStream<R, F> + Send + Sync + 'static,
    {
        Self {
            resolve: Arc::new(resolve),
        }
    }

    /// Create a thunk from a synchronous function returning a list of actions.
    pub fn from_fn<T>(resolve: T) -> Self
    where
        T: Fn(S, R, &E) -> Vec<Action<R, F>> + Send + Sync + 'static,
    {
        Self::new(move |state, raw, env: Arc<E>| {
            stream::iter(resolve(state, raw, &env)).boxed()
        })
    }

    /// A thunk that resolves every raw action to nothing.
    pub fn empty() -> Self {
        Self::new(|_, _, _| {
            trace!("no thunk configured, dropping raw action");
            stream::empty().boxed()
        })
    }

    /// Resolve with `self`, then with `other`, concatenating their output.
    pub fn concat(self, other: Self) -> Self
    where
        R: Clone,
    {
        let first = self;
        let second = other;
        Self::new(move |state: S, raw: R, env: Arc<E>| {
            first
                .resolve(state.clone(), raw.clone(), env.clone())
                .chain(second.resolve(state, raw, env))
                .boxed()
        })
    }

    /// Invoke the thunk once, without recursing into raw output.
    pub fn resolve(&self, snapshot: S, raw: R, env: Arc<E>) -> ActionStream<R, F> {
        (self.resolve)(snapshot, raw, env)
    }

    /// Fully unfold a list of raw actions into groups of refined actions.
    ///
    /// Groups are yielded in emission order, depth first. Empty groups are
    /// skipped.
    pub(crate) fn unfold(
        &self,
        snapshot: S,
        env: Arc<E>,
        raw: Vec<R>,
    ) -> BoxStream<'static, Vec<F>> {
        let resolution = Resolution {
            thunk: self.clone(),
            snapshot,
            env,
            stack: vec![split(raw)],
        };

        stream::unfold(resolution, |mut resolution| async move {
            let group = resolution.next_group().await?;
            Some((group, resolution))
        })
        .boxed()
    }
}

impl<S, R, F, E> Default for Thunk<S, R, F, E>
where
    S: Clone + Send + 'static,
    R: Send + 'static,
    F: Send + 'static,
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::empty()
    }
}

impl<S, R, F, E> std::fmt::Debug for Thunk<S, R, F, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thunk").finish_non_exhaustive()
    }
}

// =============================================================================
// Resolution (explicit work stack)
// =============================================================================

/// State of one in-progress unfolding.
///
/// The stack holds one stream per level of nesting. The top stream is polled
/// until it ends; raw output pushes a new level instead of recursing.
struct Resolution<S, R, F, E> {
    thunk: Thunk<S, R, F, E>,
    snapshot: S,
    env: Arc<E>,
    stack: Vec<ActionStream<R, F>>,
}

impl<S, R, F, E> Resolution<S, R, F, E>
where
    S: Clone + Send + 'static,
    R: Send + 'static,
    F: Send + 'static,
    E: Send + Sync + 'static,
{
    async fn next_group(&mut self) -> Option<Vec<F>> {
        loop {
            let top = self.stack.last_mut()?;
            match top.next().await {
                None => {
                    self.stack.pop();
                }
                Some(Action::Refined(group)) => {
                    if !group.is_empty() {
                        return Some(group);
                    }
                }
                Some(Action::Raw(raws)) => {
                    let mut raws = raws.into_iter();
                    match (raws.next(), raws.len()) {
                        (Some(raw), 0) => {
                            trace!(depth = self.stack.len(), "resolving raw action");
                            let next =
                                self.thunk
                                    .resolve(self.snapshot.clone(), raw, self.env.clone());
                            self.stack.push(next);
                        }
                        (Some(raw), _) => {
                            self.stack
                                .push(split(std::iter::once(raw).chain(raws).collect()));
                        }
                        (None, _) => {}
                    }
                }
            }
        }
    }
}

/// Turn a list of raw actions into a stream of single raw actions.
fn split<R, F>(raws: Vec<R>) -> ActionStream<R, F>
where
    R: Send + 'static,
    F: Send + 'static,
{
    stream::iter(raws.into_iter().map(Action::raw)).boxed()
}
