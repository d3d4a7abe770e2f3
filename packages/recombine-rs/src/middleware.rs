//! Middleware - synchronous transform stage between resolution and reduction.
//!
//! Every refined action produced by thunk resolution passes through the
//! middleware chain before it reaches the reducer. A middleware may
//! forward, rewrite, multiply or drop the action, and may ask the store to
//! start a brand-new dispatch:
//!
//! ```text
//! action ─► middleware A ─► [Forward(a1), Emit(Raw(x)), Forward(a2)]
//!                               │             │             │
//!                               ▼             │             ▼
//!                         middleware B        │       middleware B
//!                               │             ▼             │
//!                               ▼       store work queue    ▼
//!                            reducer                     reducer
//! ```
//!
//! # Redispatch
//!
//! Middleware never calls back into the store. Returning [`Step::Emit`]
//! hands an action to the store, which submits it as a new top-level
//! dispatch once the current batch has been delivered. This is the
//! mechanism for "drop this action now, deliver a transformed one later".
//!
//! # Composition
//!
//! [`Middleware::concat`] is a flat-map: each forwarded action of the first
//! middleware independently runs through the second. Emitted actions skip
//! the rest of the chain. Composition is associative.

use std::sync::Arc;

use crate::action::Action;

/// One output of a middleware call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<R, F> {
    /// Continue down the chain with this action.
    Forward(F),
    /// Submit this action to the store as a new dispatch.
    Emit(Action<R, F>),
}

type TransformFn<S, R, F, E> = dyn Fn(&S, F, &E) -> Vec<Step<R, F>> + Send + Sync;

/// Transform stage applied to every refined action before reduction.
///
/// # Example
///
/// ```ignore
/// let middleware = Middleware::identity()
///     .filter(|_state, action: &Refined, _env| !action.is_noise())
///     .map(|state, action, _env| action.stamped(state.clock));
/// ```
pub struct Middleware<S, R, F, E> {
    transform: Arc<TransformFn<S, R, F, E>>,
}

impl<S, R, F, E> Clone for Middleware<S, R, F, E> {
    fn clone(&self) -> Self {
        Self {
            transform: self.transform.clone(),
        }
    }
}

impl<S, R, F, E> Middleware<S, R, F, E>
where
    S: 'static,
    R: 'static,
    F: 'static,
    E: 'static,
{
    /// Create a middleware from a transform function.
    pub fn new<T>(transform: T) -> Self
    where
        T: Fn(&S, F, &E) -> Vec<Step<R, F>> + Send + Sync + 'static,
    {
        Self {
            transform: Arc::new(transform),
        }
    }

    /// A middleware that forwards every action unchanged.
    pub fn identity() -> Self {
        Self::new(|_, action, _| vec![Step::Forward(action)])
    }

    /// Run the transform for a single action.
    pub fn transform(&self, state: &S, action: F, env: &E) -> Vec<Step<R, F>> {
        (self.transform)(state, action, env)
    }

    /// Feed every forwarded output of `self` through `other`.
    pub fn concat(self, other: Self) -> Self {
        Self::new(move |state, action, env| {
            let mut steps = Vec::new();
            for step in self.transform(state, action, env) {
                match step {
                    Step::Forward(action) => steps.extend(other.transform(state, action, env)),
                    emit @ Step::Emit(_) => steps.push(emit),
                }
            }
            steps
        })
    }

    /// Rewrite every forwarded action.
    pub fn map<T>(self, transform: T) -> Self
    where
        T: Fn(&S, F, &E) -> F + Send + Sync + 'static,
    {
        self.concat(Self::new(move |state, action, env| {
            vec![Step::Forward(transform(state, action, env))]
        }))
    }

    /// Turn every forwarded action into any number of actions.
    pub fn flat_map<T, I>(self, transform: T) -> Self
    where
        T: Fn(&S, F, &E) -> I + Send + Sync + 'static,
        I: IntoIterator<Item = F>,
    {
        self.concat(Self::new(move |state, action, env| {
            transform(state, action, env)
                .into_iter()
                .map(Step::Forward)
                .collect()
        }))
    }

    /// Rewrite forwarded actions, dropping those mapped to `None`.
    pub fn filter_map<T>(self, transform: T) -> Self
    where
        T: Fn(&S, F, &E) -> Option<F> + Send + Sync + 'static,
    {
        self.concat(Self::new(move |state, action, env| {
            transform(state, action, env)
                .map(Step::Forward)
                .into_iter()
                .collect()
        }))
    }

    /// Drop forwarded actions for which `predicate` returns `false`.
    pub fn filter<T>(self, predicate: T) -> Self
    where
        T: Fn(&S, &F, &E) -> bool + Send + Sync + 'static,
    {
        self.concat(Self::new(move |state, action, env| {
            if predicate(state, &action, env) {
                vec![Step::Forward(action)]
            } else {
                Vec::new()
            }
        }))
    }

    /// Observe forwarded actions without altering the flow.
    pub fn inspect<T>(self, observe: T) -> Self
    where
        T: Fn(&S, &F, &E) + Send + Sync + 'static,
    {
        self.concat(Self::new(move |state, action, env| {
            observe(state, &action, env);
            vec![Step::Forward(action)]
        }))
    }

    /// Run a batch through the chain.
    ///
    /// Returns the forwarded actions, in order, and the emitted actions.
    pub(crate) fn run_batch(
        &self,
        state: &S,
        batch: Vec<F>,
        env: &E,
    ) -> (Vec<F>, Vec<Action<R, F>>) {
        let mut forwarded = Vec::with_capacity(batch.len());
        let mut emitted = Vec::new();
        for action in batch {
            for step in self.transform(state, action, env) {
                match step {
                    Step::Forward(action) => forwarded.push(action),
                    Step::Emit(action) => emitted.push(action),
                }
            }
        }
        (forwarded, emitted)
    }
}

impl<S, R, F, E> Default for Middleware<S, R, F, E>
where
    S: 'static,
    R: 'static,
    F: 'static,
    E: 'static,
{
    fn default() -> Self {
        Self::identity()
    }
}

impl<S, R, F, E> FromIterator<Middleware<S, R, F, E>> for Middleware<S, R, F, E>
where
    S: 'static,
    R: 'static,
    F: 'static,
    E: 'static,
{
    fn from_iter<I: IntoIterator<Item = Middleware<S, R, F, E>>>(iter: I) -> Self {
        iter.into_iter().fold(Self::identity(), Self::concat)
    }
}

impl<S, R, F, E> std::fmt::Debug for Middleware<S, R, F, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Middleware").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type TestMiddleware = Middleware<String, (), String, ()>;

    fn suffixing(suffix: &'static str) -> TestMiddleware {
        Middleware::identity().map(move |_, action, _| format!("{action} {suffix}"))
    }

    fn forwarded(middleware: &TestMiddleware, state: &str, action: &str) -> Vec<String> {
        middleware
            .run_batch(&state.to_string(), vec![action.to_string()], &())
            .0
    }

    #[test]
    fn test_identity_forwards() {
        assert_eq!(forwarded(&Middleware::identity(), "", "OK"), vec!["OK"]);
    }

    #[test]
    fn test_concat_applies_in_order() {
        let chain = suffixing("First Middleware").concat(suffixing("Second Middleware"));
        assert_eq!(
            forwarded(&chain, "", "OK"),
            vec!["OK First Middleware Second Middleware"]
        );
    }

    #[test]
    fn test_concat_is_associative() {
        let left = suffixing("a").concat(suffixing("b")).concat(suffixing("c"));
        let right = suffixing("a").concat(suffixing("b").concat(suffixing("c")));
        assert_eq!(forwarded(&left, "", "x"), forwarded(&right, "", "x"));
    }

    #[test]
    fn test_from_iter_composes_sequence() {
        let chain: TestMiddleware = vec![suffixing("1"), suffixing("2"), suffixing("3")]
            .into_iter()
            .collect();
        assert_eq!(forwarded(&chain, "", "go"), vec!["go 1 2 3"]);
    }

    #[test]
    fn test_filter_stops_rest_of_chain() {
        let reached = Arc::new(AtomicUsize::new(0));
        let counter = reached.clone();
        let chain = TestMiddleware::identity()
            .filter(|_, _, _| false)
            .inspect(move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        assert!(forwarded(&chain, "", "blocked").is_empty());
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_flat_map_multiplies() {
        let chain = TestMiddleware::identity()
            .flat_map(|_, action, _| vec![action.clone(), action.clone(), action])
            .filter_map(|_, action, _| Some(action.to_uppercase()));
        assert_eq!(forwarded(&chain, "", "a"), vec!["A", "A", "A"]);
    }

    #[test]
    fn test_middleware_reads_state() {
        let chain = TestMiddleware::identity().map(|state, _, _| format!("{state}{state}"));
        assert_eq!(forwarded(&chain, "ab", "ignored"), vec!["abab"]);
    }

    #[test]
    fn test_emit_skips_rest_of_chain() {
        let emitting: Middleware<String, u32, String, ()> = Middleware::new(|_, action, _| {
            vec![Step::Emit(Action::raw(7)), Step::Forward(action)]
        });
        let chain = emitting.map(|_, action, _| format!("{action}!"));

        let (forwarded, emitted) = chain.run_batch(&String::new(), vec!["hi".into()], &());
        assert_eq!(forwarded, vec!["hi!"]);
        assert_eq!(emitted, vec![Action::raw(7)]);
    }

    #[test]
    fn test_run_batch_keeps_batch_order() {
        let chain = TestMiddleware::identity()
            .flat_map(|_, action, _| vec![format!("{action}1"), format!("{action}2")]);
        let (forwarded, emitted) =
            chain.run_batch(&String::new(), vec!["a".into(), "b".into()], &());
        assert_eq!(forwarded, vec!["a1", "a2", "b1", "b2"]);
        assert!(emitted.is_empty());
    }
}
