//! Actions and dispatch requests.
//!
//! Recombine separates actions that still need work from actions the
//! reducer can consume directly:
//! - [`Action::Raw`] = requests that a [`Thunk`](crate::Thunk) must resolve
//! - [`Action::Refined`] = terminal actions that flow to the reducer
//!
//! A dispatch call carries a list of actions plus [`DispatchOptions`]
//! describing how raw actions are resolved and whether results are batched.

use serde::{Deserialize, Serialize};

// =============================================================================
// Action
// =============================================================================

/// A group of actions of one family.
///
/// Exactly one tag is active. Each variant carries a list so a single
/// dispatch can submit several actions of the same family at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action<R, F> {
    /// Actions that require asynchronous resolution.
    Raw(Vec<R>),
    /// Terminal actions consumable by the reducer.
    Refined(Vec<F>),
}

impl<R, F> Action<R, F> {
    /// Wrap a single raw action.
    pub fn raw(action: R) -> Self {
        Action::Raw(vec![action])
    }

    /// Wrap a single refined action.
    pub fn refined(action: F) -> Self {
        Action::Refined(vec![action])
    }

    /// Returns `true` for the raw family.
    pub fn is_raw(&self) -> bool {
        matches!(self, Action::Raw(_))
    }

    /// Number of actions in the group.
    pub fn len(&self) -> usize {
        match self {
            Action::Raw(actions) => actions.len(),
            Action::Refined(actions) => actions.len(),
        }
    }

    /// Returns `true` if the group carries no actions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Dispatch Options
// =============================================================================

/// How the raw actions of one dispatch call are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchPolicy {
    /// Resolve raw actions one at a time; results reach the reducer in
    /// submission order.
    Serial,
    /// Resolve raw actions concurrently; results reach the reducer in
    /// completion order.
    #[default]
    Concurrent,
}

/// Options attached to a dispatch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchOptions {
    /// Resolution policy for raw actions.
    pub policy: DispatchPolicy,
    /// When `true`, every refined result of the call is buffered and
    /// reduced as a single batch, publishing exactly one state.
    pub collect: bool,
}

impl DispatchOptions {
    /// Serial resolution, streaming results.
    pub fn serial() -> Self {
        Self {
            policy: DispatchPolicy::Serial,
            collect: false,
        }
    }

    /// Concurrent resolution, streaming results.
    pub fn concurrent() -> Self {
        Self {
            policy: DispatchPolicy::Concurrent,
            collect: false,
        }
    }

    /// Buffer all results of the call into one batch.
    pub fn collecting(mut self) -> Self {
        self.collect = true;
        self
    }
}

/// A single dispatch call as it sits on the store's work queue.
#[derive(Debug)]
pub(crate) struct DispatchRequest<R, F> {
    pub options: DispatchOptions,
    pub actions: Vec<Action<R, F>>,
}
