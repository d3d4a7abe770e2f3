//! Broadcast channels exposed by the store.
//!
//! The store republishes every stage of the pipeline on its own channel:
//!
//! | Channel          | Item                    | Published when                          |
//! |------------------|-------------------------|-----------------------------------------|
//! | raw              | `R`                     | a raw action is submitted               |
//! | pre-middleware   | `Vec<F>`                | a resolved group enters the middleware  |
//! | post-middleware  | `Arc<[F]>`              | a batch is about to be reduced          |
//! | all states       | `S`                     | every reduction, changed or not         |
//! | states           | `S`                     | a reduction publishes a (changed) state |
//! | paired           | `Arc<Paired<S, F>>`     | every reduction, changed or not         |
//!
//! # Guarantees
//!
//! - **Multi-subscriber**: every receiver sees every item sent after it
//!   subscribed
//! - **At-most-once delivery**: slow receivers get `RecvError::Lagged`
//! - **No replay**: items sent before subscription are not received
//!
//! Nothing is cloned for a channel that has no receivers.

use std::sync::Arc;

use tokio::sync::broadcast;

/// Default capacity of each channel.
pub const DEFAULT_CAPACITY: usize = 1024;

/// One reduction step: the batch that was folded and the states around it.
#[derive(Debug, Clone, PartialEq)]
pub struct Paired<S, F> {
    /// The post-middleware batch that was reduced.
    pub actions: Arc<[F]>,
    /// State before the batch.
    pub previous: S,
    /// State after the batch.
    pub next: S,
}

impl<S: PartialEq, F> Paired<S, F> {
    /// Returns `true` if the batch changed the state.
    pub fn changed(&self) -> bool {
        self.previous != self.next
    }
}

/// The set of broadcast channels owned by one store.
pub(crate) struct Channels<S, R, F> {
    raw: broadcast::Sender<R>,
    pre_middleware: broadcast::Sender<Vec<F>>,
    post_middleware: broadcast::Sender<Arc<[F]>>,
    all_states: broadcast::Sender<S>,
    states: broadcast::Sender<S>,
    paired: broadcast::Sender<Arc<Paired<S, F>>>,
}

impl<S: Clone, R: Clone, F: Clone> Channels<S, R, F> {
    /// Create all channels with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            raw: broadcast::channel(capacity).0,
            pre_middleware: broadcast::channel(capacity).0,
            post_middleware: broadcast::channel(capacity).0,
            all_states: broadcast::channel(capacity).0,
            states: broadcast::channel(capacity).0,
            paired: broadcast::channel(capacity).0,
        }
    }

    pub fn publish_raw(&self, actions: &[R]) -> usize {
        if self.raw.receiver_count() == 0 {
            return 0;
        }
        actions
            .iter()
            .map(|action| self.raw.send(action.clone()).unwrap_or(0))
            .max()
            .unwrap_or(0)
    }

    pub fn publish_pre_middleware(&self, group: &[F]) -> usize {
        if self.pre_middleware.receiver_count() == 0 {
            return 0;
        }
        self.pre_middleware.send(group.to_vec()).unwrap_or(0)
    }

    pub fn publish_post_middleware(&self, batch: &Arc<[F]>) -> usize {
        self.post_middleware.send(batch.clone()).unwrap_or(0)
    }

    pub fn publish_all_states(&self, state: &S) -> usize {
        if self.all_states.receiver_count() == 0 {
            return 0;
        }
        self.all_states.send(state.clone()).unwrap_or(0)
    }

    pub fn publish_state(&self, state: &S) -> usize {
        if self.states.receiver_count() == 0 {
            return 0;
        }
        self.states.send(state.clone()).unwrap_or(0)
    }

    pub fn publish_paired(&self, actions: Arc<[F]>, previous: S, next: S) -> usize {
        if self.paired.receiver_count() == 0 {
            return 0;
        }
        self.paired
            .send(Arc::new(Paired {
                actions,
                previous,
                next,
            }))
            .unwrap_or(0)
    }
}

impl<S, R, F> Channels<S, R, F> {
    pub fn subscribe_raw(&self) -> broadcast::Receiver<R> {
        self.raw.subscribe()
    }

    pub fn subscribe_pre_middleware(&self) -> broadcast::Receiver<Vec<F>> {
        self.pre_middleware.subscribe()
    }

    pub fn subscribe_post_middleware(&self) -> broadcast::Receiver<Arc<[F]>> {
        self.post_middleware.subscribe()
    }

    pub fn subscribe_all_states(&self) -> broadcast::Receiver<S> {
        self.all_states.subscribe()
    }

    pub fn subscribe_states(&self) -> broadcast::Receiver<S> {
        self.states.subscribe()
    }

    pub fn subscribe_paired(&self) -> broadcast::Receiver<Arc<Paired<S, F>>> {
        self.paired.subscribe()
    }

    /// Receiver counts per channel, for debugging.
    pub fn receiver_counts(&self) -> [usize; 6] {
        [
            self.raw.receiver_count(),
            self.pre_middleware.receiver_count(),
            self.post_middleware.receiver_count(),
            self.all_states.receiver_count(),
            self.states.receiver_count(),
            self.paired.receiver_count(),
        ]
    }
}

impl<S, R, F> std::fmt::Debug for Channels<S, R, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [raw, pre_middleware, post_middleware, all_states, states, paired] =
            self.receiver_counts();
        f.debug_struct("Channels")
            .field("raw", &raw)
            .field("pre_middleware", &pre_middleware)
            .field("post_middleware", &post_middleware)
            .field("all_states", &all_states)
            .field("states", &states)
            .field("paired", &paired)
            .finish()
    }
}
