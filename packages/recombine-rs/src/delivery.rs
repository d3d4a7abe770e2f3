//! Delivery context - where batches are reduced and states are published.
//!
//! Thunk resolution and middleware may run on many tasks at once, but every
//! state mutation happens in one place: the [`Committer`]. A commit is:
//!
//! ```text
//! batch ─► post-middleware channel ─► side effects ─► reducer fold
//!       ─► all-states channel ─► state publication (watch + states channel)
//!       ─► paired channel
//!       ─► acknowledgement
//! ```
//!
//! Where commits run is chosen by [`Delivery`]:
//! - `Immediate`: inline on whichever task produced the batch, under the
//!   committer's single-writer lock
//! - `Dedicated`: on one named OS thread draining an [`AtomicBuffer`]

use std::sync::{Arc, Mutex};
use std::thread;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace, warn};

use crate::buffer::AtomicBuffer;
use crate::channels::Channels;
use crate::reducer::Reducer;
use crate::side_effect::SideEffect;

/// Name of the dedicated delivery thread.
pub const DELIVERY_THREAD_NAME: &str = "recombine-delivery";

/// Execution context for reduction and state publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    /// Commit inline on the producing task. Deterministic; used by tests.
    #[default]
    Immediate,
    /// Commit on a dedicated serial thread.
    Dedicated,
}

// =============================================================================
// Committer
// =============================================================================

/// Owns the state and performs every reduction.
pub(crate) struct Committer<S, R, F, E> {
    state: watch::Sender<S>,
    reducer: Reducer<S, F, E>,
    side_effect: SideEffect<F, E>,
    env: Arc<E>,
    channels: Arc<Channels<S, R, F>>,
    dedupe: bool,
    write_lock: Mutex<()>,
}

impl<S, R, F, E> Committer<S, R, F, E>
where
    S: Clone + PartialEq + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    F: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new(
        initial: S,
        reducer: Reducer<S, F, E>,
        side_effect: SideEffect<F, E>,
        env: Arc<E>,
        channels: Arc<Channels<S, R, F>>,
        dedupe: bool,
    ) -> Self {
        Self {
            state: watch::Sender::new(initial),
            reducer,
            side_effect,
            env,
            channels,
            dedupe,
            write_lock: Mutex::new(()),
        }
    }

    /// Clone of the current state.
    pub fn state(&self) -> S {
        self.state.borrow().clone()
    }

    /// Receiver that observes the current state.
    pub fn watch(&self) -> watch::Receiver<S> {
        self.state.subscribe()
    }

    /// Reduce one batch and publish the result.
    pub fn commit(&self, batch: Arc<[F]>) {
        let _writer = self.write_lock.lock().unwrap_or_else(|poisoned| {
            warn!("commit lock was poisoned, recovering");
            poisoned.into_inner()
        });

        self.channels.publish_post_middleware(&batch);
        self.side_effect.run(&batch, &self.env);

        let previous = self.state();
        let next = self
            .reducer
            .reduce_batch(previous.clone(), &batch, &self.env);
        let changed = previous != next;

        self.channels.publish_all_states(&next);
        if changed || !self.dedupe {
            self.state.send_replace(next.clone());
            self.channels.publish_state(&next);
        }

        trace!(batch_size = batch.len(), changed, "batch committed");
        self.channels.publish_paired(batch, previous, next);
    }
}

// =============================================================================
// Deliverer
// =============================================================================

/// A batch waiting on the dedicated thread.
pub(crate) struct Job<F> {
    batch: Arc<[F]>,
    ack: oneshot::Sender<()>,
}

/// Routes batches to the committer on the configured context.
pub(crate) enum Deliverer<S, R, F, E> {
    Immediate(Arc<Committer<S, R, F, E>>),
    Dedicated {
        committer: Arc<Committer<S, R, F, E>>,
        buffer: Arc<AtomicBuffer<Job<F>>>,
    },
}

impl<S, R, F, E> Deliverer<S, R, F, E>
where
    S: Clone + PartialEq + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    F: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Start delivering on `delivery`.
    ///
    /// Falls back to immediate delivery if the dedicated thread cannot be
    /// spawned.
    pub fn start(delivery: Delivery, committer: Arc<Committer<S, R, F, E>>) -> Self {
        match delivery {
            Delivery::Immediate => Deliverer::Immediate(committer),
            Delivery::Dedicated => {
                let buffer = Arc::new(AtomicBuffer::new());
                let spawned = {
                    let committer = committer.clone();
                    let buffer = buffer.clone();
                    thread::Builder::new()
                        .name(DELIVERY_THREAD_NAME.to_string())
                        .spawn(move || run_dedicated(committer, buffer))
                };
                match spawned {
                    Ok(_) => Deliverer::Dedicated { committer, buffer },
                    Err(e) => {
                        warn!(error = %e, "failed to spawn delivery thread, delivering immediately");
                        Deliverer::Immediate(committer)
                    }
                }
            }
        }
    }

    pub fn committer(&self) -> &Arc<Committer<S, R, F, E>> {
        match self {
            Deliverer::Immediate(committer) => committer,
            Deliverer::Dedicated { committer, .. } => committer,
        }
    }

    /// Hand a batch to the delivery context.
    ///
    /// The returned receiver resolves once the batch has been committed.
    pub fn deliver(&self, batch: Vec<F>) -> oneshot::Receiver<()> {
        let (ack, committed) = oneshot::channel();
        let batch: Arc<[F]> = Arc::from(batch);
        match self {
            Deliverer::Immediate(committer) => {
                committer.commit(batch);
                let _ = ack.send(());
            }
            Deliverer::Dedicated { buffer, .. } => buffer.append(Job { batch, ack }),
        }
        committed
    }
}

impl<S, R, F, E> Drop for Deliverer<S, R, F, E> {
    fn drop(&mut self) {
        if let Deliverer::Dedicated { buffer, .. } = self {
            buffer.close();
        }
    }
}

fn run_dedicated<S, R, F, E>(committer: Arc<Committer<S, R, F, E>>, buffer: Arc<AtomicBuffer<Job<F>>>)
where
    S: Clone + PartialEq + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    F: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    debug!("delivery thread started");
    while let Some(jobs) = buffer.drain() {
        trace!(jobs = jobs.len(), "delivery buffer drained");
        for job in jobs {
            committer.commit(job.batch);
            let _ = job.ack.send(());
        }
    }
    debug!("delivery thread stopped");
}
