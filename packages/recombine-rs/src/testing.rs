//! Testing utilities for stores.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! recombine = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Waiting for states
//!
//! ```ignore
//! use recombine::testing::StateLog;
//!
//! let log = StateLog::attach(&store);
//! store.dispatch_raw([Raw::Load]);
//!
//! let states = log.wait_for(2).await;
//! assert_eq!(states, vec![loading(), loaded()]);
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::Store;

/// Install a test-friendly tracing subscriber.
///
/// Honors `RUST_LOG`, defaulting to `recombine=debug`. Safe to call from
/// every test; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "recombine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

// =============================================================================
// State Log
// =============================================================================

/// Collects every state a store publishes.
///
/// Tests should wait for meaning, not time: [`wait_for`](Self::wait_for)
/// returns as soon as the expected number of states has arrived.
///
/// For tests that might hang, wrap the wait in `tokio::time::timeout`.
#[derive(Debug)]
pub struct StateLog<S> {
    states: Arc<Mutex<Vec<S>>>,
    notify: Arc<Notify>,
    collector: JoinHandle<()>,
}

impl<S: Clone + Send + 'static> StateLog<S> {
    /// Subscribe to a store's states channel.
    pub fn attach<R, F, E>(store: &Store<S, R, F, E>) -> Self
    where
        S: PartialEq + Sync,
        R: Clone + Send + Sync + 'static,
        F: Clone + Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        Self::from_receiver(store.subscribe_states())
    }

    /// Collect from any state receiver.
    pub fn from_receiver(mut receiver: broadcast::Receiver<S>) -> Self {
        let states = Arc::new(Mutex::new(Vec::new()));
        let notify = Arc::new(Notify::new());

        let collector = {
            let states = states.clone();
            let notify = notify.clone();
            tokio::spawn(async move {
                loop {
                    match receiver.recv().await {
                        Ok(state) => {
                            lock(&states).push(state);
                            notify.notify_waiters();
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "state log lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            })
        };

        Self {
            states,
            notify,
            collector,
        }
    }

    /// States collected so far.
    pub fn states(&self) -> Vec<S> {
        lock(&self.states).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.states).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` states were collected, then return them.
    pub async fn wait_for(&self, count: usize) -> Vec<S> {
        loop {
            // Register for notification BEFORE checking the count
            let notified = self.notify.notified();

            if self.len() >= count {
                return self.states();
            }

            notified.await;
        }
    }
}

impl<S> Drop for StateLog<S> {
    fn drop(&mut self) {
        self.collector.abort();
    }
}

fn lock<S>(states: &Mutex<Vec<S>>) -> MutexGuard<'_, Vec<S>> {
    states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
