//! Recording and timed replay of refined batches.
//!
//! A [`Recorder`] installed as a side effect captures every batch the store
//! reduces, together with its offset from the moment recording started.
//! [`Store::replay`](crate::Store::replay) feeds such a [`Recording`] back
//! in with the same timing:
//!
//! ```text
//! gate closed ─► sleep until start + delay ─► inject batch ─► ... ─► gate open
//!                        ▲
//!                        └── gate re-opened externally ─► Interrupted
//! ```
//!
//! Delays are offsets from the start of the replay, not gaps between
//! batches. Batches are injected in recording order even when the delays are
//! not monotonic. Injected batches bypass thunks and middleware.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::side_effect::SideEffect;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplayError {
    #[error("invalid replay delay {0}s: must be finite and non-negative")]
    InvalidDelay(f64),
}

/// Convert a delay in seconds, rejecting negative and non-finite values.
fn delay_from_secs(secs: f64) -> Result<Duration, ReplayError> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(ReplayError::InvalidDelay(secs));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| ReplayError::InvalidDelay(secs))
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(delay: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(delay.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        super::delay_from_secs(secs).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Recording
// =============================================================================

/// One batch and when it should be injected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedBatch<F> {
    /// Offset from the start of the replay. Serialized as seconds.
    #[serde(with = "seconds")]
    pub delay: Duration,
    pub actions: Vec<F>,
}

/// Ordered list of timed batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Recording<F> {
    batches: Vec<RecordedBatch<F>>,
}

impl<F> Recording<F> {
    pub fn new() -> Self {
        Self {
            batches: Vec::new(),
        }
    }

    /// Build a recording from `(seconds, actions)` pairs.
    pub fn from_secs<I>(batches: I) -> Result<Self, ReplayError>
    where
        I: IntoIterator<Item = (f64, Vec<F>)>,
    {
        batches
            .into_iter()
            .map(|(secs, actions)| {
                Ok(RecordedBatch {
                    delay: delay_from_secs(secs)?,
                    actions,
                })
            })
            .collect()
    }

    /// Append a batch at `delay` from the start.
    pub fn push(&mut self, delay: Duration, actions: Vec<F>) {
        self.batches.push(RecordedBatch { delay, actions });
    }

    pub fn batches(&self) -> &[RecordedBatch<F>] {
        &self.batches
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Offset of the last batch, i.e. how long a full replay takes.
    pub fn duration(&self) -> Duration {
        self.batches
            .iter()
            .map(|batch| batch.delay)
            .max()
            .unwrap_or_default()
    }
}

impl<F> Default for Recording<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> FromIterator<RecordedBatch<F>> for Recording<F> {
    fn from_iter<I: IntoIterator<Item = RecordedBatch<F>>>(iter: I) -> Self {
        Self {
            batches: iter.into_iter().collect(),
        }
    }
}

impl<F> IntoIterator for Recording<F> {
    type Item = RecordedBatch<F>;
    type IntoIter = std::vec::IntoIter<RecordedBatch<F>>;

    fn into_iter(self) -> Self::IntoIter {
        self.batches.into_iter()
    }
}

// =============================================================================
// Recorder
// =============================================================================

/// Captures reduced batches with their timing.
///
/// Clones share the same log.
pub struct Recorder<F> {
    started: Instant,
    batches: Arc<Mutex<Vec<RecordedBatch<F>>>>,
}

impl<F> Clone for Recorder<F> {
    fn clone(&self) -> Self {
        Self {
            started: self.started,
            batches: self.batches.clone(),
        }
    }
}

impl<F: Clone + Send + Sync + 'static> Recorder<F> {
    /// Start recording now.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            batches: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<RecordedBatch<F>>> {
        self.batches.lock().unwrap_or_else(|poisoned| {
            warn!("recorder mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Record one batch at the current offset.
    pub fn record(&self, batch: &[F]) {
        let delay = self.started.elapsed();
        trace!(actions = batch.len(), delay_ms = delay.as_millis() as u64, "batch recorded");
        self.lock().push(RecordedBatch {
            delay,
            actions: batch.to_vec(),
        });
    }

    /// A side effect feeding this recorder.
    pub fn side_effect<E: 'static>(&self) -> SideEffect<F, E> {
        let recorder = self.clone();
        SideEffect::new(move |batch: &[F], _: &E| recorder.record(batch))
    }

    /// Everything recorded so far.
    pub fn snapshot(&self) -> Recording<F> {
        self.lock().iter().cloned().collect()
    }

    /// Forget everything recorded so far. Offsets keep counting from the
    /// original start.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl<F: Clone + Send + Sync + 'static> Default for Recorder<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> std::fmt::Debug for Recorder<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Replay task
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Every batch was injected and dispatch was re-enabled.
    Completed,
    /// Dispatch was re-enabled, or a newer replay started, before the end.
    Interrupted,
}

/// Handle to a running replay.
///
/// Each replay started on a store gets the next generation number. A handle
/// only controls the replay it was returned for.
///
/// Dropping the handle does not stop the replay.
pub struct ReplayHandle {
    task: JoinHandle<ReplayOutcome>,
    gate: Arc<watch::Sender<bool>>,
    generation: u64,
    current: Arc<AtomicU64>,
}

impl ReplayHandle {
    pub(crate) fn new(
        task: JoinHandle<ReplayOutcome>,
        gate: Arc<watch::Sender<bool>>,
        generation: u64,
        current: Arc<AtomicU64>,
    ) -> Self {
        Self {
            task,
            gate,
            generation,
            current,
        }
    }

    /// Returns `true` while this replay is running and no newer replay has
    /// started.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished() && self.current.load(Ordering::SeqCst) == self.generation
    }

    /// Re-enable dispatch, which interrupts the replay.
    ///
    /// Does nothing once this replay has finished or been superseded.
    pub fn stop(&self) {
        if !self.is_running() {
            debug!(generation = self.generation, "replay already over, ignoring stop");
            return;
        }
        self.gate.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the replay to end.
    pub async fn finished(self) -> ReplayOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(error = %e, "replay task ended early");
                ReplayOutcome::Interrupted
            }
        }
    }
}

impl std::fmt::Debug for ReplayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayHandle")
            .field("generation", &self.generation)
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}

async fn reopened(gate: &mut watch::Receiver<bool>) {
    let _ = gate.wait_for(|enabled| *enabled).await;
}

/// Inject every batch at its offset while the gate stays closed.
pub(crate) async fn run<F, I>(
    recording: Recording<F>,
    mut gate: watch::Receiver<bool>,
    enabled: Arc<watch::Sender<bool>>,
    inject: I,
) -> ReplayOutcome
where
    F: Send + 'static,
    I: Fn(Vec<F>) + Send + 'static,
{
    let start = Instant::now();
    let total = recording.len();
    info!(batches = total, "replay started");

    for (index, batch) in recording.into_iter().enumerate() {
        tokio::select! {
            biased;
            _ = reopened(&mut gate) => {
                info!(injected = index, total, "replay interrupted");
                return ReplayOutcome::Interrupted;
            }
            _ = sleep_until(start + batch.delay) => {}
        }
        trace!(index, actions = batch.actions.len(), "injecting recorded batch");
        inject(batch.actions);
    }

    enabled.send_replace(true);
    info!(batches = total, "replay completed");
    ReplayOutcome::Completed
}
