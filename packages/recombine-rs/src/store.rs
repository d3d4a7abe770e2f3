//! Store - owns the state and drives actions through the pipeline.
//!
//! ```text
//!  dispatch ──► gate ──► raw channel
//!                 │
//!                 ├─ refined only ─► middleware ─► delivery        (inline)
//!                 │
//!                 └─ has raw ─► work queue ─► pump ─► task per call
//!                                                      │
//!                                 thunk unfold (serial / concurrent)
//!                                                      │
//!                                 pre-middleware channel
//!                                                      │
//!                                 middleware ──Emit──► work queue
//!                                                      │ Forward
//!                                 delivery ─► post-middleware ─► side effects
//!                                          ─► reducer ─► all states / states / paired
//! ```
//!
//! # Guarantees
//!
//! - **Single writer**: every reduction goes through one committer, one
//!   batch at a time
//! - **Serial calls keep order**: groups of a serial call are delivered in
//!   submission order, depth first
//! - **Collect is atomic**: a collecting call reduces one batch and
//!   publishes at most one state
//! - **Gate drops silently**: while dispatch is disabled, calls (including
//!   middleware redispatches) are discarded without error
//!
//! Ordering *across* separate calls is not guaranteed once thunks are
//! involved.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::action::{Action, DispatchOptions, DispatchPolicy, DispatchRequest};
use crate::channels::{Channels, Paired, DEFAULT_CAPACITY};
use crate::config::StoreConfig;
use crate::delivery::{Committer, Deliverer, Delivery};
use crate::middleware::Middleware;
use crate::reducer::Reducer;
use crate::replay::{self, Recording, ReplayHandle};
use crate::side_effect::SideEffect;
use crate::thunk::Thunk;

// =============================================================================
// Dispatched
// =============================================================================

/// Receipt for one dispatch call.
///
/// Dropping the receipt does not cancel the call.
#[derive(Debug)]
pub struct Dispatched {
    pending: Vec<oneshot::Receiver<()>>,
    dropped: bool,
}

impl Dispatched {
    fn pending(pending: Vec<oneshot::Receiver<()>>) -> Self {
        Self {
            pending,
            dropped: false,
        }
    }

    fn dropped() -> Self {
        Self {
            pending: Vec::new(),
            dropped: true,
        }
    }

    /// Returns `true` if the call was discarded because dispatch was disabled.
    pub fn was_dropped(&self) -> bool {
        self.dropped
    }

    /// Wait until every batch produced by this call has been reduced and
    /// published.
    ///
    /// Redispatches emitted by middleware are separate calls and are not
    /// awaited. Resolves immediately for a dropped call.
    pub async fn settled(self) {
        for committed in self.pending {
            // A closed ack means the store shut down; nothing left to wait for.
            let _ = committed.await;
        }
    }
}

// =============================================================================
// Shared
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Caller,
    Middleware,
}

/// A call waiting for thunk resolution.
struct Queued<R, F> {
    request: DispatchRequest<R, F>,
    done: oneshot::Sender<()>,
}

struct Shared<S, R, F, E> {
    deliverer: Deliverer<S, R, F, E>,
    channels: Arc<Channels<S, R, F>>,
    thunk: Thunk<S, R, F, E>,
    middleware: Middleware<S, R, F, E>,
    env: Arc<E>,
    enabled: Arc<watch::Sender<bool>>,
    redispatch: DispatchOptions,
    queue: mpsc::UnboundedSender<Queued<R, F>>,
    replay: Mutex<Option<AbortHandle>>,
    replay_generation: Arc<AtomicU64>,
}

impl<S, R, F, E> Shared<S, R, F, E>
where
    S: Clone + PartialEq + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    F: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn committer(&self) -> &Committer<S, R, F, E> {
        self.deliverer.committer()
    }

    fn state(&self) -> S {
        self.committer().state()
    }

    fn submit(&self, request: DispatchRequest<R, F>, origin: Origin) -> Dispatched {
        if !*self.enabled.borrow() {
            trace!(?origin, actions = request.actions.len(), "dispatch disabled, dropping call");
            return Dispatched::dropped();
        }

        for action in &request.actions {
            if let Action::Raw(raws) = action {
                self.channels.publish_raw(raws);
            }
        }

        let needs_resolution = request
            .actions
            .iter()
            .any(|action| action.is_raw() && !action.is_empty());

        if origin == Origin::Caller && !needs_resolution {
            let DispatchRequest { options, actions } = request;
            let groups = actions
                .into_iter()
                .filter_map(|action| match action {
                    Action::Refined(group) if !group.is_empty() => Some(group),
                    _ => None,
                })
                .collect();
            return Dispatched::pending(self.deliver_groups(groups, options.collect));
        }

        let (done, settled) = oneshot::channel();
        if self.queue.send(Queued { request, done }).is_err() {
            warn!("work queue closed, dropping call");
        }
        Dispatched::pending(vec![settled])
    }

    fn deliver_groups(&self, groups: Vec<Vec<F>>, collect: bool) -> Vec<oneshot::Receiver<()>> {
        if collect {
            let batch: Vec<F> = groups.into_iter().flatten().collect();
            if batch.is_empty() {
                return Vec::new();
            }
            return self.handle_group(batch).into_iter().collect();
        }
        groups
            .into_iter()
            .filter_map(|group| self.handle_group(group))
            .collect()
    }

    /// Run one refined group through middleware and deliver what survives.
    fn handle_group(&self, group: Vec<F>) -> Option<oneshot::Receiver<()>> {
        self.channels.publish_pre_middleware(&group);

        let snapshot = self.state();
        let (forwarded, emitted) = self.middleware.run_batch(&snapshot, group, &self.env);
        trace!(
            forwarded = forwarded.len(),
            emitted = emitted.len(),
            "middleware ran"
        );

        let committed = (!forwarded.is_empty()).then(|| self.deliverer.deliver(forwarded));

        for action in emitted {
            let request = DispatchRequest {
                options: self.redispatch,
                actions: vec![action],
            };
            self.submit(request, Origin::Middleware);
        }

        committed
    }

    fn inject(&self, batch: Vec<F>) -> Option<oneshot::Receiver<()>> {
        if batch.is_empty() {
            return None;
        }
        trace!(actions = batch.len(), "injecting batch, bypassing middleware");
        Some(self.deliverer.deliver(batch))
    }

    /// Lazily resolve one raw action against the state at the time it
    /// starts.
    fn resolve_unit(self: &Arc<Self>, raw: R) -> BoxStream<'static, Vec<F>> {
        let shared = Arc::clone(self);
        stream::once(async move {
            let snapshot = shared.state();
            shared.thunk.unfold(snapshot, shared.env.clone(), vec![raw])
        })
        .flatten()
        .boxed()
    }

    fn units(self: &Arc<Self>, action: Action<R, F>) -> Vec<BoxStream<'static, Vec<F>>> {
        match action {
            Action::Raw(raws) => raws.into_iter().map(|raw| self.resolve_unit(raw)).collect(),
            Action::Refined(group) if group.is_empty() => Vec::new(),
            Action::Refined(group) => vec![stream::once(future::ready(group)).boxed()],
        }
    }

    async fn process(self: Arc<Self>, queued: Queued<R, F>) {
        let Queued { request, done } = queued;
        let DispatchRequest { options, actions } = request;
        debug!(
            policy = ?options.policy,
            collect = options.collect,
            actions = actions.len(),
            "resolving dispatch"
        );

        let units: Vec<_> = actions
            .into_iter()
            .flat_map(|action| self.units(action))
            .collect();

        let committed = if options.collect {
            let groups: Vec<Vec<F>> = match options.policy {
                DispatchPolicy::Serial => stream::iter(units).flatten().collect().await,
                DispatchPolicy::Concurrent => {
                    future::join_all(units.into_iter().map(|unit| unit.collect::<Vec<_>>()))
                        .await
                        .into_iter()
                        .flatten()
                        .collect()
                }
            };
            self.deliver_groups(groups, true)
        } else {
            let mut groups = match options.policy {
                DispatchPolicy::Serial => stream::iter(units).flatten().boxed(),
                DispatchPolicy::Concurrent => stream::select_all(units).boxed(),
            };
            let mut committed = Vec::new();
            while let Some(group) = groups.next().await {
                let Some(ack) = self.handle_group(group) else {
                    continue;
                };
                // The next serial unit snapshots the state, so this group
                // must be reduced first.
                if options.policy == DispatchPolicy::Serial {
                    let _ = ack.await;
                } else {
                    committed.push(ack);
                }
            }
            committed
        };

        for ack in committed {
            let _ = ack.await;
        }
        let _ = done.send(());
    }
}

impl<S, R, F, E> Drop for Shared<S, R, F, E> {
    fn drop(&mut self) {
        let running = self
            .replay
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(replay) = running.take() {
            replay.abort();
        }
    }
}

/// Spawn a processing task for every queued call.
///
/// Holds only a weak reference so the queue closes once every store handle
/// is gone.
async fn pump<S, R, F, E>(shared: Weak<Shared<S, R, F, E>>, mut queue: mpsc::UnboundedReceiver<Queued<R, F>>)
where
    S: Clone + PartialEq + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    F: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    while let Some(queued) = queue.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        tokio::spawn(shared.process(queued));
    }
    debug!("work queue closed");
}

// =============================================================================
// Store
// =============================================================================

/// Unidirectional state container.
///
/// Cheap to clone; clones share the same state and pipeline.
pub struct Store<S, R, F, E> {
    shared: Arc<Shared<S, R, F, E>>,
}

impl<S, R, F, E> Clone for Store<S, R, F, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S, R, F, E> Store<S, R, F, E>
where
    S: Clone + PartialEq + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    F: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Start building a store.
    pub fn builder(initial_state: S, reducer: Reducer<S, F, E>, environment: E) -> StoreBuilder<S, R, F, E> {
        StoreBuilder::new(initial_state, reducer, environment)
    }

    /// Current state.
    pub fn state(&self) -> S {
        self.shared.state()
    }

    /// Receiver that always holds the current state.
    pub fn watch_state(&self) -> watch::Receiver<S> {
        self.shared.committer().watch()
    }

    /// The environment shared with thunks, middleware, reducer and side
    /// effects.
    pub fn environment(&self) -> &Arc<E> {
        &self.shared.env
    }

    /// Submit a list of actions.
    pub fn dispatch<I>(&self, options: DispatchOptions, actions: I) -> Dispatched
    where
        I: IntoIterator<Item = Action<R, F>>,
    {
        let request = DispatchRequest {
            options,
            actions: actions.into_iter().collect(),
        };
        self.shared.submit(request, Origin::Caller)
    }

    /// Submit actions with the serial policy.
    pub fn dispatch_serial<I>(&self, actions: I) -> Dispatched
    where
        I: IntoIterator<Item = Action<R, F>>,
    {
        self.dispatch(DispatchOptions::serial(), actions)
    }

    /// Submit actions with the concurrent policy.
    pub fn dispatch_concurrent<I>(&self, actions: I) -> Dispatched
    where
        I: IntoIterator<Item = Action<R, F>>,
    {
        self.dispatch(DispatchOptions::concurrent(), actions)
    }

    /// Submit one group of refined actions.
    pub fn dispatch_refined<I>(&self, actions: I) -> Dispatched
    where
        I: IntoIterator<Item = F>,
    {
        self.dispatch(
            DispatchOptions::default(),
            [Action::Refined(actions.into_iter().collect())],
        )
    }

    /// Submit raw actions with the default options.
    pub fn dispatch_raw<I>(&self, actions: I) -> Dispatched
    where
        I: IntoIterator<Item = R>,
    {
        self.dispatch(
            DispatchOptions::default(),
            [Action::Raw(actions.into_iter().collect())],
        )
    }

    /// Returns `false` while dispatch calls are being dropped.
    pub fn dispatch_enabled(&self) -> bool {
        *self.shared.enabled.borrow()
    }

    /// Open or close the dispatch gate.
    ///
    /// Re-enabling dispatch interrupts a running replay.
    pub fn set_dispatch_enabled(&self, enabled: bool) {
        let previous = self.shared.enabled.send_replace(enabled);
        if previous != enabled {
            debug!(enabled, "dispatch gate changed");
        }
    }

    /// Reduce a refined batch directly, skipping thunk and middleware.
    ///
    /// The batch still reaches the post-middleware channel and side effects.
    /// Ignores the dispatch gate.
    pub fn inject_bypassing_middleware(&self, batch: Vec<F>) -> Dispatched {
        Dispatched::pending(self.shared.inject(batch).into_iter().collect())
    }

    /// Re-inject a recording with its original timing.
    ///
    /// Dispatch is disabled for the duration. A replay already running is
    /// aborted first.
    pub fn replay(&self, recording: Recording<F>) -> ReplayHandle {
        let mut running = self.shared.replay.lock().unwrap_or_else(|poisoned| {
            warn!("replay lock was poisoned, recovering");
            poisoned.into_inner()
        });
        if let Some(previous) = running.take() {
            debug!("aborting running replay");
            previous.abort();
        }

        let generation = self.shared.replay_generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, batches = recording.len(), "starting replay");

        self.set_dispatch_enabled(false);
        let gate = self.shared.enabled.subscribe();
        let target = Arc::downgrade(&self.shared);
        let inject = move |batch: Vec<F>| {
            if let Some(shared) = target.upgrade() {
                shared.inject(batch);
            }
        };

        let task = tokio::spawn(replay::run(
            recording,
            gate,
            self.shared.enabled.clone(),
            inject,
        ));
        *running = Some(task.abort_handle());
        ReplayHandle::new(
            task,
            self.shared.enabled.clone(),
            generation,
            self.shared.replay_generation.clone(),
        )
    }

    /// Every raw action submitted, in submission order.
    pub fn subscribe_raw(&self) -> broadcast::Receiver<R> {
        self.shared.channels.subscribe_raw()
    }

    /// Every refined group as it enters the middleware.
    pub fn subscribe_pre_middleware(&self) -> broadcast::Receiver<Vec<F>> {
        self.shared.channels.subscribe_pre_middleware()
    }

    /// Every batch about to be reduced, including injected ones.
    pub fn subscribe_post_middleware(&self) -> broadcast::Receiver<Arc<[F]>> {
        self.shared.channels.subscribe_post_middleware()
    }

    /// Every state produced by a reduction, including ones equal to the
    /// previous state.
    pub fn subscribe_all_states(&self) -> broadcast::Receiver<S> {
        self.shared.channels.subscribe_all_states()
    }

    /// Every published state. Subject to state deduplication.
    pub fn subscribe_states(&self) -> broadcast::Receiver<S> {
        self.shared.channels.subscribe_states()
    }

    /// Every reduction with the states around it, changed or not.
    pub fn subscribe_paired(&self) -> broadcast::Receiver<Arc<Paired<S, F>>> {
        self.shared.channels.subscribe_paired()
    }
}

impl<S, R, F, E> std::fmt::Debug for Store<S, R, F, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("dispatch_enabled", &*self.shared.enabled.borrow())
            .field("redispatch", &self.shared.redispatch)
            .field("channels", &self.shared.channels)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// StoreBuilder
// =============================================================================

/// Builder for [`Store`].
pub struct StoreBuilder<S, R, F, E> {
    initial_state: S,
    reducer: Reducer<S, F, E>,
    env: Arc<E>,
    thunk: Option<Thunk<S, R, F, E>>,
    middleware: Option<Middleware<S, R, F, E>>,
    side_effect: Option<SideEffect<F, E>>,
    delivery: Delivery,
    dedupe_states: bool,
    channel_capacity: usize,
    redispatch: DispatchOptions,
}

impl<S, R, F, E> StoreBuilder<S, R, F, E>
where
    S: Clone + PartialEq + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    F: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Create a builder owning its environment.
    pub fn new(initial_state: S, reducer: Reducer<S, F, E>, environment: E) -> Self {
        Self::with_arc(initial_state, reducer, Arc::new(environment))
    }

    /// Create a builder with a shared environment.
    pub fn with_arc(initial_state: S, reducer: Reducer<S, F, E>, environment: Arc<E>) -> Self {
        Self {
            initial_state,
            reducer,
            env: environment,
            thunk: None,
            middleware: None,
            side_effect: None,
            delivery: Delivery::default(),
            dedupe_states: true,
            channel_capacity: DEFAULT_CAPACITY,
            redispatch: DispatchOptions::default(),
        }
    }

    /// Add a thunk. Several thunks concatenate their output.
    pub fn with_thunk(mut self, thunk: Thunk<S, R, F, E>) -> Self {
        self.thunk = Some(match self.thunk.take() {
            Some(existing) => existing.concat(thunk),
            None => thunk,
        });
        self
    }

    /// Append a middleware to the chain.
    pub fn with_middleware(mut self, middleware: Middleware<S, R, F, E>) -> Self {
        self.middleware = Some(match self.middleware.take() {
            Some(existing) => existing.concat(middleware),
            None => middleware,
        });
        self
    }

    /// Append a side effect.
    pub fn with_side_effect(mut self, side_effect: SideEffect<F, E>) -> Self {
        self.side_effect = Some(match self.side_effect.take() {
            Some(existing) => existing.appending(side_effect),
            None => side_effect,
        });
        self
    }

    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    /// Suppress state publications that equal the previous state.
    pub fn with_dedupe_states(mut self, dedupe: bool) -> Self {
        self.dedupe_states = dedupe;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Options used for actions emitted by middleware.
    pub fn with_redispatch_options(mut self, options: DispatchOptions) -> Self {
        self.redispatch = options;
        self
    }

    /// Apply every setting from a [`StoreConfig`].
    pub fn with_config(self, config: StoreConfig) -> Self {
        self.with_dedupe_states(config.dedupe_states)
            .with_channel_capacity(config.channel_capacity)
            .with_delivery(config.delivery)
            .with_redispatch_options(config.redispatch)
    }

    /// Build the store and start its work queue.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn build(self) -> Store<S, R, F, E> {
        let channels = Arc::new(Channels::with_capacity(self.channel_capacity));
        let committer = Arc::new(Committer::new(
            self.initial_state,
            self.reducer,
            self.side_effect.unwrap_or_default(),
            self.env.clone(),
            channels.clone(),
            self.dedupe_states,
        ));
        let deliverer = Deliverer::start(self.delivery, committer);
        let (queue, pending) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            deliverer,
            channels,
            thunk: self.thunk.unwrap_or_default(),
            middleware: self.middleware.unwrap_or_default(),
            env: self.env,
            enabled: Arc::new(watch::Sender::new(true)),
            redispatch: self.redispatch,
            queue,
            replay: Mutex::new(None),
            replay_generation: Arc::new(AtomicU64::new(0)),
        });
        tokio::spawn(pump(Arc::downgrade(&shared), pending));

        info!(
            delivery = ?self.delivery,
            dedupe_states = self.dedupe_states,
            channel_capacity = self.channel_capacity,
            "store started"
        );
        Store { shared }
    }
}

impl<S, R, F, E> std::fmt::Debug for StoreBuilder<S, R, F, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreBuilder")
            .field("delivery", &self.delivery)
            .field("dedupe_states", &self.dedupe_states)
            .field("channel_capacity", &self.channel_capacity)
            .field("redispatch", &self.redispatch)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Step;
    use crate::replay::ReplayOutcome;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    #[derive(Debug, Clone, PartialEq)]
    enum Raw {
        /// Emits the refined action twice, as two groups.
        AddTwice(String),
        /// Emits three nested raw `Add`s.
        AddThrice(String),
        Add(String),
        /// Emits the current state length.
        Measure,
    }

    type TestStore = Store<String, Raw, String, ()>;

    fn concat() -> Reducer<String, String, ()> {
        Reducer::pure(|state: String, action: &String, _: &()| state + action)
    }

    fn thunk() -> Thunk<String, Raw, String, ()> {
        Thunk::from_fn(|state: String, raw: Raw, _: &()| match raw {
            Raw::AddTwice(x) => vec![Action::refined(x.clone()), Action::refined(x)],
            Raw::AddThrice(x) => vec![Action::Raw(vec![
                Raw::Add(x.clone()),
                Raw::Add(x.clone()),
                Raw::Add(x),
            ])],
            Raw::Add(x) => vec![Action::refined(x)],
            Raw::Measure => vec![Action::refined(state.len().to_string())],
        })
    }

    fn builder() -> StoreBuilder<String, Raw, String, ()> {
        Store::builder(String::new(), concat(), ()).with_thunk(thunk())
    }

    fn drain<T: Clone>(receiver: &mut broadcast::Receiver<T>) -> Vec<T> {
        let mut items = Vec::new();
        loop {
            match receiver.try_recv() {
                Ok(item) => items.push(item),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => return items,
            }
        }
    }

    #[tokio::test]
    async fn test_refined_dispatch_reduces_before_returning() {
        let store: TestStore = builder().build();
        let receipt = store.dispatch_refined(["a".to_string(), "b".to_string()]);

        assert_eq!(store.state(), "ab");
        assert!(!receipt.was_dropped());
        receipt.settled().await;
    }

    #[tokio::test]
    async fn test_serial_dispatch_publishes_in_order() {
        let store: TestStore = builder().build();
        let mut states = store.subscribe_states();

        store
            .dispatch_serial([
                Action::raw(Raw::AddTwice("5".into())),
                Action::refined("X".to_string()),
            ])
            .settled()
            .await;

        assert_eq!(drain(&mut states), vec!["5", "55", "55X"]);
    }

    #[tokio::test]
    async fn test_collect_publishes_one_state() {
        let store: TestStore = builder().build();
        let mut states = store.subscribe_states();

        store
            .dispatch(
                DispatchOptions::concurrent().collecting(),
                [
                    Action::raw(Raw::AddTwice("5".into())),
                    Action::refined("X".to_string()),
                ],
            )
            .settled()
            .await;

        assert_eq!(drain(&mut states), vec!["55X"]);
    }

    #[tokio::test]
    async fn test_nested_raw_actions_resolve_depth_first() {
        let store: TestStore = builder().build();
        let mut states = store.subscribe_states();

        store.dispatch_raw([Raw::AddThrice("1".into())]).settled().await;

        assert_eq!(drain(&mut states), vec!["1", "11", "111"]);
    }

    #[tokio::test]
    async fn test_serial_thunk_sees_previous_reductions() {
        let store: TestStore = builder().build();

        store
            .dispatch_serial([
                Action::raw(Raw::Add("abc".into())),
                Action::raw(Raw::Measure),
            ])
            .settled()
            .await;

        assert_eq!(store.state(), "abc3");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serial_thunk_sees_previous_reductions_on_dedicated_thread() {
        for _ in 0..20 {
            let store: TestStore = builder().with_delivery(Delivery::Dedicated).build();

            store
                .dispatch_serial([
                    Action::raw(Raw::Add("abc".into())),
                    Action::raw(Raw::Measure),
                ])
                .settled()
                .await;

            assert_eq!(store.state(), "abc3");
        }
    }

    #[tokio::test]
    async fn test_raw_channel_sees_submitted_actions() {
        let store: TestStore = builder().build();
        let mut raw = store.subscribe_raw();

        store
            .dispatch_raw([Raw::Add("x".into()), Raw::Measure])
            .settled()
            .await;

        assert_eq!(drain(&mut raw), vec![Raw::Add("x".into()), Raw::Measure]);
    }

    #[tokio::test]
    async fn test_gate_drops_calls() {
        let store: TestStore = builder().build();
        store.set_dispatch_enabled(false);

        let receipt = store.dispatch_refined(["x".to_string()]);
        assert!(receipt.was_dropped());
        receipt.settled().await;
        assert_eq!(store.state(), "");

        store.set_dispatch_enabled(true);
        store.dispatch_refined(["y".to_string()]).settled().await;
        assert_eq!(store.state(), "y");
    }

    #[tokio::test]
    async fn test_middleware_emit_is_redispatched() {
        let middleware = Middleware::new(|_: &String, action: String, _: &()| {
            if action == "ping" {
                vec![
                    Step::Forward(action),
                    Step::Emit(Action::raw(Raw::Add("pong".into()))),
                ]
            } else {
                vec![Step::Forward(action)]
            }
        });
        let store: TestStore = builder().with_middleware(middleware).build();
        let mut state = store.watch_state();

        store.dispatch_refined(["ping".to_string()]).settled().await;
        assert_eq!(store.state(), "ping");

        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|state| state == "pingpong"),
        )
        .await
        .expect("redispatch never arrived")
        .unwrap();
    }

    #[tokio::test]
    async fn test_inject_bypasses_middleware() {
        let blocking = Middleware::identity().filter(|_: &String, _: &String, _: &()| false);
        let store: TestStore = builder().with_middleware(blocking).build();
        let mut post = store.subscribe_post_middleware();

        store.dispatch_refined(["blocked".to_string()]).settled().await;
        assert_eq!(store.state(), "");

        store
            .inject_bypassing_middleware(vec!["x".to_string()])
            .settled()
            .await;
        assert_eq!(store.state(), "x");
        assert_eq!(&*post.try_recv().unwrap(), &["x".to_string()]);
    }

    #[tokio::test]
    async fn test_dedupe_suppresses_equal_states() {
        let reducer = Reducer::pure(|state: String, action: &String, _: &()| {
            if action == "noop" {
                state
            } else {
                state + action
            }
        });
        let store: TestStore = Store::builder(String::new(), reducer, ()).build();
        let mut states = store.subscribe_states();
        let mut paired = store.subscribe_paired();

        store.dispatch_refined(["a".to_string()]);
        store.dispatch_refined(["noop".to_string()]);

        assert_eq!(drain(&mut states), vec!["a"]);
        let steps = drain(&mut paired);
        assert_eq!(steps.len(), 2);
        assert!(!steps[1].changed());
    }

    #[tokio::test]
    async fn test_all_states_channel_ignores_dedupe() {
        let store: TestStore = builder().build();
        let mut states = store.subscribe_states();
        let mut all = store.subscribe_all_states();

        store.dispatch_refined(["a".to_string()]);
        store.dispatch_refined([String::new()]);

        assert_eq!(drain(&mut states), vec!["a"]);
        assert_eq!(drain(&mut all), vec!["a", "a"]);
    }

    #[tokio::test]
    async fn test_dedupe_disabled_publishes_every_reduction() {
        let store: TestStore = builder().with_dedupe_states(false).build();
        let mut states = store.subscribe_states();

        store.dispatch_refined([String::new()]);

        assert_eq!(drain(&mut states), vec![""]);
    }

    #[tokio::test]
    async fn test_dedicated_delivery_settles() {
        let store: TestStore = builder().with_delivery(Delivery::Dedicated).build();

        store.dispatch_refined(["a".to_string()]).settled().await;
        store.dispatch_raw([Raw::AddTwice("b".into())]).settled().await;

        assert_eq!(store.state(), "abb");
    }

    #[tokio::test]
    async fn test_dropping_store_stops_delivery_thread() {
        let token = Arc::new(());
        let held = token.clone();
        let store: TestStore = builder()
            .with_delivery(Delivery::Dedicated)
            .with_side_effect(SideEffect::new(move |_: &[String], _: &()| {
                let _ = &held;
            }))
            .build();

        store.dispatch_refined(["a".to_string()]).settled().await;
        assert_eq!(Arc::strong_count(&token), 2);
        drop(store);

        // The side effect lives in the committer, which the delivery thread
        // releases when it exits.
        tokio::time::timeout(Duration::from_secs(5), async {
            while Arc::strong_count(&token) > 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("delivery thread kept running after the store was dropped");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_replay_handle_cannot_stop_newer_replay() {
        let store: TestStore = builder().build();
        let first = store.replay(Recording::from_secs([(0.0, vec!["a".to_string()])]).unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!first.is_running());

        let second = store.replay(
            Recording::from_secs([(0.0, vec!["b".to_string()]), (1.0, vec!["c".to_string()])])
                .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        first.stop();

        assert!(!store.dispatch_enabled());
        assert!(second.is_running());
        assert_eq!(second.finished().await, ReplayOutcome::Completed);
        assert_eq!(store.state(), "abc");
    }

    #[tokio::test]
    async fn test_builder_composes_side_effects_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = log.clone();
        let second = log.clone();
        let store: TestStore = builder()
            .with_side_effect(SideEffect::new(move |batch: &[String], _: &()| {
                first.lock().unwrap().push(format!("first {}", batch.join("")));
            }))
            .with_side_effect(SideEffect::new(move |batch: &[String], _: &()| {
                second.lock().unwrap().push(format!("second {}", batch.join("")));
            }))
            .build();

        store.dispatch_refined(["x".to_string()]);

        assert_eq!(*log.lock().unwrap(), vec!["first x", "second x"]);
    }
}
