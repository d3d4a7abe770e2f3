//! # Recombine
//!
//! A unidirectional state container that separates asynchronous work from
//! pure state transitions.
//!
//! ## Core Concepts
//!
//! Recombine separates **requests** from **facts**:
//! - [`Action::Raw`] = Requests (need async resolution by a [`Thunk`])
//! - [`Action::Refined`] = Facts (consumed directly by the [`Reducer`])
//!
//! The key principle: **thunks do IO, reducers do math**. Anything that
//! waits happens before the middleware; anything that mutates happens in one
//! place, one batch at a time.
//!
//! ## Architecture
//!
//! ```text
//! dispatch(options, [Raw | Refined, ...])
//!     │
//!     ▼ gate (dispatch_enabled)
//! Work queue ─────────────────────────────────────┐
//!     │                                           │
//!     ▼ thunk unfold (serial / concurrent)        │
//! Refined groups                                  │
//!     │                                           │
//!     ▼ pre-middleware channel                    │
//! Middleware chain ─► Emit(action) ───────────────┘
//!     │ Forward
//!     ▼
//! Delivery (immediate | dedicated thread)
//!     │
//!     ├─► post-middleware channel
//!     ├─► side effects
//!     ├─► reducer fold
//!     └─► all states / states / paired channels
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Single writer** - Every reduction runs through one committer
//! 2. **Snapshots, not bindings** - Thunks and middleware read a cloned state
//! 3. **Serial is ordered** - A serial call reduces groups in submission order
//! 4. **Collect is atomic** - A collecting call publishes at most one state
//! 5. **Side effects observe** - They see batches but cannot alter them
//!
//! ## Guarantees
//!
//! - **At-most-once delivery**: Slow subscribers lag and miss items
//! - **In-memory only**: Nothing is persisted; use a [`Recorder`] to capture
//!   batches for [`Store::replay`]
//! - **No cycle detection**: Raw actions that resolve to themselves, or
//!   middleware that keeps emitting, never terminate
//!
//! ## Example
//!
//! ```ignore
//! use recombine::{Action, Reducer, Store, Thunk};
//!
//! #[derive(Debug, Clone, PartialEq, Default)]
//! struct Feed { items: Vec<String>, loading: bool }
//!
//! #[derive(Debug, Clone)]
//! enum Request { Refresh }
//!
//! #[derive(Debug, Clone)]
//! enum Fact { Loading, Loaded(Vec<String>) }
//!
//! let thunk = Thunk::new(|_feed: Feed, _req: Request, api: Arc<Api>| {
//!     stream::once(async { Action::refined(Fact::Loading) })
//!         .chain(stream::once(async move { Action::refined(Fact::Loaded(api.fetch().await)) }))
//!         .boxed()
//! });
//!
//! let reducer = Reducer::mutating(|feed: &mut Feed, fact: &Fact, _| match fact {
//!     Fact::Loading => feed.loading = true,
//!     Fact::Loaded(items) => {
//!         feed.loading = false;
//!         feed.items = items.clone();
//!     }
//! });
//!
//! let store = Store::builder(Feed::default(), reducer, api)
//!     .with_thunk(thunk)
//!     .build();
//!
//! store.dispatch_raw([Request::Refresh]).settled().await;
//! assert!(!store.state().loading);
//! ```

// Core modules
mod action;
mod buffer;
mod channels;
mod config;
mod delivery;
mod middleware;
mod reducer;
mod replay;
mod side_effect;
mod store;
mod thunk;

// Testing utilities (feature-gated)
#[cfg(feature = "testing")]
pub mod testing;


// Re-export action types
pub use action::{Action, DispatchOptions, DispatchPolicy};

// Re-export pipeline stages
pub use middleware::{Middleware, Step};
pub use reducer::Reducer;
pub use side_effect::SideEffect;
pub use thunk::{ActionStream, Thunk};

// Re-export store types (primary entry point)
pub use store::{Dispatched, Store, StoreBuilder};

// Re-export delivery and channel types
pub use buffer::AtomicBuffer;
pub use channels::{Paired, DEFAULT_CAPACITY};
pub use delivery::{Delivery, DELIVERY_THREAD_NAME};

// Re-export replay types
pub use replay::{RecordedBatch, Recorder, Recording, ReplayError, ReplayHandle, ReplayOutcome};

// Re-export configuration
pub use config::StoreConfig;
