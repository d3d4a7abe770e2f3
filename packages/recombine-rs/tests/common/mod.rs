// Common test utilities
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use recombine::{Action, Middleware, Reducer, Store, StoreBuilder, Thunk};

/// Raw requests understood by [`text_thunk`].
#[derive(Debug, Clone, PartialEq)]
pub enum Raw {
    /// Two refined groups, each holding the value.
    AddTwice(String),
    /// `AddTwice(value)`, then the value once more.
    AddThrice(String),
    /// The value, after sleeping.
    Delayed { value: String, millis: u64 },
}

pub type TextStore = Store<String, Raw, String, ()>;

pub fn concat_reducer() -> Reducer<String, String, ()> {
    Reducer::pure(|state: String, action: &String, _: &()| state + action)
}

pub fn text_thunk() -> Thunk<String, Raw, String, ()> {
    Thunk::new(|_: String, raw: Raw, _: Arc<()>| match raw {
        Raw::AddTwice(value) => {
            stream::iter([Action::refined(value.clone()), Action::refined(value)]).boxed()
        }
        Raw::AddThrice(value) => stream::iter([
            Action::raw(Raw::AddTwice(value.clone())),
            Action::refined(value),
        ])
        .boxed(),
        Raw::Delayed { value, millis } => stream::once(async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Action::refined(value)
        })
        .boxed(),
    })
}

/// Store over `String` that concatenates refined actions.
pub fn text_store() -> StoreBuilder<String, Raw, String, ()> {
    Store::builder(String::new(), concat_reducer(), ()).with_thunk(text_thunk())
}

/// Middleware appending `suffix` to every action.
pub fn suffixing(suffix: &'static str) -> Middleware<String, Raw, String, ()> {
    Middleware::identity().map(move |_: &String, action: String, _: &()| action + suffix)
}

pub fn delayed(value: &str, millis: u64) -> Raw {
    Raw::Delayed {
        value: value.to_string(),
        millis,
    }
}
