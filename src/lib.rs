//! # Relayline
//!
//! **Relayline** is the request-dispatch core of a service framework: it
//! turns a method call into an asynchronous, filter-intercepted execution
//! that completes with a single value or a stream of values.
//!
//! ## Overview
//!
//! - **`ComposableFuture`**: resolve-once result container with `map`,
//!   `flat_map`, `recover`, `with_timeout` and `combine`
//! - **`StreamResult`**: push-based, cancellable, single-subscriber stream
//! - **`RequestContext`**: per-call metadata and a filter attribute map
//! - **Filters**: sync, async and stream middleware wrapping every call
//! - **`FilterChain`**: validated pipeline of filters ending in an endpoint
//! - **`Dispatcher`**: routes calls to chains and enforces deadlines
//!
//! ## Flow
//!
//! ```text
//! Dispatcher → FilterChain → Filter₁ → … → Filterₙ → endpoint
//!                                                       │
//! caller ← Dispatcher ← (post-processing by filters) ←──┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use relayline::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let dispatcher = Dispatcher::builder()
//!     .global_filter(Filter::future(LoggingFilter::new()))
//!     .method(
//!         "reverse",
//!         Endpoint::sync(|ctx| {
//!             let text: String = ctx.arg(0)?;
//!             Ok(Value::from(text.chars().rev().collect::<String>()))
//!         }),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let reply = dispatcher.dispatch("reverse", vec![Value::from("hi")]).value().await;
//! assert_eq!(reply, Ok(Value::from("ih")));
//! # }
//! ```
//!
//! ## Cancellation
//!
//! Cancellation is cooperative. Cancelling a result, or letting its
//! deadline pass, resolves it for the caller and raises the call's
//! [`CancelSignal`]; the handler keeps running until it observes the
//! signal or finishes on its own.

mod cancel;
mod chain;
mod config;
mod context;
mod dispatcher;
mod endpoint;
mod error;
mod filter;
pub mod filters;
mod future;
pub mod mapping;
pub mod stream;

pub mod prelude;

// Re-export core types
pub use cancel::CancelSignal;
pub use chain::{AsyncNext, Dispatch, FilterChain, FilterChainBuilder, StreamNext, SyncNext};
pub use config::{
    Config, DispatcherConfig, DispatcherConfigOverlay, FileConfig, MergeableConfig, SyncExecution,
};
pub use context::{InvocationState, RequestContext, RequestContextBuilder, Value};
pub use dispatcher::{DispatchRequest, Dispatcher, DispatcherBuilder};
pub use endpoint::{AsyncHandler, Endpoint, ReturnShape};
pub use error::{
    DispatchError, DispatchResult, ErrorKind, Outcome, RegistryError, RegistryResult,
};
pub use filter::{AsyncFilter, Filter, StreamFilter, SyncFilter};
pub use future::{ComposableFuture, Promise};
pub use stream::{create_stream, EventStream, StreamBuilder, StreamResult, StreamSender, Subscription};

// Re-export async-trait for convenience
pub use async_trait::async_trait;
