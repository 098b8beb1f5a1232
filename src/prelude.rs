//! Prelude module for convenient imports.
//!
//! This module re-exports the most commonly used types and traits
//! from Relayline for convenient glob imports.
//!
//! # Example
//!
//! ```rust
//! use relayline::prelude::*;
//! ```

// Configuration
pub use crate::config::{
    Config, DispatcherConfig, DispatcherConfigOverlay, FileConfig, MergeableConfig, SyncExecution,
};

// Results
pub use crate::cancel::CancelSignal;
pub use crate::future::{ComposableFuture, Promise};
pub use crate::stream::{create_stream, EventStream, StreamBuilder, StreamResult, StreamSender};

// Pipeline
pub use crate::chain::{AsyncNext, Dispatch, FilterChain, StreamNext, SyncNext};
pub use crate::context::{InvocationState, RequestContext, Value};
pub use crate::dispatcher::{DispatchRequest, Dispatcher};
pub use crate::endpoint::{AsyncHandler, Endpoint, ReturnShape};
pub use crate::filter::{AsyncFilter, Filter, StreamFilter, SyncFilter};

// Built-in filters
pub use crate::filters::{
    ConcurrencyLimitStrategy, HitCounts, HitsCounterFilter, LoggingFilter, PushBackFilter,
    PushBackStrategy, RetryFilter, TimeoutFilter,
};

// Mapping
pub use crate::mapping::{EntityMapper, ResultSetMapper};

// Errors
pub use crate::error::{
    DispatchError, DispatchResult, ErrorKind, Outcome, RegistryError, RegistryResult,
};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
