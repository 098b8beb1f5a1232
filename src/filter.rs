//! Filter traits.
//!
//! A filter wraps every invocation of the methods it is attached to. Given
//! the call's context and a handle to the remainder of the chain it may
//! inspect or annotate the context, short-circuit by answering itself, or
//! delegate by invoking `next` and post-processing the result.
//!
//! Filters come in three shapes, unified by the [`Filter`] enum:
//!
//! - [`SyncFilter`] runs on the calling thread and sees the remainder's
//!   outcome synchronously. It can only wrap a synchronous remainder.
//! - [`AsyncFilter`] returns a `ComposableFuture` and never blocks.
//! - [`StreamFilter`] returns a `StreamResult` and wraps stream endpoints.
//!
//! Filters hold no per-call state. Anything a call needs to carry between
//! filters goes into the context's attribute map.

use std::fmt;
use std::sync::Arc;

use crate::chain::{AsyncNext, StreamNext, SyncNext};
use crate::context::{RequestContext, Value};
use crate::endpoint::ReturnShape;
use crate::error::Outcome;
use crate::future::ComposableFuture;
use crate::stream::StreamResult;

/// Filter executed synchronously on the calling thread.
///
/// # Example
///
/// ```rust
/// use relayline::prelude::*;
///
/// struct RequireArgs;
///
/// impl SyncFilter for RequireArgs {
///     fn handle_sync(&self, ctx: &RequestContext, next: SyncNext<'_>) -> Outcome<Value> {
///         if ctx.args().is_empty() {
///             return Err(ErrorKind::HandlerFailure("arguments required".into()));
///         }
///         next.invoke()
///     }
/// }
/// ```
pub trait SyncFilter: Send + Sync {
    /// Name used in logs and chain errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Handle a call, usually by invoking `next` once.
    fn handle_sync(&self, ctx: &RequestContext, next: SyncNext<'_>) -> Outcome<Value>;
}

/// Filter producing a `ComposableFuture`.
pub trait AsyncFilter: Send + Sync {
    /// Name used in logs and chain errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Handle a call; may short-circuit, delegate or transform.
    fn handle_async(&self, ctx: Arc<RequestContext>, next: AsyncNext) -> ComposableFuture<Value>;
}

/// Filter producing a `StreamResult`.
pub trait StreamFilter: Send + Sync {
    /// Name used in logs and chain errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Handle a streaming call.
    fn handle_stream(&self, ctx: Arc<RequestContext>, next: StreamNext) -> StreamResult<Value>;
}

/// A filter of any shape.
#[derive(Clone)]
pub enum Filter {
    /// Synchronous filter
    Sync(Arc<dyn SyncFilter>),
    /// Future-producing filter
    Async(Arc<dyn AsyncFilter>),
    /// Stream-producing filter
    Stream(Arc<dyn StreamFilter>),
}

impl Filter {
    /// Wrap a `SyncFilter`.
    pub fn sync<F: SyncFilter + 'static>(filter: F) -> Self {
        Filter::Sync(Arc::new(filter))
    }

    /// Wrap an `AsyncFilter`.
    pub fn future<F: AsyncFilter + 'static>(filter: F) -> Self {
        Filter::Async(Arc::new(filter))
    }

    /// Wrap a `StreamFilter`.
    pub fn stream<F: StreamFilter + 'static>(filter: F) -> Self {
        Filter::Stream(Arc::new(filter))
    }

    /// The wrapped filter's name.
    pub fn name(&self) -> &str {
        match self {
            Filter::Sync(f) => f.name(),
            Filter::Async(f) => f.name(),
            Filter::Stream(f) => f.name(),
        }
    }

    /// Check whether this filter can wrap an endpoint of `shape`.
    pub fn supports(&self, shape: ReturnShape) -> bool {
        match self {
            Filter::Sync(_) | Filter::Async(_) => shape == ReturnShape::Value,
            Filter::Stream(_) => shape == ReturnShape::Stream,
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Filter::Sync(_) => "Sync",
            Filter::Async(_) => "Async",
            Filter::Stream(_) => "Stream",
        };
        f.debug_tuple(kind).field(&self.name()).finish()
    }
}
