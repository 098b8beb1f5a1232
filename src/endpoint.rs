//! Endpoints: the innermost handler of a filter chain.
//!
//! An endpoint declares its return shape once, when it is constructed:
//! sync, async and future-returning handlers produce a single value, stream
//! handlers produce a `StreamResult`. The dispatcher relies on that shape
//! to decide which result container a call gets.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{RequestContext, Value};
use crate::error::Outcome;
use crate::future::ComposableFuture;
use crate::stream::StreamResult;

/// The result container a method produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnShape {
    /// A single value, delivered as a `ComposableFuture`
    Value,
    /// Many values, delivered as a `StreamResult`
    Stream,
}

impl fmt::Display for ReturnShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnShape::Value => write!(f, "value"),
            ReturnShape::Stream => write!(f, "stream"),
        }
    }
}

/// Service method implemented as an async function.
///
/// # Example
///
/// ```rust
/// use relayline::prelude::*;
/// use std::sync::Arc;
///
/// struct Greeter;
///
/// #[async_trait]
/// impl AsyncHandler for Greeter {
///     async fn call(&self, ctx: Arc<RequestContext>) -> Outcome<Value> {
///         let name: String = ctx.arg(0)?;
///         Ok(Value::from(format!("hello {name}")))
///     }
/// }
///
/// let endpoint = Endpoint::handler(Greeter);
/// assert_eq!(endpoint.shape(), ReturnShape::Value);
/// ```
#[async_trait]
pub trait AsyncHandler: Send + Sync {
    /// Handle one call.
    async fn call(&self, ctx: Arc<RequestContext>) -> Outcome<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> AsyncHandler for FnHandler<F>
where
    F: Fn(Arc<RequestContext>) -> Fut + Send + Sync,
    Fut: Future<Output = Outcome<Value>> + Send + 'static,
{
    async fn call(&self, ctx: Arc<RequestContext>) -> Outcome<Value> {
        (self.0)(ctx).await
    }
}

/// Blocking handler signature.
pub type SyncHandlerFn = dyn Fn(&RequestContext) -> Outcome<Value> + Send + Sync;

/// Future-returning handler signature.
pub type FutureHandlerFn = dyn Fn(Arc<RequestContext>) -> ComposableFuture<Value> + Send + Sync;

/// Stream-returning handler signature.
pub type StreamHandlerFn = dyn Fn(Arc<RequestContext>) -> StreamResult<Value> + Send + Sync;

/// The target method of a filter chain.
#[derive(Clone)]
pub enum Endpoint {
    /// Blocking handler; runs on the blocking pool or inline per configuration
    Sync(Arc<SyncHandlerFn>),
    /// Async handler; runs as a Tokio task
    Async(Arc<dyn AsyncHandler>),
    /// Handler that returns a `ComposableFuture` itself
    Future(Arc<FutureHandlerFn>),
    /// Handler that returns a `StreamResult`
    Stream(Arc<StreamHandlerFn>),
}

impl Endpoint {
    /// Wrap a blocking closure.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&RequestContext) -> Outcome<Value> + Send + Sync + 'static,
    {
        Endpoint::Sync(Arc::new(f))
    }

    /// Wrap an `AsyncHandler` implementation.
    pub fn handler<H>(handler: H) -> Self
    where
        H: AsyncHandler + 'static,
    {
        Endpoint::Async(Arc::new(handler))
    }

    /// Wrap an async closure.
    pub fn async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<Value>> + Send + 'static,
    {
        Endpoint::Async(Arc::new(FnHandler(f)))
    }

    /// Wrap a closure returning a `ComposableFuture`.
    pub fn future<F>(f: F) -> Self
    where
        F: Fn(Arc<RequestContext>) -> ComposableFuture<Value> + Send + Sync + 'static,
    {
        Endpoint::Future(Arc::new(f))
    }

    /// Wrap a closure returning a `StreamResult`.
    pub fn stream<F>(f: F) -> Self
    where
        F: Fn(Arc<RequestContext>) -> StreamResult<Value> + Send + Sync + 'static,
    {
        Endpoint::Stream(Arc::new(f))
    }

    /// Declared return shape.
    pub fn shape(&self) -> ReturnShape {
        match self {
            Endpoint::Sync(_) | Endpoint::Async(_) | Endpoint::Future(_) => ReturnShape::Value,
            Endpoint::Stream(_) => ReturnShape::Stream,
        }
    }

    /// Short label of the handler kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Endpoint::Sync(_) => "sync",
            Endpoint::Async(_) => "async",
            Endpoint::Future(_) => "future",
            Endpoint::Stream(_) => "stream",
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("kind", &self.kind())
            .field("shape", &self.shape())
            .finish()
    }
}
