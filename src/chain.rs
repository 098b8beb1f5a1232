//! Filter chains.
//!
//! A `FilterChain` is the immutable pipeline for one method: an ordered
//! list of filters (outermost first) ending in an endpoint. It is built and
//! validated once, at registration, and shared by every call of the method.
//!
//! Value chains consist of any number of async filters followed by any
//! number of sync filters. A sync filter needs the remainder of the chain to
//! answer synchronously, so everything inside it must be sync as well,
//! including the endpoint. That suffix runs as one blocking unit, either on
//! Tokio's blocking pool or inline, according to [`SyncExecution`]. Stream
//! chains consist of stream filters only.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::config::SyncExecution;
use crate::context::{RequestContext, Value};
use crate::endpoint::{
    AsyncHandler, Endpoint, FutureHandlerFn, ReturnShape, StreamHandlerFn, SyncHandlerFn,
};
use crate::error::{ErrorKind, Outcome, RegistryError, RegistryResult};
use crate::filter::{AsyncFilter, Filter, StreamFilter, SyncFilter};
use crate::future::{guarded, ComposableFuture};
use crate::stream::StreamResult;

/// Result container of one dispatched call.
///
/// A call yields either a single eventual value or a stream, never both.
/// The variant is determined by the method's declared return shape.
#[derive(Debug)]
pub enum Dispatch {
    /// Single-value result
    Value(ComposableFuture<Value>),
    /// Streaming result
    Stream(StreamResult<Value>),
}

impl Dispatch {
    /// Shape of the contained result.
    pub fn shape(&self) -> ReturnShape {
        match self {
            Dispatch::Value(_) => ReturnShape::Value,
            Dispatch::Stream(_) => ReturnShape::Stream,
        }
    }

    /// Take the single-value result, if this is one.
    pub fn into_future(self) -> Option<ComposableFuture<Value>> {
        match self {
            Dispatch::Value(future) => Some(future),
            Dispatch::Stream(_) => None,
        }
    }

    /// Take the streaming result, if this is one.
    pub fn into_stream(self) -> Option<StreamResult<Value>> {
        match self {
            Dispatch::Stream(stream) => Some(stream),
            Dispatch::Value(_) => None,
        }
    }

    /// Wait for a single-value result.
    ///
    /// A streaming result is collected into a JSON array.
    pub async fn value(self) -> Outcome<Value> {
        match self {
            Dispatch::Value(future) => future.await,
            Dispatch::Stream(stream) => stream.collect().await.map(Value::Array),
        }
    }

    /// Cancel the contained result.
    pub fn cancel(&self) -> bool {
        match self {
            Dispatch::Value(future) => future.cancel(),
            Dispatch::Stream(stream) => stream.cancel(),
        }
    }
}

/// Handle to the remainder of a value chain, for async filters.
///
/// `invoke` may be called more than once; every call runs the remainder
/// again with the same context.
#[derive(Clone)]
pub struct AsyncNext {
    chain: Arc<ValueChain>,
    index: usize,
    ctx: Arc<RequestContext>,
}

impl AsyncNext {
    /// Run the remainder of the chain.
    pub fn invoke(&self) -> ComposableFuture<Value> {
        self.chain.invoke_from(self.index, self.ctx.clone())
    }

    /// Context of the call this handle belongs to.
    pub fn context(&self) -> &Arc<RequestContext> {
        &self.ctx
    }
}

impl fmt::Debug for AsyncNext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncNext")
            .field("index", &self.index)
            .field("method", &self.ctx.method())
            .finish()
    }
}

/// Handle to the synchronous remainder of a chain, for sync filters.
pub struct SyncNext<'a> {
    chain: &'a ValueChain,
    index: usize,
    ctx: &'a RequestContext,
}

impl SyncNext<'_> {
    /// Run the remainder of the chain on the current thread.
    pub fn invoke(&self) -> Outcome<Value> {
        self.chain.run_sync(self.index, self.ctx)
    }
}

impl fmt::Debug for SyncNext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncNext").field("index", &self.index).finish()
    }
}

/// Handle to the remainder of a stream chain.
#[derive(Clone)]
pub struct StreamNext {
    chain: Arc<StreamChain>,
    index: usize,
    ctx: Arc<RequestContext>,
}

impl StreamNext {
    /// Run the remainder of the chain.
    pub fn invoke(&self) -> StreamResult<Value> {
        self.chain.invoke_from(self.index, self.ctx.clone())
    }

    /// Context of the call this handle belongs to.
    pub fn context(&self) -> &Arc<RequestContext> {
        &self.ctx
    }
}

impl fmt::Debug for StreamNext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamNext")
            .field("index", &self.index)
            .field("method", &self.ctx.method())
            .finish()
    }
}

enum ValueTail {
    Sync(Arc<SyncHandlerFn>),
    Async(Arc<dyn AsyncHandler>),
    Future(Arc<FutureHandlerFn>),
}

struct ValueChain {
    async_filters: Vec<Arc<dyn AsyncFilter>>,
    sync_filters: Vec<Arc<dyn SyncFilter>>,
    tail: ValueTail,
    sync_execution: SyncExecution,
}

impl ValueChain {
    fn invoke_from(self: &Arc<Self>, index: usize, ctx: Arc<RequestContext>) -> ComposableFuture<Value> {
        let Some(filter) = self.async_filters.get(index) else {
            return self.invoke_tail(ctx);
        };

        ctx.enter(index);
        let next = AsyncNext {
            chain: self.clone(),
            index: index + 1,
            ctx: ctx.clone(),
        };
        catch_unwind(AssertUnwindSafe(|| filter.handle_async(ctx, next)))
            .unwrap_or_else(|payload| ComposableFuture::from_error(ErrorKind::from_panic(payload)))
    }

    fn invoke_tail(self: &Arc<Self>, ctx: Arc<RequestContext>) -> ComposableFuture<Value> {
        let position = self.async_filters.len();
        match &self.tail {
            ValueTail::Sync(_) => {
                let chain = self.clone();
                let run = move || chain.run_sync(0, &ctx);
                match self.sync_execution {
                    SyncExecution::Blocking => ComposableFuture::from_blocking(run),
                    SyncExecution::Inline => ComposableFuture::from_result(guarded(run)),
                }
            }
            ValueTail::Async(handler) => {
                ctx.reach_endpoint(position);
                let handler = handler.clone();
                ComposableFuture::spawn(async move { handler.call(ctx).await })
            }
            ValueTail::Future(handler) => {
                ctx.reach_endpoint(position);
                catch_unwind(AssertUnwindSafe(|| handler(ctx)))
                    .unwrap_or_else(|payload| ComposableFuture::from_error(ErrorKind::from_panic(payload)))
            }
        }
    }

    fn run_sync(&self, index: usize, ctx: &RequestContext) -> Outcome<Value> {
        let position = self.async_filters.len() + index;
        if let Some(filter) = self.sync_filters.get(index) {
            ctx.enter(position);
            let next = SyncNext {
                chain: self,
                index: index + 1,
                ctx,
            };
            return filter.handle_sync(ctx, next);
        }
        match &self.tail {
            ValueTail::Sync(handler) => {
                ctx.reach_endpoint(position);
                handler(ctx)
            }
            // Rejected by FilterChainBuilder::build.
            _ => Err(ErrorKind::HandlerFailure(
                "sync filter wraps a non-sync endpoint".to_string(),
            )),
        }
    }
}

struct StreamChain {
    filters: Vec<Arc<dyn StreamFilter>>,
    endpoint: Arc<StreamHandlerFn>,
}

impl StreamChain {
    fn invoke_from(self: &Arc<Self>, index: usize, ctx: Arc<RequestContext>) -> StreamResult<Value> {
        let Some(filter) = self.filters.get(index) else {
            ctx.reach_endpoint(index);
            let endpoint = self.endpoint.clone();
            return catch_unwind(AssertUnwindSafe(|| endpoint(ctx)))
                .unwrap_or_else(|payload| StreamResult::from_error(ErrorKind::from_panic(payload)));
        };

        ctx.enter(index);
        let next = StreamNext {
            chain: self.clone(),
            index: index + 1,
            ctx: ctx.clone(),
        };
        catch_unwind(AssertUnwindSafe(|| filter.handle_stream(ctx, next)))
            .unwrap_or_else(|payload| StreamResult::from_error(ErrorKind::from_panic(payload)))
    }
}

#[derive(Clone)]
enum Pipeline {
    Value(Arc<ValueChain>),
    Stream(Arc<StreamChain>),
}

/// Immutable, validated pipeline for one method.
///
/// # Example
///
/// ```rust
/// use relayline::prelude::*;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let chain = FilterChain::builder(Endpoint::sync(|ctx| Ok(ctx.args()[0].clone())))
///     .with(Filter::future(LoggingFilter::new()))
///     .build()
///     .unwrap();
///
/// let ctx = std::sync::Arc::new(RequestContext::builder("echo").arg("hi").build());
/// let reply = chain.invoke(ctx).value().await.unwrap();
/// assert_eq!(reply, Value::from("hi"));
/// # }
/// ```
#[derive(Clone)]
pub struct FilterChain {
    pipeline: Pipeline,
    filter_names: Vec<String>,
    endpoint_kind: &'static str,
}

impl FilterChain {
    /// Start building a chain that ends in `endpoint`.
    pub fn builder(endpoint: Endpoint) -> FilterChainBuilder {
        FilterChainBuilder::new(endpoint)
    }

    /// Return shape of the endpoint.
    pub fn shape(&self) -> ReturnShape {
        match self.pipeline {
            Pipeline::Value(_) => ReturnShape::Value,
            Pipeline::Stream(_) => ReturnShape::Stream,
        }
    }

    /// Number of filters, not counting the endpoint.
    pub fn len(&self) -> usize {
        self.filter_names.len()
    }

    /// Check whether the chain has no filters.
    pub fn is_empty(&self) -> bool {
        self.filter_names.is_empty()
    }

    /// Filter names, outermost first.
    pub fn filter_names(&self) -> Vec<&str> {
        self.filter_names.iter().map(String::as_str).collect()
    }

    /// Run the chain for one call.
    ///
    /// The context moves to a terminal state when the result resolves or
    /// the stream ends.
    pub fn invoke(&self, ctx: Arc<RequestContext>) -> Dispatch {
        match &self.pipeline {
            Pipeline::Value(chain) => {
                let future = chain.invoke_from(0, ctx.clone());
                future.on_complete(move |outcome| {
                    ctx.finish(outcome.as_ref().err());
                });
                Dispatch::Value(future)
            }
            Pipeline::Stream(chain) => {
                let stream = chain
                    .invoke_from(0, ctx.clone())
                    .on_terminate(move |error| {
                        ctx.finish(error);
                    });
                Dispatch::Stream(stream)
            }
        }
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("shape", &self.shape())
            .field("filters", &self.filter_names)
            .field("endpoint", &self.endpoint_kind)
            .finish()
    }
}

/// Builder for `FilterChain`.
#[derive(Debug)]
pub struct FilterChainBuilder {
    endpoint: Endpoint,
    filters: Vec<Filter>,
    sync_execution: SyncExecution,
}

impl FilterChainBuilder {
    /// Create a builder for a chain ending in `endpoint`.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            filters: Vec::new(),
            sync_execution: SyncExecution::default(),
        }
    }

    /// Append a filter; filters run in the order they are added.
    pub fn with(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Append several filters.
    pub fn with_all<I>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = Filter>,
    {
        self.filters.extend(filters);
        self
    }

    /// Put filters in front of the ones already added.
    pub fn prepend<I>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = Filter>,
    {
        let mut all: Vec<Filter> = filters.into_iter().collect();
        all.append(&mut self.filters);
        self.filters = all;
        self
    }

    /// Choose where the synchronous suffix runs.
    pub fn sync_execution(mut self, mode: SyncExecution) -> Self {
        self.sync_execution = mode;
        self
    }

    /// Validate and build the chain.
    ///
    /// Fails with `ShapeMismatch` when a filter cannot wrap the endpoint's
    /// shape, and with `InvalidChain` when an async filter sits inside a
    /// sync filter or sync filters wrap a non-sync endpoint.
    pub fn build(self) -> RegistryResult<FilterChain> {
        let shape = self.endpoint.shape();
        if let Some(filter) = self.filters.iter().find(|f| !f.supports(shape)) {
            return Err(RegistryError::ShapeMismatch {
                filter: filter.name().to_string(),
                shape: shape.to_string(),
            });
        }

        let filter_names = self.filters.iter().map(|f| f.name().to_string()).collect();
        let endpoint_kind = self.endpoint.kind();

        let pipeline = match self.endpoint {
            Endpoint::Stream(endpoint) => {
                let filters = self
                    .filters
                    .into_iter()
                    .filter_map(|filter| match filter {
                        Filter::Stream(f) => Some(f),
                        _ => None,
                    })
                    .collect();
                Pipeline::Stream(Arc::new(StreamChain { filters, endpoint }))
            }
            Endpoint::Sync(handler) => {
                value_pipeline(self.filters, ValueTail::Sync(handler), self.sync_execution)?
            }
            Endpoint::Async(handler) => {
                value_pipeline(self.filters, ValueTail::Async(handler), self.sync_execution)?
            }
            Endpoint::Future(handler) => {
                value_pipeline(self.filters, ValueTail::Future(handler), self.sync_execution)?
            }
        };

        Ok(FilterChain {
            pipeline,
            filter_names,
            endpoint_kind,
        })
    }
}

fn value_pipeline(
    filters: Vec<Filter>,
    tail: ValueTail,
    sync_execution: SyncExecution,
) -> RegistryResult<Pipeline> {
    let mut async_filters = Vec::new();
    let mut sync_filters: Vec<Arc<dyn SyncFilter>> = Vec::new();
    for filter in filters {
        match filter {
            Filter::Async(f) => {
                if let Some(outer) = sync_filters.last() {
                    return Err(RegistryError::InvalidChain(format!(
                        "async filter '{}' cannot run inside sync filter '{}'",
                        f.name(),
                        outer.name()
                    )));
                }
                async_filters.push(f);
            }
            Filter::Sync(f) => sync_filters.push(f),
            Filter::Stream(_) => {}
        }
    }

    if let Some(filter) = sync_filters.first() {
        if !matches!(tail, ValueTail::Sync(_)) {
            return Err(RegistryError::InvalidChain(format!(
                "sync filter '{}' requires a sync endpoint",
                filter.name()
            )));
        }
    }

    Ok(Pipeline::Value(Arc::new(ValueChain {
        async_filters,
        sync_filters,
        tail,
        sync_execution,
    })))
}
