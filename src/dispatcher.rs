//! Method dispatcher.
//!
//! The `Dispatcher` maps method identifiers to prebuilt filter chains. For
//! every call it creates a fresh `RequestContext`, runs the method's chain
//! and hands back the result container matching the method's return shape.
//! A deadline on the request (or the configured default timeout) is applied
//! to that container and, when it fires, the call fails with `Timeout` and
//! the context's cancel signal is raised.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::chain::{Dispatch, FilterChain};
use crate::config::{Config, DispatcherConfig};
use crate::context::{InvocationState, RequestContext, Value};
use crate::endpoint::{Endpoint, ReturnShape};
use crate::error::{DispatchError, DispatchResult, ErrorKind, RegistryError, RegistryResult};
use crate::filter::Filter;
use crate::future::ComposableFuture;
use crate::stream::{StreamResult, StreamSender};

/// One call as delivered by a transport.
#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    /// Method identifier
    pub method: String,
    /// Arguments in declaration order
    pub args: Vec<Value>,
    /// Absolute deadline
    pub deadline: Option<Instant>,
    /// Correlation id; generated when absent
    pub correlation_id: Option<String>,
}

impl DispatchRequest {
    /// Create a request for `method` with no arguments.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Self::default()
        }
    }

    /// Append an argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Replace the arguments.
    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Set an absolute deadline.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the deadline relative to now.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Set the correlation id.
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Routes calls to the filter chain registered for their method.
///
/// # Example
///
/// ```rust
/// use relayline::prelude::*;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let dispatcher = Dispatcher::builder()
///     .method("echo", Endpoint::sync(|ctx| Ok(ctx.args()[0].clone())))
///     .build()
///     .unwrap();
///
/// let reply = dispatcher.dispatch("echo", vec![Value::from("hi")]).value().await;
/// assert_eq!(reply, Ok(Value::from("hi")));
///
/// let missing = dispatcher.dispatch("nope", vec![]).value().await;
/// assert_eq!(missing, Err(ErrorKind::UnknownMethod("nope".into())));
/// # }
/// ```
#[derive(Debug)]
pub struct Dispatcher {
    config: DispatcherConfig,
    methods: HashMap<String, FilterChain>,
    ordered: Vec<String>,
}

impl Dispatcher {
    /// Create an empty dispatcher.
    pub fn new(config: DispatcherConfig) -> DispatchResult<Self> {
        config.validate().map_err(DispatchError::Config)?;
        Ok(Self {
            config,
            methods: HashMap::new(),
            ordered: Vec::new(),
        })
    }

    /// Start building a dispatcher.
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// The configuration in use.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Register a chain, returning an error if the method already exists.
    pub fn register(&mut self, method: impl Into<String>, chain: FilterChain) -> RegistryResult<()> {
        let method = validate_name(method.into())?;
        if self.methods.contains_key(&method) {
            return Err(RegistryError::AlreadyRegistered(method));
        }
        tracing::debug!(%method, shape = %chain.shape(), filters = chain.len(), "method registered");
        self.ordered.push(method.clone());
        self.methods.insert(method, chain);
        Ok(())
    }

    /// Register a chain, replacing any existing one for the method.
    pub fn replace(&mut self, method: impl Into<String>, chain: FilterChain) -> RegistryResult<()> {
        let method = validate_name(method.into())?;
        if !self.methods.contains_key(&method) {
            self.ordered.push(method.clone());
        }
        self.methods.insert(method, chain);
        Ok(())
    }

    /// Remove a method.
    pub fn remove(&mut self, method: &str) -> Option<FilterChain> {
        self.ordered.retain(|m| m != method);
        self.methods.remove(method)
    }

    /// Get the chain registered for a method.
    pub fn chain(&self, method: &str) -> Option<&FilterChain> {
        self.methods.get(method)
    }

    /// Return shape of a method.
    pub fn shape(&self, method: &str) -> Option<ReturnShape> {
        self.methods.get(method).map(FilterChain::shape)
    }

    /// Check if a method is registered.
    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Registered method names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.ordered.iter().map(|s| s.as_str()).collect()
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Check if no method is registered.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// A channel-backed stream sized by the configured buffer.
    pub fn stream_channel<T: Send + 'static>(&self) -> (StreamSender<T>, StreamResult<T>) {
        StreamResult::channel(self.config.stream_buffer_size)
    }

    /// Dispatch a call with no deadline beyond the configured default.
    pub fn dispatch(&self, method: &str, args: Vec<Value>) -> Dispatch {
        self.dispatch_request(DispatchRequest::new(method).args(args))
    }

    /// Dispatch a call.
    ///
    /// Unknown methods yield a failed future carrying `UnknownMethod`; no
    /// filter runs for them.
    pub fn dispatch_request(&self, request: DispatchRequest) -> Dispatch {
        let log = CallLog::new(&self.config);
        let span = log.span(&request.method);
        let _entered = span.enter();

        let Some(chain) = self.methods.get(&request.method) else {
            tracing::warn!(method = %request.method, "unknown method");
            return Dispatch::Value(ComposableFuture::from_error(ErrorKind::UnknownMethod(
                request.method,
            )));
        };

        let deadline = request
            .deadline
            .or_else(|| self.config.timeout().map(|timeout| Instant::now() + timeout));
        let mut builder = RequestContext::builder(request.method)
            .args(request.args)
            .maybe_deadline(deadline);
        if let Some(id) = request.correlation_id {
            builder = builder.correlation_id(id);
        }
        let ctx = Arc::new(builder.build());
        span.record("correlation_id", ctx.correlation_id());
        log.started(&ctx);

        match chain.invoke(ctx.clone()) {
            Dispatch::Value(future) => {
                let result = match deadline {
                    Some(deadline) => future.with_deadline(deadline),
                    None => future,
                };
                let watched = ctx.clone();
                result.on_complete(move |outcome| {
                    if matches!(outcome, Err(error) if error.is_timeout()) {
                        watched.cancellation().cancel();
                    }
                    log.finished(&watched, watched.finish(outcome.as_ref().err()), outcome);
                });
                result.on_cancel(move || {
                    ctx.cancellation().cancel();
                });
                Dispatch::Value(result)
            }
            Dispatch::Stream(stream) => {
                let stream = match deadline {
                    Some(deadline) => stream.with_deadline(deadline),
                    None => stream,
                };
                Dispatch::Stream(stream.on_terminate(move |error| {
                    if matches!(error, Some(e) if e.is_timeout() || e.is_cancelled()) {
                        ctx.cancellation().cancel();
                    }
                    log.finished(&ctx, ctx.finish(error), &error);
                }))
            }
        }
    }
}

/// What a dispatcher says about each call: `verbose` raises the level from
/// debug to info, `debug` adds the outcome itself.
#[derive(Debug, Clone, Copy, Default)]
struct CallLog {
    verbose: bool,
    debug: bool,
}

impl CallLog {
    fn new(config: &DispatcherConfig) -> Self {
        Self {
            verbose: config.is_verbose(),
            debug: config.is_debug(),
        }
    }

    fn span(&self, method: &str) -> tracing::Span {
        if self.verbose {
            tracing::info_span!("dispatch", method, correlation_id = tracing::field::Empty)
        } else {
            tracing::debug_span!("dispatch", method, correlation_id = tracing::field::Empty)
        }
    }

    fn started(&self, ctx: &RequestContext) {
        if self.verbose {
            tracing::info!(args = ctx.args().len(), "dispatch started");
        }
    }

    fn detail(&self, outcome: &dyn fmt::Debug) -> Option<String> {
        self.debug.then(|| format!("{:?}", outcome))
    }

    fn finished(&self, ctx: &RequestContext, state: InvocationState, outcome: &dyn fmt::Debug) {
        let detail = self.detail(outcome);
        let detail = detail.as_deref().unwrap_or_default();
        if self.verbose {
            tracing::info!(
                method = ctx.method(),
                correlation_id = ctx.correlation_id(),
                ?state,
                detail,
                "dispatch finished"
            );
        } else {
            tracing::debug!(
                method = ctx.method(),
                correlation_id = ctx.correlation_id(),
                ?state,
                detail,
                "dispatch finished"
            );
        }
    }
}

fn validate_name(method: String) -> RegistryResult<String> {
    if method.trim().is_empty() || method.chars().any(char::is_whitespace) {
        return Err(RegistryError::InvalidName(method));
    }
    Ok(method)
}

struct MethodEntry {
    name: String,
    endpoint: Endpoint,
    filters: Vec<Filter>,
}

/// Builder for creating dispatchers with a fluent API.
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    global_filters: Vec<Filter>,
    methods: Vec<MethodEntry>,
}

impl DispatcherBuilder {
    /// Create a new dispatcher builder.
    pub fn new() -> Self {
        Self {
            config: DispatcherConfig::default(),
            global_filters: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Use `config`.
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a filter in front of every method it can wrap.
    ///
    /// Global filters run before a method's own filters, in the order they
    /// were added. A filter is skipped for methods it cannot wrap: stream
    /// filters for value methods, value filters for stream methods, and
    /// sync filters for methods whose remainder is not synchronous.
    pub fn global_filter(mut self, filter: Filter) -> Self {
        self.global_filters.push(filter);
        self
    }

    /// Register a method without filters of its own.
    pub fn method(self, name: impl Into<String>, endpoint: Endpoint) -> Self {
        self.method_with(name, endpoint, Vec::new())
    }

    /// Register a method with its filters, outermost first.
    pub fn method_with(mut self, name: impl Into<String>, endpoint: Endpoint, filters: Vec<Filter>) -> Self {
        self.methods.push(MethodEntry {
            name: name.into(),
            endpoint,
            filters,
        });
        self
    }

    /// Build every chain and the dispatcher.
    pub fn build(self) -> DispatchResult<Dispatcher> {
        let mut dispatcher = Dispatcher::new(self.config)?;
        let sync_execution = dispatcher.config.sync_execution;

        for entry in self.methods {
            let globals: Vec<Filter> = self
                .global_filters
                .iter()
                .filter(|filter| global_applies(filter, &entry.endpoint, &entry.filters))
                .cloned()
                .collect();
            let chain = FilterChain::builder(entry.endpoint)
                .with_all(globals)
                .with_all(entry.filters)
                .sync_execution(sync_execution)
                .build()?;
            dispatcher.register(entry.name, chain)?;
        }

        tracing::debug!(
            name = dispatcher.config.name(),
            methods = dispatcher.len(),
            "dispatcher built"
        );
        Ok(dispatcher)
    }
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn global_applies(filter: &Filter, endpoint: &Endpoint, own: &[Filter]) -> bool {
    if !filter.supports(endpoint.shape()) {
        return false;
    }
    match filter {
        Filter::Sync(_) => {
            matches!(endpoint, Endpoint::Sync(_)) && !own.iter().any(|f| matches!(f, Filter::Async(_)))
        }
        _ => true,
    }
}
