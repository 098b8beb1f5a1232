//! Built-in filters.
//!
//! - [`LoggingFilter`] logs the start and end of every call.
//! - [`HitsCounterFilter`] counts calls per method.
//! - [`RetryFilter`] re-runs the remainder of the chain after a failure.
//! - [`TimeoutFilter`] bounds the remainder of the chain in time.
//! - [`PushBackFilter`] rejects calls a [`PushBackStrategy`] refuses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::chain::{AsyncNext, StreamNext, SyncNext};
use crate::context::{RequestContext, Value};
use crate::error::{ErrorKind, Outcome};
use crate::filter::{AsyncFilter, StreamFilter, SyncFilter};
use crate::future::ComposableFuture;
use crate::stream::StreamResult;

/// Logs entry and exit of every call through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct LoggingFilter {
    _private: (),
}

impl LoggingFilter {
    /// Create a logging filter.
    pub fn new() -> Self {
        Self::default()
    }
}

fn log_start(ctx: &RequestContext) {
    tracing::info!(
        method = ctx.method(),
        correlation_id = ctx.correlation_id(),
        args = ctx.args().len(),
        "call started"
    );
}

fn log_end(ctx: &RequestContext, started: Instant, error: Option<&ErrorKind>) {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match error {
        None => tracing::info!(
            method = ctx.method(),
            correlation_id = ctx.correlation_id(),
            elapsed_ms,
            "call succeeded"
        ),
        Some(error) => tracing::warn!(
            method = ctx.method(),
            correlation_id = ctx.correlation_id(),
            elapsed_ms,
            %error,
            "call failed"
        ),
    }
}

impl SyncFilter for LoggingFilter {
    fn name(&self) -> &str {
        "logging"
    }

    fn handle_sync(&self, ctx: &RequestContext, next: SyncNext<'_>) -> Outcome<Value> {
        let started = Instant::now();
        log_start(ctx);
        let outcome = next.invoke();
        log_end(ctx, started, outcome.as_ref().err());
        outcome
    }
}

impl AsyncFilter for LoggingFilter {
    fn name(&self) -> &str {
        "logging"
    }

    fn handle_async(&self, ctx: Arc<RequestContext>, next: AsyncNext) -> ComposableFuture<Value> {
        let started = Instant::now();
        log_start(&ctx);
        let result = next.invoke();
        result.on_complete(move |outcome| log_end(&ctx, started, outcome.as_ref().err()));
        result
    }
}

impl StreamFilter for LoggingFilter {
    fn name(&self) -> &str {
        "logging"
    }

    fn handle_stream(&self, ctx: Arc<RequestContext>, next: StreamNext) -> StreamResult<Value> {
        let started = Instant::now();
        log_start(&ctx);
        let emitted = Arc::new(AtomicUsize::new(0));
        let counter = emitted.clone();
        next.invoke()
            .map(move |value| {
                counter.fetch_add(1, Ordering::Relaxed);
                value
            })
            .on_terminate(move |error| {
                tracing::debug!(
                    method = ctx.method(),
                    events = emitted.load(Ordering::Relaxed),
                    "stream ended"
                );
                log_end(&ctx, started, error);
            })
    }
}

/// Call counts of one method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HitCounts {
    /// Calls that entered the filter
    pub total: u64,
    /// Calls that resolved successfully
    pub success: u64,
    /// Calls that failed
    pub error: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    success: AtomicU64,
    error: AtomicU64,
}

impl Counters {
    fn record(&self, ok: bool) {
        if ok {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.error.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> HitCounts {
        HitCounts {
            total: self.total.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            error: self.error.load(Ordering::Relaxed),
        }
    }
}

/// Counts total, successful and failed calls per method.
///
/// Share one instance across methods with an `Arc` and read the counts
/// back through [`HitsCounterFilter::counts`].
///
/// ```rust
/// use relayline::prelude::*;
/// use std::sync::Arc;
///
/// let hits = Arc::new(HitsCounterFilter::new());
/// let filter = Filter::Async(hits.clone());
/// assert_eq!(hits.counts("echo"), HitCounts::default());
/// # let _ = filter;
/// ```
#[derive(Debug, Default)]
pub struct HitsCounterFilter {
    methods: Mutex<HashMap<String, Arc<Counters>>>,
}

impl HitsCounterFilter {
    /// Create a counter with no recorded calls.
    pub fn new() -> Self {
        Self::default()
    }

    fn enter(&self, method: &str) -> Arc<Counters> {
        let counters = self
            .methods
            .lock()
            .entry(method.to_string())
            .or_default()
            .clone();
        counters.total.fetch_add(1, Ordering::Relaxed);
        counters
    }

    /// Counts recorded for `method`.
    pub fn counts(&self, method: &str) -> HitCounts {
        self.methods
            .lock()
            .get(method)
            .map(|counters| counters.snapshot())
            .unwrap_or_default()
    }

    /// Methods seen so far, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Forget all counts.
    pub fn reset(&self) {
        self.methods.lock().clear();
    }
}

impl SyncFilter for HitsCounterFilter {
    fn name(&self) -> &str {
        "hits-counter"
    }

    fn handle_sync(&self, ctx: &RequestContext, next: SyncNext<'_>) -> Outcome<Value> {
        let counters = self.enter(ctx.method());
        let outcome = next.invoke();
        counters.record(outcome.is_ok());
        outcome
    }
}

impl AsyncFilter for HitsCounterFilter {
    fn name(&self) -> &str {
        "hits-counter"
    }

    fn handle_async(&self, ctx: Arc<RequestContext>, next: AsyncNext) -> ComposableFuture<Value> {
        let counters = self.enter(ctx.method());
        let result = next.invoke();
        result.on_complete(move |outcome| counters.record(outcome.is_ok()));
        result
    }
}

impl StreamFilter for HitsCounterFilter {
    fn name(&self) -> &str {
        "hits-counter"
    }

    fn handle_stream(&self, ctx: Arc<RequestContext>, next: StreamNext) -> StreamResult<Value> {
        let counters = self.enter(ctx.method());
        next.invoke()
            .on_terminate(move |error| counters.record(error.is_none()))
    }
}

type RetryPredicate = dyn Fn(&ErrorKind) -> bool + Send + Sync;

/// Re-runs the remainder of the chain when it fails.
///
/// By default only `HandlerFailure` is retried; timeouts, cancellations and
/// mapping failures are returned as they are.
#[derive(Clone)]
pub struct RetryFilter {
    retries: usize,
    retry_if: Arc<RetryPredicate>,
}

impl std::fmt::Debug for RetryFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryFilter")
            .field("retries", &self.retries)
            .finish()
    }
}

impl RetryFilter {
    /// Allow up to `retries` additional attempts.
    pub fn new(retries: usize) -> Self {
        Self {
            retries,
            retry_if: Arc::new(|error: &ErrorKind| matches!(error, ErrorKind::HandlerFailure(_))),
        }
    }

    /// Decide which errors are retried.
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ErrorKind) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Arc::new(predicate);
        self
    }
}

fn attempt(next: AsyncNext, remaining: usize, retry_if: Arc<RetryPredicate>) -> ComposableFuture<Value> {
    next.invoke().recover_with(move |error| {
        if remaining == 0 || !retry_if(&error) || next.context().is_cancelled() {
            return ComposableFuture::from_error(error);
        }
        tracing::debug!(
            method = next.context().method(),
            remaining,
            %error,
            "retrying call"
        );
        attempt(next, remaining - 1, retry_if)
    })
}

impl AsyncFilter for RetryFilter {
    fn name(&self) -> &str {
        "retry"
    }

    fn handle_async(&self, _ctx: Arc<RequestContext>, next: AsyncNext) -> ComposableFuture<Value> {
        attempt(next, self.retries, self.retry_if.clone())
    }
}

/// Fails the remainder of the chain with `Timeout` after a fixed duration.
///
/// On expiry the call's cancel signal is raised so the handler can stop.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutFilter {
    timeout: Duration,
}

impl TimeoutFilter {
    /// Bound calls to `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// The configured bound.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl AsyncFilter for TimeoutFilter {
    fn name(&self) -> &str {
        "timeout"
    }

    fn handle_async(&self, ctx: Arc<RequestContext>, next: AsyncNext) -> ComposableFuture<Value> {
        let result = next.invoke().with_timeout(self.timeout);
        result.on_error(move |error| {
            if error.is_timeout() {
                ctx.cancellation().cancel();
            }
        });
        result
    }
}

impl StreamFilter for TimeoutFilter {
    fn name(&self) -> &str {
        "timeout"
    }

    fn handle_stream(&self, _ctx: Arc<RequestContext>, next: StreamNext) -> StreamResult<Value> {
        next.invoke().with_deadline(Instant::now() + self.timeout)
    }
}

/// Decides whether a call may enter the rest of the chain.
///
/// Every `allow_request` is paired with exactly one `done`, whether the
/// call was admitted or not.
pub trait PushBackStrategy: Send + Sync {
    /// Admit or refuse a new call.
    fn allow_request(&self) -> bool;

    /// A call that asked to enter has finished, or was refused.
    fn done(&self, allowed: bool);

    /// Error handed to refused calls.
    fn rejection(&self) -> ErrorKind;
}

/// Admits at most `limit` calls at a time.
#[derive(Debug)]
pub struct ConcurrencyLimitStrategy {
    limit: usize,
    in_flight: AtomicUsize,
    high_water_mark: AtomicUsize,
}

impl ConcurrencyLimitStrategy {
    /// Allow `limit` concurrent calls.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_flight: AtomicUsize::new(0),
            high_water_mark: AtomicUsize::new(0),
        }
    }

    /// The configured limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Calls currently holding a slot, including refused ones not yet released.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest `in_flight` seen since the last read. Resets it to zero.
    pub fn take_high_water_mark(&self) -> usize {
        self.high_water_mark.swap(0, Ordering::SeqCst)
    }
}

impl PushBackStrategy for ConcurrencyLimitStrategy {
    fn allow_request(&self) -> bool {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.high_water_mark.fetch_max(current + 1, Ordering::SeqCst);
        current < self.limit
    }

    fn done(&self, _allowed: bool) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn rejection(&self) -> ErrorKind {
        ErrorKind::HandlerFailure(format!("reached concurrency limit {}", self.limit))
    }
}

/// Releases an admitted call when dropped.
struct Admitted(Arc<dyn PushBackStrategy>);

impl Drop for Admitted {
    fn drop(&mut self) {
        self.0.done(true);
    }
}

/// Refuses calls its strategy turns away, without running the rest of the
/// chain.
///
/// An admitted async call keeps its slot until its result resolves.
///
/// ```rust
/// use relayline::prelude::*;
/// use std::sync::Arc;
///
/// let limiter = Arc::new(PushBackFilter::concurrency_limit(64));
/// let filter = Filter::Async(limiter.clone());
/// assert_eq!(limiter.pushed_back(), 0);
/// # let _ = filter;
/// ```
pub struct PushBackFilter {
    strategy: Arc<dyn PushBackStrategy>,
    pushed_back: AtomicU64,
}

impl std::fmt::Debug for PushBackFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushBackFilter")
            .field("pushed_back", &self.pushed_back())
            .finish_non_exhaustive()
    }
}

impl PushBackFilter {
    /// Admit calls according to `strategy`.
    pub fn new(strategy: Arc<dyn PushBackStrategy>) -> Self {
        Self {
            strategy,
            pushed_back: AtomicU64::new(0),
        }
    }

    /// Admit at most `limit` concurrent calls.
    pub fn concurrency_limit(limit: usize) -> Self {
        Self::new(Arc::new(ConcurrencyLimitStrategy::new(limit)))
    }

    /// Calls refused so far.
    pub fn pushed_back(&self) -> u64 {
        self.pushed_back.load(Ordering::Relaxed)
    }

    fn admit(&self, ctx: &RequestContext) -> Result<Admitted, ErrorKind> {
        if self.strategy.allow_request() {
            return Ok(Admitted(self.strategy.clone()));
        }
        self.strategy.done(false);
        self.pushed_back.fetch_add(1, Ordering::Relaxed);
        let error = self.strategy.rejection();
        tracing::warn!(
            method = ctx.method(),
            correlation_id = ctx.correlation_id(),
            %error,
            "call pushed back"
        );
        Err(error)
    }
}

impl SyncFilter for PushBackFilter {
    fn name(&self) -> &str {
        "push_back"
    }

    fn handle_sync(&self, ctx: &RequestContext, next: SyncNext<'_>) -> Outcome<Value> {
        let _admitted = self.admit(ctx)?;
        next.invoke()
    }
}

impl AsyncFilter for PushBackFilter {
    fn name(&self) -> &str {
        "push_back"
    }

    fn handle_async(&self, ctx: Arc<RequestContext>, next: AsyncNext) -> ComposableFuture<Value> {
        let admitted = match self.admit(&ctx) {
            Ok(admitted) => admitted,
            Err(error) => return ComposableFuture::from_error(error),
        };
        let result = next.invoke();
        result.on_complete(move |_| drop(admitted));
        result
    }
}
