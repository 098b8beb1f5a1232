//! Composable futures.
//!
//! A `ComposableFuture<T>` is a handle to a resolve-once cell holding an
//! `Outcome<T>`. Handles are cheap to clone and every clone observes the
//! same resolution. Transformations (`map`, `flat_map`, `recover`, ...)
//! register a continuation on the source and return a new future; the
//! continuation runs exactly once, on whichever thread resolves the source,
//! in the order continuations were registered.
//!
//! Futures are eager: the work behind them is already running (or already
//! done) by the time a caller sees the handle. `ComposableFuture` also
//! implements [`std::future::Future`], so it can be `.await`ed directly.
//!
//! # Example
//!
//! ```rust
//! use relayline::ComposableFuture;
//!
//! # async fn example() {
//! let doubled = ComposableFuture::from_value(21).map(|n| n * 2);
//! assert_eq!(doubled.await, Ok(42));
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::Instant;

use crate::error::{ErrorKind, Outcome};

type Continuation<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;
type CancelHook = Box<dyn FnOnce() + Send>;

enum State<T> {
    Pending {
        continuations: Vec<Continuation<T>>,
        wakers: Vec<Waker>,
        cancel_hooks: Vec<CancelHook>,
    },
    Resolved(Arc<Outcome<T>>),
}

struct Cell<T> {
    state: Mutex<State<T>>,
}

impl<T> Cell<T> {
    fn pending() -> Self {
        Self {
            state: Mutex::new(State::Pending {
                continuations: Vec::new(),
                wakers: Vec::new(),
                cancel_hooks: Vec::new(),
            }),
        }
    }

    fn resolved(outcome: Outcome<T>) -> Self {
        Self {
            state: Mutex::new(State::Resolved(Arc::new(outcome))),
        }
    }

    /// Resolve the cell. Returns the pending cancel hooks when this call won.
    fn complete(&self, outcome: Outcome<T>) -> Option<Vec<CancelHook>> {
        let outcome = Arc::new(outcome);
        let previous = {
            let mut state = self.state.lock();
            if matches!(*state, State::Resolved(_)) {
                return None;
            }
            mem::replace(&mut *state, State::Resolved(outcome.clone()))
        };

        let State::Pending {
            continuations,
            wakers,
            cancel_hooks,
        } = previous
        else {
            return None;
        };

        // the lock is released: continuations may register on this cell
        for continuation in continuations {
            run_continuation(continuation, &outcome);
        }
        for waker in wakers {
            waker.wake();
        }
        Some(cancel_hooks)
    }

    fn register(&self, continuation: Continuation<T>) {
        let resolved = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Pending { continuations, .. } => {
                    continuations.push(continuation);
                    return;
                }
                State::Resolved(outcome) => outcome.clone(),
            }
        };
        run_continuation(continuation, &resolved);
    }

    fn peek(&self) -> Option<Arc<Outcome<T>>> {
        match &*self.state.lock() {
            State::Pending { .. } => None,
            State::Resolved(outcome) => Some(outcome.clone()),
        }
    }
}

fn run_continuation<T>(continuation: Continuation<T>, outcome: &Outcome<T>) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| continuation(outcome))) {
        tracing::error!(
            error = %ErrorKind::from_panic(payload),
            "future continuation panicked"
        );
    }
}

/// Run a user handler, turning a panic into `HandlerFailure`.
pub(crate) fn guarded<R>(f: impl FnOnce() -> Outcome<R>) -> Outcome<R> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| Err(ErrorKind::from_panic(payload)))
}

fn no_runtime() -> ErrorKind {
    ErrorKind::HandlerFailure("no tokio runtime available".to_string())
}

/// Write side of a `ComposableFuture`.
///
/// The first `complete` wins; later calls are ignored and return `false`.
pub struct Promise<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("done", &self.cell.peek().is_some())
            .finish()
    }
}

impl<T> Promise<T> {
    /// Resolve with an outcome.
    pub fn complete(&self, outcome: Outcome<T>) -> bool {
        self.cell.complete(outcome).is_some()
    }

    /// Resolve successfully.
    pub fn success(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// Resolve with an error.
    pub fn failure(&self, error: ErrorKind) -> bool {
        self.complete(Err(error))
    }

    /// Check if the promise has been resolved.
    pub fn is_done(&self) -> bool {
        self.cell.peek().is_some()
    }

    /// Get a read handle for this promise.
    pub fn future(&self) -> ComposableFuture<T> {
        ComposableFuture {
            cell: self.cell.clone(),
        }
    }
}

/// An eventual `Outcome<T>` supporting chaining, recovery, combination and
/// timeouts.
pub struct ComposableFuture<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for ComposableFuture<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> fmt::Debug for ComposableFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposableFuture")
            .field("done", &self.cell.peek().is_some())
            .finish()
    }
}

impl<T> ComposableFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an unresolved future together with its promise.
    pub fn promise() -> (Promise<T>, ComposableFuture<T>) {
        let cell = Arc::new(Cell::pending());
        (Promise { cell: cell.clone() }, ComposableFuture { cell })
    }

    /// A future already resolved with `value`.
    pub fn from_value(value: T) -> Self {
        Self::from_result(Ok(value))
    }

    /// A future already failed with `error`.
    pub fn from_error(error: ErrorKind) -> Self {
        Self::from_result(Err(error))
    }

    /// A future already resolved with `outcome`.
    pub fn from_result(outcome: Outcome<T>) -> Self {
        Self {
            cell: Arc::new(Cell::resolved(outcome)),
        }
    }

    /// Run an async computation on the current Tokio runtime.
    ///
    /// A panic inside `fut` resolves the future with `HandlerFailure`.
    /// Outside a runtime the future fails immediately.
    pub fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = Outcome<T>> + Send + 'static,
    {
        let (promise, future) = Self::promise();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let outcome = futures::FutureExt::catch_unwind(AssertUnwindSafe(fut))
                        .await
                        .unwrap_or_else(|payload| Err(ErrorKind::from_panic(payload)));
                    promise.complete(outcome);
                });
            }
            Err(_) => {
                promise.failure(no_runtime());
            }
        }
        future
    }

    /// Run a blocking closure on the runtime's blocking pool.
    pub fn from_blocking<F>(f: F) -> Self
    where
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        let (promise, future) = Self::promise();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || {
                    promise.complete(guarded(f));
                });
            }
            Err(_) => {
                promise.failure(no_runtime());
            }
        }
        future
    }

    /// Run `f` after `delay`.
    pub fn schedule<F>(delay: Duration, f: F) -> Self
    where
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        Self::spawn(async move {
            tokio::time::sleep(delay).await;
            guarded(f)
        })
    }

    /// Check whether the future has resolved.
    pub fn is_done(&self) -> bool {
        self.cell.peek().is_some()
    }

    /// Get a copy of the outcome if resolved.
    pub fn peek(&self) -> Option<Outcome<T>> {
        self.cell.peek().map(|outcome| (*outcome).clone())
    }

    /// Register a continuation that sees the outcome exactly once.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        self.cell.register(Box::new(f));
    }

    /// Register a continuation for the success case only.
    pub fn on_success<F>(&self, f: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.on_complete(move |outcome| {
            if let Ok(value) = outcome {
                f(value);
            }
        });
    }

    /// Register a continuation for the failure case only.
    pub fn on_error<F>(&self, f: F)
    where
        F: FnOnce(&ErrorKind) + Send + 'static,
    {
        self.on_complete(move |outcome| {
            if let Err(error) = outcome {
                f(error);
            }
        });
    }

    /// Transform a successful value.
    ///
    /// Failures propagate untouched and `f` is never called for them.
    ///
    /// `ComposableFuture` implements `Future`, so with `futures::FutureExt`
    /// in scope `future.map(..)` resolves to the by-value trait method
    /// instead. Call `ComposableFuture::map(&future, ..)` or keep the trait
    /// out of scope.
    pub fn map<U, F>(&self, f: F) -> ComposableFuture<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.try_map(move |value| Ok(f(value)))
    }

    /// Transform a successful value with a fallible function.
    pub fn try_map<U, F>(&self, f: F) -> ComposableFuture<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Outcome<U> + Send + 'static,
    {
        let (promise, future) = ComposableFuture::promise();
        self.on_complete(move |outcome| {
            let mapped = match outcome {
                Ok(value) => {
                    let value = value.clone();
                    guarded(move || f(value))
                }
                Err(error) => Err(error.clone()),
            };
            promise.complete(mapped);
        });
        future
    }

    /// Chain another asynchronous step.
    ///
    /// `f` is only called, and the inner future only created, after this
    /// future resolves successfully.
    pub fn flat_map<U, F>(&self, f: F) -> ComposableFuture<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> ComposableFuture<U> + Send + 'static,
    {
        let (promise, future) = ComposableFuture::promise();
        self.on_complete(move |outcome| match outcome {
            Ok(value) => {
                let value = value.clone();
                match catch_unwind(AssertUnwindSafe(move || f(value))) {
                    Ok(inner) => inner.on_complete(move |inner_outcome| {
                        promise.complete(inner_outcome.clone());
                    }),
                    Err(payload) => {
                        promise.failure(ErrorKind::from_panic(payload));
                    }
                }
            }
            Err(error) => {
                promise.failure(error.clone());
            }
        });
        future
    }

    /// Turn a failure into a success.
    pub fn recover<F>(&self, f: F) -> ComposableFuture<T>
    where
        F: FnOnce(ErrorKind) -> T + Send + 'static,
    {
        let (promise, future) = ComposableFuture::promise();
        self.on_complete(move |outcome| {
            let recovered = match outcome {
                Ok(value) => Ok(value.clone()),
                Err(error) => {
                    let error = error.clone();
                    guarded(move || Ok(f(error)))
                }
            };
            promise.complete(recovered);
        });
        future
    }

    /// Turn a failure into another asynchronous attempt.
    pub fn recover_with<F>(&self, f: F) -> ComposableFuture<T>
    where
        F: FnOnce(ErrorKind) -> ComposableFuture<T> + Send + 'static,
    {
        let (promise, future) = ComposableFuture::promise();
        self.on_complete(move |outcome| match outcome {
            Ok(value) => {
                promise.success(value.clone());
            }
            Err(error) => {
                let error = error.clone();
                match catch_unwind(AssertUnwindSafe(move || f(error))) {
                    Ok(next) => next.on_complete(move |next_outcome| {
                        promise.complete(next_outcome.clone());
                    }),
                    Err(payload) => {
                        promise.failure(ErrorKind::from_panic(payload));
                    }
                }
            }
        });
        future
    }

    /// Fail with `Timeout` unless this future resolves within `duration`.
    ///
    /// The underlying work keeps running; the returned future simply stops
    /// waiting for it.
    pub fn with_timeout(&self, duration: Duration) -> ComposableFuture<T> {
        self.race_timer(Instant::now() + duration, duration)
    }

    /// Fail with `Timeout` unless this future resolves before `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> ComposableFuture<T> {
        let budget = deadline.saturating_duration_since(Instant::now());
        self.race_timer(deadline, budget)
    }

    fn race_timer(&self, deadline: Instant, budget: Duration) -> ComposableFuture<T> {
        let (promise, future) = Self::promise();
        let forward = promise.clone();
        self.on_complete(move |outcome| {
            forward.complete(outcome.clone());
        });
        if future.is_done() {
            return future;
        }

        match Handle::try_current() {
            Ok(handle) => {
                let watched = future.clone();
                handle.spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {
                            let millis = budget.as_millis() as u64;
                            if promise.failure(ErrorKind::Timeout(millis)) {
                                tracing::debug!(timeout_ms = millis, "future timed out");
                            }
                        }
                        _ = watched => {}
                    }
                });
            }
            Err(_) => {
                promise.failure(no_runtime());
            }
        }
        future
    }

    /// Cancel the future.
    ///
    /// If still pending it resolves with `Cancelled` and the registered
    /// cancel hooks fire. Side effects already committed are not undone and
    /// work behind the future is only stopped if it observes a hook.
    pub fn cancel(&self) -> bool {
        match self.cell.complete(Err(ErrorKind::Cancelled)) {
            Some(hooks) => {
                for hook in hooks {
                    hook();
                }
                true
            }
            None => false,
        }
    }

    /// Register a hook fired when this future is cancelled via [`cancel`].
    ///
    /// [`cancel`]: ComposableFuture::cancel
    pub fn on_cancel<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = {
            let mut state = self.cell.state.lock();
            match &mut *state {
                State::Pending { cancel_hooks, .. } => {
                    cancel_hooks.push(Box::new(hook));
                    return;
                }
                State::Resolved(outcome) => matches!(**outcome, Err(ErrorKind::Cancelled)),
            }
        };
        if cancelled {
            hook();
        }
    }

    /// Combine this future with `others`; see [`ComposableFuture::all`].
    pub fn combine(&self, others: Vec<ComposableFuture<T>>) -> ComposableFuture<Vec<T>> {
        let mut futures = Vec::with_capacity(others.len() + 1);
        futures.push(self.clone());
        futures.extend(others);
        Self::all(futures)
    }

    /// Resolve once every input has resolved.
    ///
    /// Succeeds with values in input order. Fails with the first failure in
    /// completion order, but only after all inputs have resolved.
    pub fn all<I>(futures: I) -> ComposableFuture<Vec<T>>
    where
        I: IntoIterator<Item = ComposableFuture<T>>,
    {
        let futures: Vec<_> = futures.into_iter().collect();
        if futures.is_empty() {
            return ComposableFuture::from_value(Vec::new());
        }

        struct Gather<T> {
            slots: Vec<Option<T>>,
            remaining: usize,
            first_error: Option<ErrorKind>,
        }

        let (promise, future) = ComposableFuture::promise();
        let gather = Arc::new(Mutex::new(Gather {
            slots: (0..futures.len()).map(|_| None).collect(),
            remaining: futures.len(),
            first_error: None,
        }));

        for (index, input) in futures.iter().enumerate() {
            let gather = gather.clone();
            let promise = promise.clone();
            input.on_complete(move |outcome| {
                let finished = {
                    let mut gather = gather.lock();
                    match outcome {
                        Ok(value) => gather.slots[index] = Some(value.clone()),
                        Err(error) => {
                            if gather.first_error.is_none() {
                                gather.first_error = Some(error.clone());
                            }
                        }
                    }
                    gather.remaining -= 1;
                    if gather.remaining == 0 {
                        Some(match gather.first_error.take() {
                            Some(error) => Err(error),
                            None => Ok(gather.slots.drain(..).flatten().collect()),
                        })
                    } else {
                        None
                    }
                };
                if let Some(result) = finished {
                    promise.complete(result);
                }
            });
        }
        future
    }

    /// Resolve with the first success, or the first failure if all fail.
    pub fn any<I>(futures: I) -> ComposableFuture<T>
    where
        I: IntoIterator<Item = ComposableFuture<T>>,
    {
        let futures: Vec<_> = futures.into_iter().collect();
        if futures.is_empty() {
            return Self::from_error(ErrorKind::HandlerFailure(
                "any() requires at least one future".to_string(),
            ));
        }

        let (promise, future) = Self::promise();
        let state = Arc::new(Mutex::new((futures.len(), None::<ErrorKind>)));
        for input in &futures {
            let promise = promise.clone();
            let state = state.clone();
            input.on_complete(move |outcome| match outcome {
                Ok(value) => {
                    promise.success(value.clone());
                }
                Err(error) => {
                    let exhausted = {
                        let mut state = state.lock();
                        state.0 -= 1;
                        if state.1.is_none() {
                            state.1 = Some(error.clone());
                        }
                        if state.0 == 0 {
                            state.1.take()
                        } else {
                            None
                        }
                    };
                    if let Some(error) = exhausted {
                        promise.failure(error);
                    }
                }
            });
        }
        future
    }

    /// Run `action` and re-run it up to `retries` more times while it fails.
    pub fn retry<F>(retries: usize, action: F) -> ComposableFuture<T>
    where
        F: Fn() -> ComposableFuture<T> + Send + Sync + 'static,
    {
        Self::retry_shared(retries, Arc::new(action))
    }

    fn retry_shared<F>(retries: usize, action: Arc<F>) -> ComposableFuture<T>
    where
        F: Fn() -> ComposableFuture<T> + Send + Sync + 'static,
    {
        Self::produce(|| action()).recover_with(move |error| {
            if retries == 0 {
                Self::from_error(error)
            } else {
                tracing::debug!(remaining = retries, error = %error, "retrying after failure");
                Self::retry_shared(retries - 1, action)
            }
        })
    }

    /// Run `action`, and run it again after `delay` if the first attempt is
    /// still pending by then.
    ///
    /// Resolves with whichever attempt finishes first. The losing attempt
    /// keeps running. If the first attempt resolves before `delay` the
    /// second one is never started.
    pub fn double_dispatch<F>(delay: Duration, action: F) -> ComposableFuture<T>
    where
        F: Fn() -> ComposableFuture<T> + Send + Sync + 'static,
    {
        let action = Arc::new(action);
        let first = Self::produce(|| action());
        if first.is_done() {
            return first;
        }

        let (promise, future) = Self::promise();
        let forward = promise.clone();
        first.on_complete(move |outcome| {
            forward.complete(outcome.clone());
        });

        ComposableFuture::<()>::schedule(delay, || Ok(())).on_success(move |_| {
            if promise.is_done() {
                return;
            }
            tracing::debug!(delay_ms = delay.as_millis() as u64, "dispatching second attempt");
            Self::produce(|| action()).on_complete(move |outcome| {
                promise.complete(outcome.clone());
            });
        });
        future
    }

    /// Wait for every input and report each outcome, in input order.
    ///
    /// Never fails: failures are kept next to the successes.
    pub fn all_settled<I>(futures: I) -> ComposableFuture<Vec<Outcome<T>>>
    where
        I: IntoIterator<Item = ComposableFuture<T>>,
    {
        let settled: Vec<_> = futures
            .into_iter()
            .map(|input| {
                let (promise, settled) = ComposableFuture::<Outcome<T>>::promise();
                input.on_complete(move |outcome| {
                    promise.success(outcome.clone());
                });
                settled
            })
            .collect();
        ComposableFuture::all(settled)
    }

    /// Collect successes by key until `successes` of them arrived, every
    /// input resolved, or `timeout` elapsed, whichever comes first.
    ///
    /// Failed inputs are left out of the result. The returned future never
    /// fails.
    pub fn first<K>(
        futures: HashMap<K, ComposableFuture<T>>,
        successes: usize,
        timeout: Option<Duration>,
    ) -> ComposableFuture<HashMap<K, T>>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
    {
        let total = futures.len();
        if total == 0 || successes == 0 {
            return ComposableFuture::from_value(HashMap::new());
        }

        struct Tally<K, T> {
            results: HashMap<K, T>,
            settled: usize,
        }

        let (promise, future) = ComposableFuture::promise();
        let tally = Arc::new(Mutex::new(Tally {
            results: HashMap::new(),
            settled: 0,
        }));

        for (key, input) in futures {
            let tally = tally.clone();
            let promise = promise.clone();
            input.on_complete(move |outcome| {
                let finished = {
                    let mut tally = tally.lock();
                    tally.settled += 1;
                    if let Ok(value) = outcome {
                        tally.results.insert(key, value.clone());
                    }
                    (tally.results.len() >= successes || tally.settled == total)
                        .then(|| tally.results.clone())
                };
                if let Some(results) = finished {
                    promise.success(results);
                }
            });
        }

        if let (Some(timeout), false) = (timeout, future.is_done()) {
            ComposableFuture::<()>::schedule(timeout, move || {
                let results = tally.lock().results.clone();
                promise.success(results);
                Ok(())
            });
        }
        future
    }

    /// Feed `elements` to `producer` in batches of `batch_size`.
    ///
    /// A batch starts once the previous one has fully resolved. Results
    /// keep input order. A failed batch fails the whole result and later
    /// batches are never started.
    pub fn batch<E, F>(elements: Vec<E>, batch_size: usize, producer: F) -> ComposableFuture<Vec<T>>
    where
        E: Send + 'static,
        F: Fn(E) -> ComposableFuture<T> + Send + Sync + 'static,
    {
        let capacity = elements.len();
        Self::next_batch(
            elements.into_iter(),
            batch_size.max(1),
            Arc::new(producer),
            Vec::with_capacity(capacity),
        )
    }

    fn next_batch<E, F>(
        mut pending: std::vec::IntoIter<E>,
        batch_size: usize,
        producer: Arc<F>,
        mut done: Vec<T>,
    ) -> ComposableFuture<Vec<T>>
    where
        E: Send + 'static,
        F: Fn(E) -> ComposableFuture<T> + Send + Sync + 'static,
    {
        let current: Vec<_> = pending
            .by_ref()
            .take(batch_size)
            .map(|element| Self::produce(|| producer(element)))
            .collect();
        if current.is_empty() {
            return ComposableFuture::from_value(done);
        }
        Self::all(current).flat_map(move |results| {
            done.extend(results);
            Self::next_batch(pending, batch_size, producer, done)
        })
    }

    /// Feed `elements` to `producer` with at most `parallelism` calls in
    /// flight.
    ///
    /// Each lane picks the next element as soon as its previous call
    /// resolves, so one slow element does not hold back the rest. Results
    /// arrive in completion order. The first failure stops every lane from
    /// picking new elements and fails the result.
    pub fn batch_unordered<E, F>(
        elements: Vec<E>,
        parallelism: usize,
        producer: F,
    ) -> ComposableFuture<Vec<T>>
    where
        E: Send + 'static,
        F: Fn(E) -> ComposableFuture<T> + Send + Sync + 'static,
    {
        let lanes = parallelism.max(1).min(elements.len());
        let queue = Arc::new(Mutex::new(elements.into_iter()));
        let producer = Arc::new(producer);
        let collected = Arc::new(Mutex::new(Vec::new()));

        let workers: Vec<_> = (0..lanes)
            .map(|_| Self::drain_lane(queue.clone(), producer.clone(), collected.clone()))
            .collect();
        ComposableFuture::all(workers).map(move |_| mem::take(&mut *collected.lock()))
    }

    fn drain_lane<E, F>(
        queue: Arc<Mutex<std::vec::IntoIter<E>>>,
        producer: Arc<F>,
        collected: Arc<Mutex<Vec<T>>>,
    ) -> ComposableFuture<()>
    where
        E: Send + 'static,
        F: Fn(E) -> ComposableFuture<T> + Send + Sync + 'static,
    {
        let next = queue.lock().next();
        let Some(element) = next else {
            return ComposableFuture::from_value(());
        };

        let call = Self::produce(|| producer(element));
        let stop = queue.clone();
        call.on_error(move |_| {
            // drop whatever is left so no lane picks it up
            stop.lock().by_ref().for_each(drop);
        });
        call.flat_map(move |value| {
            collected.lock().push(value);
            Self::drain_lane(queue, producer, collected)
        })
    }

    /// Call a future factory, turning a panic into a failed future.
    fn produce<F>(f: F) -> ComposableFuture<T>
    where
        F: FnOnce() -> ComposableFuture<T>,
    {
        catch_unwind(AssertUnwindSafe(f))
            .unwrap_or_else(|payload| Self::from_error(ErrorKind::from_panic(payload)))
    }
}

impl<T> Future for ComposableFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.cell.state.lock();
        match &mut *state {
            State::Resolved(outcome) => Poll::Ready((**outcome).clone()),
            State::Pending { wakers, .. } => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}
