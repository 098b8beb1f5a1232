//! Streaming results.
//!
//! A `StreamResult<T>` is a lazy, single-consumer sequence of
//! `Outcome<T>` events. It ends either when the producer finishes
//! (completion) or after the first `Err` event (terminal error); nothing is
//! delivered after either. Consumers either `subscribe` with callbacks or
//! pull the events with `take_stream`, but only once per stream.
//!
//! Producers created through `StreamBuilder` write into a bounded channel.
//! When the buffer is full `StreamSender::send` waits, so a slow consumer
//! slows the producer down instead of growing memory.

use std::fmt;
use std::pin::Pin;

use futures::future;
use futures::stream;
use futures::StreamExt;
use futures_core::Stream;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tokio_stream::wrappers::ReceiverStream;

use crate::cancel::CancelSignal;
use crate::error::{ErrorKind, Outcome};
use crate::future::{guarded, ComposableFuture};

/// Type alias for a boxed async stream of events.
pub type EventStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Default producer buffer, in events.
pub const DEFAULT_BUFFER_SIZE: usize = 100;

/// Producer half of a channel-backed `StreamResult`.
///
/// Dropping every sender completes the stream.
#[derive(Debug)]
pub struct StreamSender<T> {
    tx: mpsc::Sender<Outcome<T>>,
    cancel: CancelSignal,
}

impl<T: Send + 'static> StreamSender<T> {
    /// Emit a value, waiting while the consumer's buffer is full.
    ///
    /// Fails with `Cancelled` once the consumer has cancelled or gone away.
    pub async fn send(&self, value: T) -> Result<(), ErrorKind> {
        self.emit(Ok(value)).await
    }

    /// Terminate the stream with an error.
    pub async fn fail(self, error: ErrorKind) -> Result<(), ErrorKind> {
        self.emit(Err(error)).await
    }

    /// Complete the stream from this sender's side.
    pub fn complete(self) {}

    /// Try to emit without waiting.
    ///
    /// Returns the value back if the buffer is full or the stream is gone.
    pub fn try_send(&self, value: T) -> Result<(), T> {
        if self.cancel.is_cancelled() {
            return Err(value);
        }
        match self.tx.try_reserve() {
            Ok(permit) => {
                permit.send(Ok(value));
                Ok(())
            }
            Err(_) => Err(value),
        }
    }

    /// Check whether the consumer cancelled or dropped the stream.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Resolve once the consumer cancels.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Remaining buffer capacity.
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }

    async fn emit(&self, event: Outcome<T>) -> Result<(), ErrorKind> {
        if self.cancel.is_cancelled() {
            return Err(ErrorKind::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ErrorKind::Cancelled),
            sent = self.tx.send(event) => sent.map_err(|_| ErrorKind::Cancelled),
        }
    }
}

impl<T> Clone for StreamSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// Builder for channel-backed streams.
///
/// # Example
///
/// ```rust
/// use relayline::StreamBuilder;
///
/// # async fn example() {
/// let (sender, stream) = StreamBuilder::<u32>::new()
///     .buffer_size(16)
///     .build();
///
/// tokio::spawn(async move {
///     for n in 1..=3 {
///         if sender.send(n).await.is_err() {
///             break;
///         }
///     }
/// });
///
/// assert_eq!(stream.collect().await, Ok(vec![1, 2, 3]));
/// # }
/// ```
pub struct StreamBuilder<T> {
    buffer_size: usize,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Send + 'static> StreamBuilder<T> {
    /// Create a new stream builder with default settings.
    pub fn new() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            _marker: std::marker::PhantomData,
        }
    }

    /// Set the buffer size for the underlying channel.
    ///
    /// Default is 100. Zero is rounded up to one.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    /// Build the producer and the stream.
    pub fn build(self) -> (StreamSender<T>, StreamResult<T>) {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let cancel = CancelSignal::new();
        let sender = StreamSender {
            tx,
            cancel: cancel.clone(),
        };
        let stream = StreamResult::with_signal(ReceiverStream::new(rx).boxed(), cancel);
        (sender, stream)
    }
}

impl<T: Send + 'static> Default for StreamBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a channel-backed stream with the default buffer size.
pub fn create_stream<T: Send + 'static>() -> (StreamSender<T>, StreamResult<T>) {
    StreamBuilder::<T>::new().build()
}

/// Create a channel-backed stream with a specific buffer size.
pub fn create_stream_with_buffer<T: Send + 'static>(
    buffer_size: usize,
) -> (StreamSender<T>, StreamResult<T>) {
    StreamBuilder::<T>::new().buffer_size(buffer_size).build()
}

/// Handle to an active `subscribe` registration.
#[derive(Debug)]
pub struct Subscription {
    cancel: CancelSignal,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Stop delivery. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Check whether the stream was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Check whether delivery has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the last callback has run.
    pub async fn finished(self) {
        let _ = self.task.await;
    }
}

/// A cancellable, single-consumer stream of `Outcome<T>` events.
pub struct StreamResult<T> {
    source: Mutex<Option<EventStream<Outcome<T>>>>,
    cancel: CancelSignal,
}

impl<T> fmt::Debug for StreamResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamResult")
            .field("subscribed", &self.source.lock().is_none())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl<T: Send + 'static> StreamResult<T> {
    fn with_signal(source: EventStream<Outcome<T>>, cancel: CancelSignal) -> Self {
        Self {
            source: Mutex::new(Some(source)),
            cancel,
        }
    }

    /// Wrap any stream of outcomes.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Outcome<T>> + Send + 'static,
    {
        Self::with_signal(stream.boxed(), CancelSignal::new())
    }

    /// A stream emitting every item of `items`, then completing.
    pub fn from_iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::from_stream(stream::iter(items.into_iter().map(Ok)))
    }

    /// A stream that completes without emitting.
    pub fn empty() -> Self {
        Self::from_stream(stream::empty())
    }

    /// A stream that terminates immediately with `error`.
    pub fn from_error(error: ErrorKind) -> Self {
        Self::from_stream(stream::once(future::ready(Err(error))))
    }

    /// Channel-backed stream with an explicit buffer size.
    pub fn channel(buffer_size: usize) -> (StreamSender<T>, Self) {
        create_stream_with_buffer(buffer_size)
    }

    /// Cancel the stream. Idempotent; returns `true` for the first call.
    ///
    /// Delivery stops at the next event boundary and producers observe the
    /// signal on their next `send`. Producers that never send again are not
    /// interrupted.
    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    /// Check whether the stream was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The signal fired by `cancel`, for producers that want to observe it.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Check whether a consumer has already claimed this stream.
    pub fn is_subscribed(&self) -> bool {
        self.source.lock().is_none()
    }

    fn take_source(&self) -> Outcome<EventStream<Outcome<T>>> {
        self.source.lock().take().ok_or(ErrorKind::AlreadySubscribed)
    }

    fn transform<U, F>(self, f: F) -> StreamResult<U>
    where
        U: Send + 'static,
        F: FnOnce(EventStream<Outcome<T>>) -> EventStream<Outcome<U>>,
    {
        let cancel = self.cancel.clone();
        match self.take_source() {
            Ok(source) => StreamResult::with_signal(f(source), cancel),
            Err(error) => {
                StreamResult::with_signal(stream::once(future::ready(Err(error))).boxed(), cancel)
            }
        }
    }

    /// Transform every value; a panic in `f` terminates the stream with
    /// `HandlerFailure`.
    pub fn map<U, F>(self, mut f: F) -> StreamResult<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        self.transform(move |source| {
            source
                .map(move |event| event.and_then(|value| guarded(|| Ok(f(value)))))
                .boxed()
        })
    }

    /// Transform every value with a fallible function; an `Err` terminates
    /// the stream.
    pub fn try_map<U, F>(self, mut f: F) -> StreamResult<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> Outcome<U> + Send + 'static,
    {
        self.transform(move |source| {
            source
                .map(move |event| event.and_then(|value| guarded(|| f(value))))
                .boxed()
        })
    }

    /// Run `hook` once when the stream ends.
    ///
    /// The hook sees `None` on completion, the error on a terminal error,
    /// and `Cancelled` if the stream is dropped before it ends.
    pub fn on_terminate<F>(self, hook: F) -> StreamResult<T>
    where
        F: FnOnce(Option<&ErrorKind>) + Send + 'static,
    {
        self.transform(move |source| {
            let hook = TerminateHook { hook: Some(hook) };
            stream::unfold((source, hook), |(mut source, mut hook)| async move {
                match source.next().await {
                    Some(Ok(value)) => Some((Ok(value), (source, hook))),
                    Some(Err(error)) => {
                        hook.fire(Some(&error));
                        Some((Err(error), (source, hook)))
                    }
                    None => {
                        hook.fire(None);
                        None
                    }
                }
            })
            .boxed()
        })
    }

    /// Terminate with `Timeout` if the stream has not ended by `deadline`.
    ///
    /// The producer is signalled through the stream's cancel signal.
    pub fn with_deadline(self, deadline: Instant) -> StreamResult<T> {
        let budget_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64;
        let signal = self.cancel.clone();
        self.transform(move |source| {
            let timer: Option<Pin<Box<Sleep>>> = None;
            stream::unfold(Some((source, timer)), move |state| {
                let signal = signal.clone();
                async move {
                    let (mut source, mut timer) = state?;
                    let sleep = timer.get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
                    tokio::select! {
                        biased;
                        event = source.next() => event.map(|event| (event, Some((source, timer)))),
                        _ = sleep.as_mut() => {
                            tracing::debug!(timeout_ms = budget_ms, "stream deadline elapsed");
                            signal.cancel();
                            Some((Err(ErrorKind::Timeout(budget_ms)), None))
                        }
                    }
                }
            })
            .boxed()
        })
    }

    /// Claim the stream for pull-based consumption.
    ///
    /// The returned stream stops after the first error and as soon as the
    /// stream is cancelled. A second claim fails with `AlreadySubscribed`.
    pub fn take_stream(&self) -> Outcome<EventStream<Outcome<T>>> {
        let source = self.take_source()?;
        Ok(guard(source, self.cancel.clone()))
    }

    /// Register the single consumer.
    ///
    /// Events are delivered in order on a Tokio task. Exactly one of
    /// `on_error` or `on_complete` runs at the end, unless the stream is
    /// cancelled first, in which case neither does.
    ///
    /// The consumer's capacity is the channel buffer chosen when the stream
    /// was created (`StreamBuilder::buffer_size`, `StreamResult::channel` or
    /// `Dispatcher::stream_channel`), not something `subscribe` declares.
    /// `on_next` runs one event at a time and the task only pulls the next
    /// event after it returns, so a producer is never more than that buffer
    /// ahead of the callbacks.
    pub fn subscribe<N, E, C>(&self, mut on_next: N, on_error: E, on_complete: C) -> Outcome<Subscription>
    where
        N: FnMut(T) + Send + 'static,
        E: FnOnce(ErrorKind) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let handle = Handle::try_current()
            .map_err(|_| ErrorKind::HandlerFailure("no tokio runtime available".to_string()))?;
        let mut events = self.take_stream()?;
        let cancel = self.cancel.clone();
        let watcher = cancel.clone();

        let task = handle.spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    Ok(value) => on_next(value),
                    Err(error) => {
                        on_error(error);
                        return;
                    }
                }
            }
            if !watcher.is_cancelled() {
                on_complete();
            }
        });

        Ok(Subscription { cancel, task })
    }

    /// Consume the stream into a vector, failing on the first error.
    pub async fn collect(self) -> Outcome<Vec<T>> {
        let mut events = self.take_stream()?;
        let mut values = Vec::new();
        while let Some(event) = events.next().await {
            values.push(event?);
        }
        Ok(values)
    }
}

impl<T: Clone + Send + Sync + 'static> StreamResult<T> {
    /// Emit the outcome of each future in completion order.
    ///
    /// Outcomes are queued the moment each future resolves, so the order
    /// does not depend on when the stream is first polled. The first failure
    /// terminates the stream.
    pub fn from_futures<I>(futures: I) -> Self
    where
        I: IntoIterator<Item = ComposableFuture<T>>,
    {
        let futures: Vec<_> = futures.into_iter().collect();
        // one slot per input, so try_send never sees a full buffer
        let (tx, rx) = mpsc::channel(futures.len().max(1));
        for future in &futures {
            let tx = tx.clone();
            future.on_complete(move |outcome| {
                let _ = tx.try_send(outcome.clone());
            });
        }
        Self::from_stream(ReceiverStream::new(rx))
    }
}

struct TerminateHook<F: FnOnce(Option<&ErrorKind>)> {
    hook: Option<F>,
}

impl<F: FnOnce(Option<&ErrorKind>)> TerminateHook<F> {
    fn fire(&mut self, error: Option<&ErrorKind>) {
        if let Some(hook) = self.hook.take() {
            hook(error);
        }
    }
}

impl<F: FnOnce(Option<&ErrorKind>)> Drop for TerminateHook<F> {
    fn drop(&mut self) {
        self.fire(Some(&ErrorKind::Cancelled));
    }
}

/// Stop after the first error and on cancellation.
fn guard<T: Send + 'static>(
    source: EventStream<Outcome<T>>,
    cancel: CancelSignal,
) -> EventStream<Outcome<T>> {
    stream::unfold(Some(source), move |state| {
        let cancel = cancel.clone();
        async move {
            let mut source = state?;
            if cancel.is_cancelled() {
                return None;
            }
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                event = source.next() => event?,
            };
            match event {
                Ok(value) => Some((Ok(value), Some(source))),
                Err(error) => Some((Err(error), None)),
            }
        }
    })
    .boxed()
}
