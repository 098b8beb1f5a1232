//! Integration tests for Relayline
//!
//! These tests drive whole dispatchers the way a transport would.

use parking_lot::Mutex;
use relayline::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Test Filters
// =============================================================================

/// Lets a call through only when constructed with `allow`.
struct AuthFilter {
    allow: bool,
}

impl AuthFilter {
    fn allow() -> Self {
        Self { allow: true }
    }

    fn deny() -> Self {
        Self { allow: false }
    }
}

impl AsyncFilter for AuthFilter {
    fn name(&self) -> &str {
        "auth"
    }

    fn handle_async(&self, ctx: Arc<RequestContext>, next: AsyncNext) -> ComposableFuture<Value> {
        if !self.allow {
            return ComposableFuture::from_error(ErrorKind::HandlerFailure("unauthorized".into()));
        }
        ctx.set_attribute("principal", "alice");
        next.invoke()
    }
}

/// Counts how often the chain reaches it.
struct CountingFilter {
    hits: Arc<AtomicUsize>,
}

impl AsyncFilter for CountingFilter {
    fn name(&self) -> &str {
        "counting"
    }

    fn handle_async(&self, _ctx: Arc<RequestContext>, next: AsyncNext) -> ComposableFuture<Value> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        next.invoke()
    }
}

/// Keeps every context it sees.
#[derive(Default)]
struct CaptureFilter {
    seen: Mutex<Vec<Arc<RequestContext>>>,
}

impl AsyncFilter for CaptureFilter {
    fn name(&self) -> &str {
        "capture"
    }

    fn handle_async(&self, ctx: Arc<RequestContext>, next: AsyncNext) -> ComposableFuture<Value> {
        assert!(!ctx.has_attribute("visited"), "context reused across calls");
        ctx.set_attribute("visited", true);
        self.seen.lock().push(ctx);
        next.invoke()
    }
}

/// Holds every call for `delay` before passing it on.
struct StallFilter {
    delay: Duration,
}

impl AsyncFilter for StallFilter {
    fn name(&self) -> &str {
        "stall"
    }

    fn handle_async(&self, _ctx: Arc<RequestContext>, next: AsyncNext) -> ComposableFuture<Value> {
        let delay = self.delay;
        ComposableFuture::spawn(async move {
            tokio::time::sleep(delay).await;
            next.invoke().await
        })
    }
}

/// Uppercases string results on the calling thread.
struct UppercaseFilter;

impl SyncFilter for UppercaseFilter {
    fn name(&self) -> &str {
        "uppercase"
    }

    fn handle_sync(&self, _ctx: &RequestContext, next: SyncNext<'_>) -> Outcome<Value> {
        let value = next.invoke()?;
        Ok(match value {
            Value::String(s) => Value::String(s.to_uppercase()),
            other => other,
        })
    }
}

fn reverse_endpoint(calls: Arc<AtomicUsize>) -> Endpoint {
    Endpoint::sync(move |ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        let text: String = ctx.arg(0)?;
        Ok(Value::from(text.chars().rev().collect::<String>()))
    })
}

// =============================================================================
// Filter Chain Scenarios
// =============================================================================

#[tokio::test]
async fn test_echo_through_logging_and_auth() {
    let calls = Arc::new(AtomicUsize::new(0));
    let dispatcher = Dispatcher::builder()
        .method_with(
            "echo",
            reverse_endpoint(calls.clone()),
            vec![
                Filter::future(LoggingFilter::new()),
                Filter::future(AuthFilter::allow()),
            ],
        )
        .build()
        .unwrap();

    let reply = dispatcher.dispatch("echo", vec![json!("hi")]).value().await;

    assert_eq!(reply, Ok(json!("ih")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_auth_short_circuit_skips_endpoint() {
    let calls = Arc::new(AtomicUsize::new(0));
    let dispatcher = Dispatcher::builder()
        .method_with(
            "echo",
            reverse_endpoint(calls.clone()),
            vec![
                Filter::future(LoggingFilter::new()),
                Filter::future(AuthFilter::deny()),
            ],
        )
        .build()
        .unwrap();

    let reply = dispatcher.dispatch("echo", vec![json!("hi")]).value().await;

    assert_eq!(reply, Err(ErrorKind::HandlerFailure("unauthorized".into())));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_short_circuit_leaves_inner_links_untouched() {
    let inner_hits = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let capture = Arc::new(CaptureFilter::default());

    let dispatcher = Dispatcher::builder()
        .method_with(
            "guarded",
            reverse_endpoint(calls.clone()),
            vec![
                Filter::Async(capture.clone()),
                Filter::future(AuthFilter::deny()),
                Filter::future(CountingFilter {
                    hits: inner_hits.clone(),
                }),
            ],
        )
        .build()
        .unwrap();

    let reply = dispatcher.dispatch("guarded", vec![json!("x")]).value().await;

    assert!(reply.is_err());
    assert_eq!(inner_hits.load(Ordering::SeqCst), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let seen = capture.seen.lock();
    assert_eq!(seen[0].state(), InvocationState::ShortCircuited);
}

#[tokio::test]
async fn test_filter_attributes_reach_endpoint() {
    let dispatcher = Dispatcher::builder()
        .method_with(
            "whoami",
            Endpoint::sync(|ctx| Ok(ctx.attribute("principal").unwrap_or(Value::Null))),
            vec![Filter::future(AuthFilter::allow())],
        )
        .build()
        .unwrap();

    let reply = dispatcher.dispatch("whoami", vec![]).value().await;
    assert_eq!(reply, Ok(json!("alice")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_filters_on_blocking_pool() {
    let dispatcher = Dispatcher::builder()
        .method_with(
            "shout",
            reverse_endpoint(Arc::new(AtomicUsize::new(0))),
            vec![
                Filter::future(LoggingFilter::new()),
                Filter::sync(UppercaseFilter),
                Filter::sync(LoggingFilter::new()),
            ],
        )
        .build()
        .unwrap();

    let reply = dispatcher.dispatch("shout", vec![json!("abc")]).value().await;
    assert_eq!(reply, Ok(json!("CBA")));
}

#[test]
fn test_sync_filter_around_async_endpoint_rejected() {
    let result = Dispatcher::builder()
        .method_with(
            "bad",
            Endpoint::async_fn(|_| async { Ok(Value::Null) }),
            vec![Filter::sync(UppercaseFilter)],
        )
        .build();

    assert!(matches!(
        result,
        Err(DispatchError::Registry(RegistryError::InvalidChain(_)))
    ));
}

// =============================================================================
// Dispatcher Tests
// =============================================================================

#[tokio::test]
async fn test_unregistered_method_invokes_no_filter() {
    let hits = Arc::new(AtomicUsize::new(0));
    let dispatcher = Dispatcher::builder()
        .global_filter(Filter::future(CountingFilter { hits: hits.clone() }))
        .method("echo", reverse_endpoint(Arc::new(AtomicUsize::new(0))))
        .build()
        .unwrap();

    let reply = dispatcher.dispatch("unregistered", vec![]);
    assert_eq!(reply.shape(), ReturnShape::Value);

    let future = reply.into_future().unwrap();
    assert!(future.is_done());
    assert_eq!(
        future.await,
        Err(ErrorKind::UnknownMethod("unregistered".into()))
    );
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_one_context_per_call() {
    let capture = Arc::new(CaptureFilter::default());
    let dispatcher = Dispatcher::builder()
        .global_filter(Filter::Async(capture.clone()))
        .method("id", Endpoint::sync(|ctx| Ok(json!(ctx.correlation_id()))))
        .build()
        .unwrap();

    let first = dispatcher
        .dispatch_request(DispatchRequest::new("id").correlation_id("req-1"))
        .value()
        .await;
    let second = dispatcher.dispatch("id", vec![]).value().await.unwrap();

    assert_eq!(first, Ok(json!("req-1")));
    assert_ne!(second, json!("req-1"));

    let seen = capture.seen.lock();
    assert_eq!(seen.len(), 2);
    assert!(!Arc::ptr_eq(&seen[0], &seen[1]));
    assert!(seen
        .iter()
        .all(|ctx| ctx.state() == InvocationState::ResolvedSuccess));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_times_out_and_signals_handler() {
    let observed = Arc::new(AtomicBool::new(false));
    let flag = observed.clone();
    let dispatcher = Dispatcher::builder()
        .method(
            "slow",
            Endpoint::async_fn(move |ctx: Arc<RequestContext>| {
                let flag = flag.clone();
                async move {
                    tokio::select! {
                        _ = ctx.cancellation().cancelled() => {
                            flag.store(true, Ordering::SeqCst);
                            Err(ErrorKind::Cancelled)
                        }
                        _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(json!("late")),
                    }
                }
            }),
        )
        .build()
        .unwrap();

    let reply = dispatcher
        .dispatch_request(DispatchRequest::new("slow").timeout(Duration::from_millis(100)))
        .value()
        .await;
    assert_eq!(reply, Err(ErrorKind::Timeout(100)));

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(observed.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_result_before_deadline_wins() {
    let dispatcher = Dispatcher::builder()
        .config(DispatcherConfig::new().with_timeout_ms(500))
        .method(
            "quick",
            Endpoint::async_fn(|_| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(json!("done"))
            }),
        )
        .build()
        .unwrap();

    let reply = dispatcher.dispatch("quick", vec![]).value().await;
    assert_eq!(reply, Ok(json!("done")));
}

#[tokio::test]
async fn test_caller_cancel_reaches_handler() {
    let capture = Arc::new(CaptureFilter::default());
    let (signalled_tx, signalled_rx) = tokio::sync::oneshot::channel();
    let signalled_tx = Arc::new(Mutex::new(Some(signalled_tx)));
    let dispatcher = Dispatcher::builder()
        .global_filter(Filter::Async(capture.clone()))
        .method(
            "wait",
            Endpoint::async_fn(move |ctx: Arc<RequestContext>| {
                let signalled_tx = signalled_tx.clone();
                async move {
                    ctx.cancellation().cancelled().await;
                    if let Some(tx) = signalled_tx.lock().take() {
                        let _ = tx.send(());
                    }
                    Err(ErrorKind::Cancelled)
                }
            }),
        )
        .build()
        .unwrap();

    let call = dispatcher.dispatch("wait", vec![]);
    tokio::task::yield_now().await;
    assert!(call.cancel());

    tokio::time::timeout(Duration::from_secs(5), signalled_rx)
        .await
        .expect("handler never saw the cancel signal")
        .unwrap();
    assert_eq!(call.value().await, Err(ErrorKind::Cancelled));

    let seen = capture.seen.lock();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].is_cancelled());
    assert_eq!(seen[0].state(), InvocationState::ResolvedFailure);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_inside_filters_is_failure_not_short_circuit() {
    let capture = Arc::new(CaptureFilter::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let dispatcher = Dispatcher::builder()
        .config(DispatcherConfig::new().with_timeout_ms(50))
        .global_filter(Filter::Async(capture.clone()))
        .method_with(
            "echo",
            reverse_endpoint(calls.clone()),
            vec![Filter::future(StallFilter {
                delay: Duration::from_millis(200),
            })],
        )
        .build()
        .unwrap();

    let reply = dispatcher.dispatch("echo", vec![json!("ab")]).value().await;
    assert_eq!(reply, Err(ErrorKind::Timeout(50)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let seen = capture.seen.lock();
    assert_eq!(seen[0].state(), InvocationState::ResolvedFailure);
    assert!(seen[0].is_cancelled());
}

#[tokio::test]
async fn test_concurrency_limit_pushes_back() {
    let limiter = Arc::new(PushBackFilter::concurrency_limit(1));
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let release_rx = Arc::new(Mutex::new(Some(release_rx)));
    let dispatcher = Dispatcher::builder()
        .global_filter(Filter::Async(limiter.clone()))
        .method(
            "gate",
            Endpoint::async_fn(move |_| {
                let release_rx = release_rx.lock().take();
                async move {
                    if let Some(rx) = release_rx {
                        let _ = rx.await;
                    }
                    Ok(json!("through"))
                }
            }),
        )
        .build()
        .unwrap();

    let held = dispatcher.dispatch("gate", vec![]);
    let refused = dispatcher.dispatch("gate", vec![]).value().await;
    assert_eq!(
        refused,
        Err(ErrorKind::HandlerFailure("reached concurrency limit 1".into()))
    );

    release_tx.send(()).unwrap();
    assert_eq!(held.value().await, Ok(json!("through")));
    assert_eq!(dispatcher.dispatch("gate", vec![]).value().await, Ok(json!("through")));
    assert_eq!(limiter.pushed_back(), 1);
}

#[tokio::test]
async fn test_retry_and_hit_counting() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counted = attempts.clone();
    let hits = Arc::new(HitsCounterFilter::new());

    let dispatcher = Dispatcher::builder()
        .global_filter(Filter::Async(hits.clone()))
        .method_with(
            "flaky",
            Endpoint::future(move |_| {
                if counted.fetch_add(1, Ordering::SeqCst) < 2 {
                    ComposableFuture::from_error(ErrorKind::HandlerFailure("transient".into()))
                } else {
                    ComposableFuture::from_value(json!("ok"))
                }
            }),
            vec![Filter::future(RetryFilter::new(3))],
        )
        .build()
        .unwrap();

    let reply = dispatcher.dispatch("flaky", vec![]).value().await;

    assert_eq!(reply, Ok(json!("ok")));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(
        hits.counts("flaky"),
        HitCounts {
            total: 1,
            success: 1,
            error: 0
        }
    );
}

#[tokio::test]
async fn test_combining_dispatched_results() {
    let dispatcher = Dispatcher::builder()
        .method("echo", reverse_endpoint(Arc::new(AtomicUsize::new(0))))
        .build()
        .unwrap();

    let calls: Vec<ComposableFuture<Value>> = ["ab", "cd", "ef"]
        .iter()
        .map(|text| {
            dispatcher
                .dispatch("echo", vec![json!(text)])
                .into_future()
                .unwrap()
        })
        .collect();

    let combined = ComposableFuture::all(calls).await;
    assert_eq!(combined, Ok(vec![json!("ba"), json!("dc"), json!("fe")]));
}

#[tokio::test]
async fn test_dispatcher_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dispatcher.toml");
    std::fs::write(
        &path,
        "name = \"file-backed\"\nsync_execution = \"inline\"\nstream_buffer_size = 4\n",
    )
    .unwrap();
    let local = dir.path().join("dispatcher.local.toml");
    std::fs::write(&local, "stream_buffer_size = 16\nverbose = true\n").unwrap();

    let config = DispatcherConfig::from_file(&path).unwrap();
    assert_eq!(config.stream_buffer_size, 4);
    let config = DispatcherConfig::load_layered(&[&path, &local]).unwrap();
    assert_eq!(config.stream_buffer_size, 16);
    assert!(config.is_verbose());
    let dispatcher = Dispatcher::builder()
        .config(config)
        .method("echo", reverse_endpoint(Arc::new(AtomicUsize::new(0))))
        .build()
        .unwrap();

    assert_eq!(dispatcher.config().name(), "file-backed");
    let future = dispatcher
        .dispatch("echo", vec![json!("inline")])
        .into_future()
        .unwrap();
    // inline sync chains finish before dispatch returns
    assert_eq!(future.peek(), Some(Ok(json!("enilni"))));
}

// =============================================================================
// Streaming Tests
// =============================================================================

fn numbers_endpoint() -> Endpoint {
    Endpoint::stream(|_| StreamResult::from_iter(vec![json!(1), json!(2), json!(3)]))
}

#[tokio::test]
async fn test_stream_delivers_in_order_then_completes() {
    let dispatcher = Dispatcher::builder()
        .method_with(
            "numbers",
            numbers_endpoint(),
            vec![Filter::stream(LoggingFilter::new())],
        )
        .build()
        .unwrap();

    let stream = dispatcher
        .dispatch("numbers", vec![])
        .into_stream()
        .unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let (on_next, on_error, on_complete) = (events.clone(), events.clone(), events.clone());
    let subscription = stream
        .subscribe(
            move |value| on_next.lock().push(format!("next {}", value)),
            move |error| on_error.lock().push(format!("error {}", error)),
            move || on_complete.lock().push("complete".to_string()),
        )
        .unwrap();
    subscription.finished().await;

    assert_eq!(
        *events.lock(),
        vec!["next 1", "next 2", "next 3", "complete"]
    );

    let second = stream.subscribe(|_| {}, |_| {}, || {});
    assert!(matches!(second, Err(ErrorKind::AlreadySubscribed)));
}

#[tokio::test]
async fn test_empty_stream_still_completes() {
    let dispatcher = Dispatcher::builder()
        .method("nothing", Endpoint::stream(|_| StreamResult::empty()))
        .build()
        .unwrap();

    let stream = dispatcher.dispatch("nothing", vec![]).into_stream().unwrap();
    let completed = Arc::new(AtomicBool::new(false));
    let nexts = Arc::new(AtomicUsize::new(0));
    let (flag, count) = (completed.clone(), nexts.clone());

    stream
        .subscribe(
            move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
            move || flag.store(true, Ordering::SeqCst),
        )
        .unwrap()
        .finished()
        .await;

    assert!(completed.load(Ordering::SeqCst));
    assert_eq!(nexts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_stream_error_terminates() {
    let dispatcher = Dispatcher::builder()
        .method(
            "broken",
            Endpoint::stream(|_| {
                StreamResult::from_stream(futures::stream::iter(vec![
                    Ok(json!(1)),
                    Err(ErrorKind::HandlerFailure("disk".into())),
                    Ok(json!(2)),
                ]))
            }),
        )
        .build()
        .unwrap();

    let outcome = dispatcher
        .dispatch("broken", vec![])
        .into_stream()
        .unwrap()
        .collect()
        .await;
    assert_eq!(outcome, Err(ErrorKind::HandlerFailure("disk".into())));
}

#[tokio::test]
async fn test_back_pressure_blocks_producer() {
    let produced = Arc::new(AtomicUsize::new(0));
    let counter = produced.clone();
    let dispatcher = Dispatcher::builder()
        .method(
            "ticks",
            Endpoint::stream(move |_| {
                let (sender, stream) = StreamResult::channel(1);
                let counter = counter.clone();
                tokio::spawn(async move {
                    for i in 0..3 {
                        if sender.send(json!(i)).await.is_err() {
                            return;
                        }
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                });
                stream
            }),
        )
        .build()
        .unwrap();

    let stream = dispatcher.dispatch("ticks", vec![]).into_stream().unwrap();
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    // one event buffered, the second send is waiting for the consumer
    assert_eq!(produced.load(Ordering::SeqCst), 1);

    let items = stream.collect().await.unwrap();
    assert_eq!(items, vec![json!(0), json!(1), json!(2)]);
    assert_eq!(produced.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_cancel_stops_producer() {
    let (stopped_tx, stopped_rx) = tokio::sync::oneshot::channel::<()>();
    let stopped_tx = Arc::new(Mutex::new(Some(stopped_tx)));

    let dispatcher = Dispatcher::builder()
        .method(
            "forever",
            Endpoint::stream(move |_| {
                let (sender, stream) = StreamResult::channel(2);
                let stopped_tx = stopped_tx.clone();
                tokio::spawn(async move {
                    let mut i = 0u64;
                    while sender.send(json!(i)).await.is_ok() {
                        i += 1;
                    }
                    if let Some(tx) = stopped_tx.lock().take() {
                        let _ = tx.send(());
                    }
                });
                stream
            }),
        )
        .build()
        .unwrap();

    let stream = dispatcher.dispatch("forever", vec![]).into_stream().unwrap();
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    let completed = Arc::new(AtomicBool::new(false));
    let flag = completed.clone();

    let subscription = stream
        .subscribe(
            move |value| {
                let _ = seen_tx.send(value);
            },
            |_| {},
            move || flag.store(true, Ordering::SeqCst),
        )
        .unwrap();

    assert_eq!(seen_rx.recv().await, Some(json!(0)));
    subscription.cancel();

    tokio::time::timeout(Duration::from_secs(5), stopped_rx)
        .await
        .expect("producer did not observe cancellation")
        .unwrap();
    subscription.finished().await;
    assert!(!completed.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_stream_deadline() {
    let dispatcher = Dispatcher::builder()
        .method(
            "stalled",
            Endpoint::stream(|_| StreamResult::from_stream(futures::stream::pending())),
        )
        .build()
        .unwrap();

    let outcome = dispatcher
        .dispatch_request(DispatchRequest::new("stalled").timeout(Duration::from_millis(30)))
        .into_stream()
        .unwrap()
        .collect()
        .await;
    assert_eq!(outcome, Err(ErrorKind::Timeout(30)));
}
