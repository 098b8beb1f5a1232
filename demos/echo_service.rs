//! Example: An echo service behind a Relayline dispatcher
//!
//! Registers a few methods with filters, then plays the part of a
//! transport: it dispatches calls and prints what comes back.

use relayline::prelude::*;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Filters
// =============================================================================

/// Rejects calls without a `token` attribute set by an outer filter.
struct RequireToken;

impl AsyncFilter for RequireToken {
    fn name(&self) -> &str {
        "require-token"
    }

    fn handle_async(&self, ctx: Arc<RequestContext>, next: AsyncNext) -> ComposableFuture<Value> {
        if ctx.has_attribute("token") {
            next.invoke()
        } else {
            ComposableFuture::from_error(ErrorKind::HandlerFailure("unauthorized".into()))
        }
    }
}

/// Pretends every call arrived with credentials.
struct AttachToken;

impl AsyncFilter for AttachToken {
    fn name(&self) -> &str {
        "attach-token"
    }

    fn handle_async(&self, ctx: Arc<RequestContext>, next: AsyncNext) -> ComposableFuture<Value> {
        ctx.set_attribute("token", "demo");
        next.invoke()
    }
}

// =============================================================================
// Endpoints
// =============================================================================

struct Greeter;

#[async_trait]
impl AsyncHandler for Greeter {
    async fn call(&self, ctx: Arc<RequestContext>) -> Outcome<Value> {
        let name: String = ctx.arg(0)?;
        Ok(Value::from(format!("hello, {}", name)))
    }
}

fn countdown() -> Endpoint {
    Endpoint::stream(|ctx| {
        let from: u64 = match ctx.arg(0) {
            Ok(from) => from,
            Err(error) => return StreamResult::from_error(error),
        };
        let (sender, stream) = StreamResult::channel(4);
        tokio::spawn(async move {
            for n in (0..=from).rev() {
                if sender.send(Value::from(n)).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });
        stream
    })
}

fn build_dispatcher(hits: Arc<HitsCounterFilter>) -> DispatchResult<Dispatcher> {
    Dispatcher::builder()
        .config(
            DispatcherConfig::new()
                .with_name("echo-service")
                .with_timeout(Duration::from_secs(2)),
        )
        .global_filter(Filter::future(LoggingFilter::new()))
        .global_filter(Filter::stream(LoggingFilter::new()))
        .global_filter(Filter::Async(hits))
        .method_with(
            "echo",
            Endpoint::sync(|ctx| {
                let text: String = ctx.arg(0)?;
                Ok(Value::from(text.chars().rev().collect::<String>()))
            }),
            vec![Filter::future(AttachToken), Filter::future(RequireToken)],
        )
        .method_with(
            "secret",
            Endpoint::sync(|_| Ok(Value::from("42"))),
            vec![Filter::future(RequireToken)],
        )
        .method("greet", Endpoint::handler(Greeter))
        .method_with(
            "countdown",
            countdown(),
            vec![Filter::stream(TimeoutFilter::new(Duration::from_secs(1)))],
        )
        .build()
}

#[tokio::main]
async fn main() {
    println!("=== Relayline Echo Service Example ===\n");

    let hits = Arc::new(HitsCounterFilter::new());
    let dispatcher = match build_dispatcher(hits.clone()) {
        Ok(dispatcher) => dispatcher,
        Err(error) => {
            eprintln!("cannot build dispatcher: {}", error);
            return;
        }
    };
    println!("Methods: {:?}\n", dispatcher.names());

    let calls = [
        ("echo", vec![Value::from("hi")]),
        ("secret", vec![]),
        ("greet", vec![Value::from("relayline")]),
        ("missing", vec![]),
    ];
    for (method, args) in calls {
        match dispatcher.dispatch(method, args).value().await {
            Ok(value) => println!("{} -> {}", method, value),
            Err(error) => println!("{} failed: {}", method, error),
        }
    }

    println!("\ncountdown:");
    let stream = match dispatcher.dispatch("countdown", vec![Value::from(3)]).into_stream() {
        Some(stream) => stream,
        None => return,
    };
    let subscription = stream.subscribe(
        |n| println!("  {}", n),
        |error| println!("  failed: {}", error),
        || println!("  liftoff"),
    );
    if let Ok(subscription) = subscription {
        subscription.finished().await;
    }

    println!();
    for method in hits.methods() {
        let counts = hits.counts(&method);
        println!(
            "{}: {} calls, {} ok, {} failed",
            method, counts.total, counts.success, counts.error
        );
    }
}
