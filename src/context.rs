//! Per-invocation request context.
//!
//! One `RequestContext` is created for every dispatched call and shared (via
//! `Arc`) by the filters of that call only. Method, arguments, deadline and
//! correlation id are fixed at construction; the attribute map is the only
//! mutable part and exists for filter-to-filter communication.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::error::{ErrorKind, Outcome};

/// Dynamic value used for arguments, attributes and results.
pub type Value = serde_json::Value;

/// Where an invocation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    /// Context built, chain not entered yet
    Created,
    /// Inside the filter at this position (the endpoint sits after the last filter)
    Dispatching(usize),
    /// The endpoint ran and the call succeeded
    ResolvedSuccess,
    /// The call failed after reaching the endpoint
    ResolvedFailure,
    /// A filter answered without letting the call reach the endpoint
    ShortCircuited,
}

impl InvocationState {
    /// Terminal states are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvocationState::ResolvedSuccess
                | InvocationState::ResolvedFailure
                | InvocationState::ShortCircuited
        )
    }
}

/// Carrier of request metadata threaded through the filter chain.
pub struct RequestContext {
    method: String,
    args: Vec<Value>,
    deadline: Option<Instant>,
    correlation_id: String,
    attributes: Mutex<HashMap<String, Value>>,
    cancel: CancelSignal,
    state: Mutex<InvocationState>,
    endpoint_reached: AtomicBool,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("method", &self.method)
            .field("args", &self.args)
            .field("deadline", &self.deadline)
            .field("correlation_id", &self.correlation_id)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl RequestContext {
    /// Start building a context for `method`.
    pub fn builder(method: impl Into<String>) -> RequestContextBuilder {
        RequestContextBuilder::new(method)
    }

    /// The invoked method's identifier.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Arguments in declaration order.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Raw argument at `index`.
    pub fn arg_value(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Decode the argument at `index`.
    ///
    /// A missing or mistyped argument fails with `MappingFailure`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Outcome<T> {
        let value = self.args.get(index).ok_or_else(|| {
            ErrorKind::MappingFailure(format!(
                "{} expects an argument at position {}",
                self.method, index
            ))
        })?;
        serde_json::from_value(value.clone()).map_err(ErrorKind::from)
    }

    /// Absolute deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Check whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }

    /// Correlation id used to tie log lines of one call together.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Read an attribute set by an earlier filter.
    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.attributes.lock().get(key).cloned()
    }

    /// Set an attribute, returning the previous value.
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.attributes.lock().insert(key.into(), value.into())
    }

    /// Remove an attribute.
    pub fn remove_attribute(&self, key: &str) -> Option<Value> {
        self.attributes.lock().remove(key)
    }

    /// Check whether an attribute is present.
    pub fn has_attribute(&self, key: &str) -> bool {
        self.attributes.lock().contains_key(key)
    }

    /// Cooperative cancellation signal for this call.
    ///
    /// Fired when the deadline passes or the caller cancels. Handlers may
    /// observe it to stop early; nothing is interrupted for them.
    pub fn cancellation(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Shortcut for `cancellation().is_cancelled()`.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> InvocationState {
        *self.state.lock()
    }

    /// Check whether the endpoint has been invoked.
    pub fn endpoint_reached(&self) -> bool {
        self.endpoint_reached.load(Ordering::Acquire)
    }

    pub(crate) fn enter(&self, position: usize) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = InvocationState::Dispatching(position);
        }
    }

    pub(crate) fn reach_endpoint(&self, position: usize) {
        self.endpoint_reached.store(true, Ordering::Release);
        self.enter(position);
    }

    /// Move to a terminal state; the first call wins.
    ///
    /// A call that never reached the endpoint counts as short-circuited,
    /// unless it was cut off by a timeout or a cancellation: those are
    /// failures no filter chose.
    pub(crate) fn finish(&self, error: Option<&ErrorKind>) -> InvocationState {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = match error {
                Some(error) if error.is_timeout() || error.is_cancelled() => {
                    InvocationState::ResolvedFailure
                }
                _ if !self.endpoint_reached() => InvocationState::ShortCircuited,
                None => InvocationState::ResolvedSuccess,
                Some(_) => InvocationState::ResolvedFailure,
            };
        }
        *state
    }
}

/// Builder for `RequestContext`.
#[derive(Debug)]
pub struct RequestContextBuilder {
    method: String,
    args: Vec<Value>,
    deadline: Option<Instant>,
    correlation_id: Option<String>,
}

impl RequestContextBuilder {
    /// Create a builder for `method`.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            args: Vec::new(),
            deadline: None,
            correlation_id: None,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Append several arguments.
    pub fn args<I>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        self.args.extend(values);
        self
    }

    /// Set an absolute deadline.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set an optional absolute deadline.
    pub fn maybe_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Set the deadline relative to now.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Set the correlation id. A random one is generated otherwise.
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Build the context.
    pub fn build(self) -> RequestContext {
        RequestContext {
            method: self.method,
            args: self.args,
            deadline: self.deadline,
            correlation_id: self
                .correlation_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            attributes: Mutex::new(HashMap::new()),
            cancel: CancelSignal::new(),
            state: Mutex::new(InvocationState::Created),
            endpoint_reached: AtomicBool::new(false),
        }
    }
}
