//! Error types for the dispatch pipeline.
//!
//! `ErrorKind` is the in-band error: it travels inside `ComposableFuture`
//! and `StreamResult` values and is never thrown across a suspension point.
//! `RegistryError` covers method registration and chain construction, and
//! `DispatchError` is the root type for everything that can go wrong while
//! assembling a `Dispatcher`.

use std::any::Any;

use thiserror::Error;

/// Root error type for dispatcher assembly.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// An in-band dispatch error surfaced out of band
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] ErrorKind),

    /// Registry-related errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

/// Errors carried by futures and streams.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// No endpoint is registered under the requested method
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// User code (a filter or an endpoint) failed
    #[error("Handler failed: {0}")]
    HandlerFailure(String),

    /// Data-shape translation failed
    #[error("Mapping failed: {0}")]
    MappingFailure(String),

    /// A deadline or explicit timeout elapsed
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// A stream result was subscribed to more than once
    #[error("Stream already has a subscriber")]
    AlreadySubscribed,

    /// The operation was cancelled
    #[error("Operation was cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// Returns true for `Timeout` errors.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ErrorKind::Timeout(_))
    }

    /// Returns true for `Cancelled` errors.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ErrorKind::Cancelled)
    }

    /// Convert a caught panic payload into a `HandlerFailure`.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_string()
        };
        ErrorKind::HandlerFailure(message)
    }
}

/// Errors that can occur while registering methods or building chains.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A method is already registered under this name
    #[error("Method already registered: {0}")]
    AlreadyRegistered(String),

    /// Invalid method name
    #[error("Invalid method name: {0}")]
    InvalidName(String),

    /// Filter ordering cannot be executed
    #[error("Invalid filter chain: {0}")]
    InvalidChain(String),

    /// A filter does not match the endpoint's return shape
    #[error("Filter '{filter}' cannot wrap a {shape} endpoint")]
    ShapeMismatch {
        /// Name of the offending filter
        filter: String,
        /// Declared return shape of the endpoint
        shape: String,
    },
}

impl From<serde_json::Error> for ErrorKind {
    fn from(err: serde_json::Error) -> Self {
        ErrorKind::MappingFailure(err.to_string())
    }
}

impl From<String> for ErrorKind {
    fn from(msg: String) -> Self {
        ErrorKind::HandlerFailure(msg)
    }
}

impl From<&str> for ErrorKind {
    fn from(msg: &str) -> Self {
        ErrorKind::HandlerFailure(msg.to_string())
    }
}

/// Resolution of a future or a single stream event.
pub type Outcome<T> = Result<T, ErrorKind>;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Result type alias for dispatcher assembly.
pub type DispatchResult<T> = Result<T, DispatchError>;
