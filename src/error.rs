//! Error types and handling for rs2-flow
//!
//! This module provides the error taxonomy shared by processors,
//! subscribers, publishers and pollers.

use std::any::Any;

/// Main error type for flow operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FlowError {
    /// The item itself was malformed or rejected. Never cancels a subscription.
    #[error("Validation failed: {0}")]
    Validation(String),
    /// Any other item processing failure. Cancels the subscription.
    #[error("Processing failed: {0}")]
    Processing(String),
    /// A processor could not be prepared. Fatal to the pipeline.
    #[error("Preparation failed: {0}")]
    Prepare(String),
    /// The upstream producer reported an error.
    #[error("Producer failed: {0}")]
    Producer(String),
    /// A single poll attempt failed.
    #[error("Poll failed: {0}")]
    Poll(String),
    /// The subscription was closed abruptly, most likely due to a processing error
    #[error("Subscription cancelled")]
    Cancelled,
    /// A processor panicked while handling an item
    #[error("Processor panicked: {0}")]
    Panicked(String),
    /// A single-subscriber publisher was subscribed to twice
    #[error("Publisher already has a subscriber")]
    AlreadySubscribed,
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,
    /// I/O related errors
    #[error("IO error: {0}")]
    IO(String),
    /// The completion signal was dropped without being fired
    #[error("Completion channel disconnected")]
    Disconnected,
}

impl FlowError {
    /// Whether this error only rejects the current item.
    pub fn is_validation(&self) -> bool {
        matches!(self, FlowError::Validation(_))
    }

    /// Build a [`FlowError::Panicked`] from a `catch_unwind` payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        FlowError::Panicked(message)
    }
}

impl From<std::io::Error> for FlowError {
    fn from(err: std::io::Error) -> Self {
        FlowError::IO(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for FlowError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        FlowError::Timeout
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::InvalidConfiguration(err.to_string())
    }
}

/// Result type for rs2-flow operations
pub type FlowResult<T> = Result<T, FlowError>;

/// Collapse the outcome of a `catch_unwind`ed processing future into a single
/// [`FlowResult`], turning a panic into [`FlowError::Panicked`].
pub(crate) fn flatten_panic<T>(outcome: Result<FlowResult<T>, Box<dyn Any + Send + 'static>>) -> FlowResult<T> {
    outcome.unwrap_or_else(|panic| Err(FlowError::from_panic(panic)))
}
