//! Error types for the VU runtime.

use std::time::Duration;
use thiserror::Error;

/// Errors returned by the VU lifecycle API (`Runner::new_vu`, `Vu::run_once`).
#[derive(Debug, Error)]
pub enum VuError {
    /// The test script failed to parse or compile. No VU was created.
    #[error("failed to compile {filename}: {message}")]
    Compile { filename: String, message: String },

    /// The built-in bootstrap script or host bindings failed to install.
    #[error("failed to bootstrap VU runtime: {0}")]
    Bootstrap(String),

    /// The script raised an error that it did not handle.
    #[error("script error: {0}")]
    Script(String),

    /// The script called `$test.abort()`; the whole test run must stop.
    #[error("test aborted by script")]
    Aborted,

    /// The iteration was cancelled by the caller.
    #[error("iteration cancelled")]
    Cancelled,

    /// The script engine or I/O runtime could not be created.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl VuError {
    /// True for the abort signal raised by `$test.abort()`.
    pub fn is_abort(&self) -> bool {
        matches!(self, VuError::Aborted)
    }
}

impl From<rquickjs::Error> for VuError {
    fn from(err: rquickjs::Error) -> Self {
        VuError::Runtime(err.to_string())
    }
}

/// Errors produced while executing a single HTTP action.
///
/// HTTP status codes are never errors; only failures to obtain a response are.
#[derive(Debug, Clone, Error)]
pub enum HttpError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// DNS, connect, TLS or protocol failure.
    #[error("{0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request cancelled")]
    Cancelled,
}

impl HttpError {
    /// True for failures of the network layer (as opposed to malformed input).
    pub fn is_transport(&self) -> bool {
        matches!(self, HttpError::Transport(_) | HttpError::Timeout(_))
    }
}

/// Result type for HTTP actions.
pub type HttpResult<T> = std::result::Result<T, HttpError>;
