//! Error taxonomy shared by the host envelope and the native ops.
//!
//! Three layers of errors exist:
//!
//! - [`OpError`] is what a native op hands back to the JS engine. The backend
//!   turns it into the matching JS exception class (`TypeError`,
//!   `DOMException(name)`, ...).
//! - [`JsError`] is a JS exception observed on the host side (compile
//!   failure, uncaught error, unhandled rejection).
//! - [`WorkerError`] is what ends up in `WorkerResult.error`, tagged with an
//!   [`ErrorKind`].

use serde::{Deserialize, Serialize};

/// Kinds reported to the host in the result envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    CompileError,
    TypeError,
    InvalidAccessError,
    DataError,
    AbortError,
    TimeoutError,
    OperationError,
    NetworkError,
    UnhandledRejection,
    HostError,
    MemoryLimit,
    MissingExport,
    /// Any other uncaught JS value (`Error`, `RangeError`, a thrown string).
    Exception,
}

impl ErrorKind {
    /// Classify a JS error by its `name` (and message, for network failures).
    pub fn from_js_name(name: &str, message: &str) -> Self {
        match name {
            "TypeError" if message.starts_with("Failed to fetch") => ErrorKind::NetworkError,
            "TypeError" => ErrorKind::TypeError,
            "InvalidAccessError" => ErrorKind::InvalidAccessError,
            "DataError" => ErrorKind::DataError,
            "AbortError" => ErrorKind::AbortError,
            "TimeoutError" => ErrorKind::TimeoutError,
            "OperationError" => ErrorKind::OperationError,
            "NetworkError" => ErrorKind::NetworkError,
            _ => ErrorKind::Exception,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Error entry of the result envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct WorkerError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl WorkerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
        }
    }

    pub fn host(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HostError, message)
    }

    /// Errors outside the named kinds keep their JS class in the message.
    pub fn from_js(err: JsError) -> Self {
        let kind = ErrorKind::from_js_name(&err.name, &err.message);
        let message = match kind {
            ErrorKind::Exception if !err.name.is_empty() => format!("{}: {}", err.name, err.message),
            _ => err.message,
        };
        Self {
            kind,
            message,
            stack: err.stack,
        }
    }
}

/// Failure of a host-side engine operation (compiling a site, starting its
/// context). Request-level failures travel in [`WorkerError`] instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("compile error: {0}")]
    Compile(JsError),
    #[error("failed to set up the JS context: {0}")]
    Setup(JsError),
    #[error("failed to spawn a context thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to start the I/O runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("failed to build the HTTP client: {0}")]
    Http(#[from] reqwest::Error),
    #[error("context for site '{0}' exited unexpectedly")]
    ContextGone(String),
}

/// A JS exception as seen from the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {message}")]
pub struct JsError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl JsError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Marker used by the backend when execution was terminated by the
    /// watchdog or the heap limit.
    pub fn terminated() -> Self {
        Self::new("Terminated", "execution terminated")
    }

    pub fn is_terminated(&self) -> bool {
        self.name == "Terminated"
    }
}

/// Error returned from a native op; thrown into JS as the matching class.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OpError {
    #[error("TypeError: {0}")]
    Type(String),
    #[error("RangeError: {0}")]
    Range(String),
    #[error("SyntaxError: {0}")]
    Syntax(String),
    #[error("{name}: {message}")]
    Dom { name: &'static str, message: String },
    /// `TypeError("Failed to fetch")` with the underlying failure as `cause`.
    #[error("TypeError: Failed to fetch: {cause}")]
    Network { cause: String },
    #[error("Error: {0}")]
    Generic(String),
}

impl OpError {
    pub fn type_error(message: impl Into<String>) -> Self {
        OpError::Type(message.into())
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        OpError::Range(message.into())
    }

    pub fn dom(name: &'static str, message: impl Into<String>) -> Self {
        OpError::Dom {
            name,
            message: message.into(),
        }
    }

    pub fn abort(message: impl Into<String>) -> Self {
        Self::dom("AbortError", message)
    }

    pub fn no_request_state(request_id: u64) -> Self {
        OpError::Type(format!("no active request state (request {request_id})"))
    }

    /// JS class name the error is thrown as.
    pub fn js_name(&self) -> &str {
        match self {
            OpError::Type(_) | OpError::Network { .. } => "TypeError",
            OpError::Range(_) => "RangeError",
            OpError::Syntax(_) => "SyntaxError",
            OpError::Dom { name, .. } => name,
            OpError::Generic(_) => "Error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            OpError::Type(m) | OpError::Range(m) | OpError::Syntax(m) | OpError::Generic(m) => m.clone(),
            OpError::Dom { message, .. } => message.clone(),
            OpError::Network { .. } => "Failed to fetch".to_string(),
        }
    }
}
