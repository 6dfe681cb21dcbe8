//! Remote call failures and their classification

use std::fmt;

/// How the engine reacts to a failed remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network trouble, server overload, expired session. Retryable.
    Transient,
    /// The server rejected the request on business grounds. Not retryable.
    Semantic,
    /// Nothing sensible can continue (bad credentials, unparseable replies).
    Fatal,
}

/// Fault text fragments that identify retryable server-side conditions
const TRANSIENT_FAULT_MARKERS: &[&str] = &[
    "session expired",
    "sessionexpired",
    "could not serialize access",
    "serializationfailure",
    "concurrent update",
    "lock not available",
    "connection pool is full",
    "server closed the connection",
];

const SESSION_EXPIRED_MARKERS: &[&str] = &["session expired", "sessionexpired"];

/// Error raised by a remote call
#[derive(Debug, Clone)]
pub enum RpcError {
    /// Connection refused, reset or timed out
    Network(String),
    /// Non-success HTTP status from the endpoint
    Http { status: u16, message: String },
    /// XML-RPC fault returned by the server
    Fault { code: String, message: String },
    /// Credentials rejected or no principal available
    AuthFailure(String),
    /// Server URL cannot be used
    InvalidEndpoint(String),
    /// Response could not be decoded
    Malformed(String),
    /// The retry budget of a single call was spent on transient failures
    RetriesExhausted { attempts: u32, last: Box<RpcError> },
    /// Repeated transient failures survived every cool-down
    Unreachable(String),
}

impl RpcError {
    /// Classify this error
    pub fn class(&self) -> FailureClass {
        match self {
            RpcError::Network(_) => FailureClass::Transient,
            RpcError::Http { status, .. } => match status {
                408 | 425 | 429 => FailureClass::Transient,
                s if *s >= 500 => FailureClass::Transient,
                _ => FailureClass::Fatal,
            },
            RpcError::Fault { .. } => {
                if self.matches_any(TRANSIENT_FAULT_MARKERS) {
                    FailureClass::Transient
                } else {
                    FailureClass::Semantic
                }
            }
            RpcError::RetriesExhausted { .. } => FailureClass::Transient,
            RpcError::AuthFailure(_)
            | RpcError::InvalidEndpoint(_)
            | RpcError::Malformed(_)
            | RpcError::Unreachable(_) => FailureClass::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == FailureClass::Fatal
    }

    /// Whether the server reported that the session must be re-established
    pub fn is_session_expired(&self) -> bool {
        matches!(self, RpcError::Fault { .. }) && self.matches_any(SESSION_EXPIRED_MARKERS)
    }

    /// One-line human message.
    ///
    /// Faults carry a full server traceback; the exception line is the last
    /// non-empty line of it.
    pub fn summary(&self) -> String {
        match self {
            RpcError::Fault { code, message } => {
                let last_line = message
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .last();
                match last_line {
                    Some(line) => line.to_string(),
                    None if !code.trim().is_empty() => {
                        code.lines().next().unwrap_or("").to_string()
                    }
                    None => "remote fault without message".to_string(),
                }
            }
            other => other.to_string(),
        }
    }

    fn matches_any(&self, markers: &[&str]) -> bool {
        let RpcError::Fault { code, message } = self else {
            return false;
        };
        let haystack = format!("{} {}", code, message).to_lowercase();
        markers.iter().any(|m| haystack.contains(m))
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Network(msg) => write!(f, "network error: {}", msg),
            RpcError::Http { status, message } => write!(f, "HTTP {}: {}", status, message),
            RpcError::Fault { .. } => write!(f, "remote fault: {}", self.summary()),
            RpcError::AuthFailure(msg) => write!(f, "authentication failed: {}", msg),
            RpcError::InvalidEndpoint(msg) => write!(f, "invalid endpoint: {}", msg),
            RpcError::Malformed(msg) => write!(f, "malformed response: {}", msg),
            RpcError::RetriesExhausted { attempts, last } => {
                write!(f, "gave up after {} attempts: {}", attempts, last)
            }
            RpcError::Unreachable(msg) => write!(f, "server unreachable: {}", msg),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<reqwest::Error> for RpcError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            RpcError::InvalidEndpoint(e.to_string())
        } else if let Some(status) = e.status() {
            RpcError::Http {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            RpcError::Network(e.to_string())
        }
    }
}
