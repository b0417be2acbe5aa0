//! Error taxonomy for the graph engine
//!
//! Every recoverable failure surfaces as a [`GraphError`]. Callers branch on
//! [`GraphError::kind`] rather than on individual variants:
//!
//! - `BadRequest`: grammar, syntax and predicate violations
//! - `NotFound`: missing nodes, edges, leases or snapshots
//! - `Conflict`: etag mismatch, duplicate unique edge, duplicate node key
//!
//! Broken lease-subsystem assumptions (double start, failed acquisition after
//! a break, a scope without a lease) are not errors at all: they panic.

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraphError>;

/// Coarse classification used by callers to decide between retry, reload
/// and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    Conflict,
    Cancelled,
    Internal,
}

/// A grammar or query text failure, positioned on the offending token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub message: String,
    /// Offending token text; `None` when input ended early.
    pub token: Option<String>,
    /// Character offset of the token in the source text.
    pub offset: usize,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, token: Option<String>, offset: usize) -> Self {
        SyntaxError {
            message: message.into(),
            token,
            offset,
        }
    }

    pub fn at_token(message: impl Into<String>, token: &str, offset: usize) -> Self {
        Self::new(message, Some(token.to_string()), offset)
    }

    pub fn at_end(message: impl Into<String>, offset: usize) -> Self {
        Self::new(message, None, offset)
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.token {
            Some(token) => write!(f, "{} (token '{}' at offset {})", self.message, token, self.offset),
            None => write!(f, "{} (end of input at offset {})", self.message, self.offset),
        }
    }
}

impl std::error::Error for SyntaxError {}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("syntax error: {0}")]
    Syntax(#[from] SyntaxError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GraphError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphError::BadRequest(_) | GraphError::Syntax(_) => ErrorKind::BadRequest,
            GraphError::NotFound(_) => ErrorKind::NotFound,
            GraphError::Conflict(_) => ErrorKind::Conflict,
            GraphError::Cancelled => ErrorKind::Cancelled,
            GraphError::Store(_)
            | GraphError::Serialization(_)
            | GraphError::Metrics(_)
            | GraphError::Io(_) => ErrorKind::Internal,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_bad_request(&self) -> bool {
        self.kind() == ErrorKind::BadRequest
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(e: serde_json::Error) -> Self {
        GraphError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for GraphError {
    fn from(e: bincode::Error) -> Self {
        GraphError::Serialization(e.to_string())
    }
}
