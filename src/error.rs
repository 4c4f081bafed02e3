use std::io;

use thiserror::Error;

use crate::connection::ConnState;

/// Errors returned by wireline entry points.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying socket operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Operation is not valid in the connection's current state.
    #[error("operation invalid in state {0:?}")]
    InvalidState(ConnState),
    /// Host name did not resolve to a usable address.
    #[error("address resolution failed: {0}")]
    Resolve(String),
    /// Blocking connect did not complete within the timeout.
    #[error("connect timed out")]
    ConnectTimedOut,
    /// A TLS connection was requested before any context was configured.
    #[error("TLS is not configured")]
    TlsNotConfigured,
    /// TLS context configuration failed; the previous context is untouched.
    #[error("TLS setup: {0}")]
    TlsSetup(String),
    /// Fatal TLS engine error.
    #[error("TLS: {0}")]
    Tls(String),
}
