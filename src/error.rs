//! Crate-level error classification.
//!
//! Each layer has its own `thiserror` enum; every one of them maps onto an
//! [`ErrorKind`] so callers can branch on the class of failure without
//! matching on layer-specific variants.

use crate::account::AuthError;
use crate::binding::BindingError;
use crate::bridge::BridgeError;
use crate::config::ConfigError;
use crate::registry::StreamError;
use crate::sourcing::SourcingError;
use crate::storage::StorageError;

/// Class of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad filter set, circular sourcing, incompatible retention, bad limits.
    /// Fatal at setup time; retrying will not help.
    Configuration,
    /// Cross-account boundary or stream policy violation.
    PermissionDenied,
    /// Unknown account, stream, message or binding.
    NotFound,
    /// Upstream temporarily unreachable; sourcing consumers retry with backoff.
    TransientUpstreamUnavailable,
    /// A count, size or consumer limit rejected the operation.
    LimitExceeded,
    /// Malformed subject or request.
    InvalidRequest,
    /// Storage backend failure.
    Storage,
}

impl ErrorKind {
    /// True for failures a caller may retry unchanged.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::TransientUpstreamUnavailable)
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Any error surfaced by the broker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Sourcing(#[from] SourcingError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Configuration,
            Error::Auth(e) => e.kind(),
            Error::Stream(e) => e.kind(),
            Error::Bridge(e) => e.kind(),
            Error::Binding(e) => e.kind(),
            Error::Sourcing(e) => e.kind(),
            Error::Storage(e) => e.kind(),
        }
    }
}
