//! Error type shared by the poller core and its collaborators.

use thiserror::Error;

/// Failures raised by the poller core and its collaborators.
#[derive(Debug, Error)]
pub enum PollerError {
    /// A host name could not be turned into a numeric address.
    #[error("cannot resolve host {host}: {reason}")]
    Resolution {
        /// Host that failed to resolve.
        host: String,
        /// Resolver message.
        reason: String,
    },

    /// The cluster directory could not list its members.
    #[error("cluster directory unavailable: {0}")]
    DirectoryUnavailable(String),

    /// One poll of a node's metric failed.
    #[error("fetch from {addr} failed: {reason}")]
    Fetch {
        /// Node address.
        addr: String,
        /// Fetcher message.
        reason: String,
    },

    /// The worker for a node could not be built.
    #[error("cannot create worker for {addr}: {reason}")]
    WorkerCreation {
        /// Node address.
        addr: String,
        /// Factory message.
        reason: String,
    },

    /// A node id was registered twice.
    #[error("node {0} is already registered")]
    DuplicateNode(String),

    /// The registry no longer accepts workers.
    #[error("worker registry is closed")]
    RegistryClosed,

    /// `init` was called on a running manager.
    #[error("manager already initialized")]
    AlreadyInitialized,

    /// The manager was destroyed.
    #[error("manager has been destroyed")]
    Destroyed,
}

impl PollerError {
    /// Builds a [`PollerError::Fetch`] for `addr`.
    pub fn fetch(addr: impl ToString, reason: impl ToString) -> Self {
        PollerError::Fetch {
            addr: addr.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Builds a [`PollerError::WorkerCreation`] for `addr`.
    pub fn worker_creation(addr: impl ToString, reason: impl ToString) -> Self {
        PollerError::WorkerCreation {
            addr: addr.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result alias for poller operations.
pub type Result<T> = std::result::Result<T, PollerError>;
