//! Errors raised by [`crate::host::TaskwireServer`] operations.

use std::{io, net::SocketAddr};

use thiserror::Error;

/// Errors that may occur while building or running the server.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServerError {
    /// Binding the listener failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address the server attempted to bind.
        addr: SocketAddr,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// The builder was finished without a task executor.
    #[error("no task executor configured")]
    MissingExecutor,
}
