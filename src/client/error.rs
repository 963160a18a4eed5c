//! Error types for taskwire client operations.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::{codec::CodecError, correlator::DuplicateRequestId, envelope::ErrorInfo};

/// Connection establishment failures.
///
/// Cloneable because concurrent callers share a single connect attempt and
/// each receives the same outcome.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ConnectError {
    /// The dial or WebSocket handshake failed.
    #[error("failed to connect to {url}")]
    Handshake {
        /// Endpoint that was dialled.
        url: String,
        /// Underlying handshake failure.
        #[source]
        source: Arc<tungstenite::Error>,
    },
    /// The dial did not finish within the configured connect timeout.
    #[error("connecting to {url} timed out after {timeout:?}")]
    Timeout {
        /// Endpoint that was dialled.
        url: String,
        /// The configured connect timeout.
        timeout: Duration,
    },
}

/// Errors emitted by [`crate::client::ClientSession`] calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// Establishing the connection failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),
    /// The connection was torn down before the reply arrived.
    #[error("connection closed before a reply arrived")]
    ConnectionClosed,
    /// The caller's cancellation token fired before the reply arrived.
    #[error("call cancelled by caller")]
    Cancelled,
    /// No reply arrived within the call deadline.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    /// The host reported a task failure. Delivered through the normal reply
    /// channel; the connection stays up.
    #[error("task failed: {0}")]
    Task(ErrorInfo),
    /// Encoding the request envelope failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// A request id was issued twice, which the monotonic counter should
    /// make impossible.
    #[error(transparent)]
    DuplicateRequestId(#[from] DuplicateRequestId),
}
