use std::io;

use thiserror::Error;

/// Failures a relay connection or listener can run into.
///
/// Everything except [`RelayError::ListenerFatal`] is scoped to a single
/// client and is logged by that client's handler rather than propagated.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("peer disconnected")]
    PeerDisconnected,

    #[error("failed to write to client: {0}")]
    TransportWriteFailed(#[source] io::Error),

    #[error("listener is no longer usable: {0}")]
    ListenerFatal(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Why a line could not be queued for a registered client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The client has torn down, or its writer has stopped.
    #[error("target is gone")]
    TargetGone,

    /// The client's outbound queue is full; it is not keeping up.
    #[error("target outbound queue is full")]
    Backlogged,
}
