//! Error types for rpcbus

use thiserror::Error;

/// Errors raised by a transport binding (dial, setup, publish, consume)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The broker could not be reached
    #[error("dial failed: {0}")]
    Dial(String),

    /// Exchange, queue or subscription setup was rejected
    #[error("setup failed: {0}")]
    Setup(String),

    /// A publish was rejected by the broker
    #[error("publish failed: {0}")]
    Publish(String),

    /// Error reported on an inbound stream
    #[error("consume failed: {0}")]
    Consume(String),

    /// The session was closed
    #[error("session closed")]
    Closed,

    /// No session is installed on the connection
    #[error("not connected")]
    NotConnected,
}

/// Errors from establishing a connection
#[derive(Debug, Error)]
pub enum ConnectError {
    /// One stage of the connect sequence failed
    #[error("{stage} failed: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: TransportError,
    },

    /// Every attempt failed; carries the last cause
    #[error("gave up after {attempts} connect attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<ConnectError>,
    },

    /// The retry budget was zero
    #[error("connect attempts must be at least 1")]
    NoAttempts,

    /// A stop signal arrived while connecting
    #[error("connect cancelled")]
    Cancelled,
}

impl ConnectError {
    pub(crate) fn stage(stage: &'static str) -> impl FnOnce(TransportError) -> Self {
        move |source| ConnectError::Stage { stage, source }
    }
}

/// Errors returned by clients and servers
#[derive(Debug, Error)]
pub enum RpcError {
    /// Connecting failed after all retries
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),

    /// No reply arrived before the call deadline
    #[error("remote call timed out")]
    Timeout,

    /// The instance is shutting down, has failed, or lost its transport
    #[error("connection closed")]
    ConnectionClosed,

    /// The server has no handler under the requested name
    #[error("unknown handler")]
    BadHandler,

    /// The handler failed or its result could not be encoded
    #[error("internal server error")]
    InternalServer,

    /// The reply carried a status this client does not understand
    #[error("unknown reply status: {0:?}")]
    UnknownStatus(String),

    /// The caller's cancellation future fired first
    #[error("remote call cancelled")]
    Cancelled,

    /// The request could not be encoded
    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    /// A success reply did not decode into the response type
    #[error("failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport failure outside of a call path
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type for rpcbus operations
pub type Result<T> = std::result::Result<T, RpcError>;
