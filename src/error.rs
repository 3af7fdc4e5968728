use std::time::Duration;

use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Result alias used across the runtime.
pub type BusResult<T> = Result<T, BusError>;

/// Failure while turning a message into bytes, or bytes back into a message.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("unsupported content type '{0}'")]
    UnsupportedContentType(String),

    #[error("envelope {0} carries neither a message nor serialized data")]
    MissingData(Uuid),

    #[error("expected message type '{expected}', envelope carries '{actual}'")]
    MessageTypeMismatch { expected: String, actual: String },

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bitcode: {0}")]
    Bitcode(#[from] bitcode::Error),
}

/// Failure reported by a backing store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceError {
    /// The session to the store is gone; any lock it held is gone with it.
    #[error("store connection lost")]
    ConnectionLost,

    /// The node lock could not be obtained or is no longer held.
    #[error("node lock for {0} is not held by this session")]
    LockNotHeld(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store error: {0}")]
    Other(String),
}

impl PersistenceError {
    /// Connection-level failures force the resiliency agent to tear down its
    /// session and reacquire the node lock.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            PersistenceError::ConnectionLost | PersistenceError::LockNotHeld(_)
        )
    }
}

/// Error raised by a message handler, tagged with a category that the
/// handler's [`ErrorPolicy`](crate::workers::ErrorPolicy) can match on.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no handler registered for message type '{0}'")]
    NoHandler(String),

    #[error("could not read message: {0}")]
    Deserialization(#[from] SerializationError),

    #[error("{category}: {message}")]
    Failed { category: String, message: String },
}

impl HandlerError {
    /// Create a handler failure in the given category.
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerError::Failed {
            category: category.into(),
            message: message.into(),
        }
    }

    /// The category used for error-policy lookup.
    pub fn category(&self) -> &str {
        match self {
            HandlerError::NoHandler(_) => "no-handler",
            HandlerError::Deserialization(_) => "deserialization",
            HandlerError::Failed { category, .. } => category,
        }
    }
}

/// A listener or sending agent could not be built for an address.
#[derive(Debug, Error)]
#[error("transport endpoint {uri}: {message}")]
pub struct TransportEndpointError {
    pub uri: Url,
    pub message: String,
    #[source]
    pub source: Box<BusError>,
}

impl TransportEndpointError {
    pub fn new(uri: Url, message: impl Into<String>, source: BusError) -> Self {
        Self {
            uri,
            message: message.into(),
            source: Box::new(source),
        }
    }
}

/// Top-level runtime error.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("sending agent for {0} has not been started")]
    NotStarted(Url),

    #[error("no transport registered for scheme '{0}'")]
    UnknownScheme(String),

    #[error("no route for message type '{0}'")]
    NoRoutes(String),

    #[error("receiver at {0} failed to process the batch")]
    ReceiverFailure(Url),

    #[error("receiver at {0} is too busy to accept the batch")]
    ReceiverBusy(Url),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("reply watch for envelope {0} was abandoned")]
    ReplyAbandoned(Uuid),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("messaging runtime has shut down")]
    Shutdown,

    #[error(transparent)]
    Endpoint(#[from] Box<TransportEndpointError>),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl BusError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout(_))
    }

    /// True when the failure means the store session is unusable.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            BusError::Persistence(e) => e.is_connection_failure(),
            _ => false,
        }
    }
}

impl From<TransportEndpointError> for BusError {
    fn from(err: TransportEndpointError) -> Self {
        BusError::Endpoint(Box::new(err))
    }
}

impl From<url::ParseError> for BusError {
    fn from(err: url::ParseError) -> Self {
        BusError::Configuration(format!("invalid uri: {err}"))
    }
}
