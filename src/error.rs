use thiserror::Error;

/// Failure reported by the broker client for one send attempt.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SendError {
    /// The broker is throttling this client.
    #[error("server busy: {0}")]
    ServerBusy(String),

    /// The link to the broker broke while the send was outstanding.
    #[error("communication failure: {0}")]
    Communication(String),

    #[error("messaging entity not found: {0}")]
    EntityNotFound(String),

    #[error("send failed: {0}")]
    Other(String),
}

impl SendError {
    /// Throttling and communication breaks are expected to clear up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::ServerBusy(_) | SendError::Communication(_))
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("missing required collaborator: {0}")]
    MissingCollaborator(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    /// A [`ConnectionHandler`](crate::ConnectionHandler) could not supply a sender.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("transport has been disposed")]
    Disposed,

    #[error("failed to dispose {resource}: {reason}")]
    Dispose {
        resource: &'static str,
        reason: String,
    },
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Serialization(e.to_string())
    }
}
