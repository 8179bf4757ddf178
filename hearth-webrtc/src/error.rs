use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebrtcError {
    /// A connection for the given user already exists. Invariant violation;
    /// the operation is rejected without mutating the registry.
    #[error("duplicate connection for user {0}")]
    DuplicateConnection(String),
    /// The local capture device could not be acquired. Peer connections are
    /// left untouched.
    #[error("media acquisition failed: {0}")]
    MediaAcquisitionFailed(String),
    /// The connection has been closed; no further negotiation is possible.
    #[error("connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Other(#[from] Box<anyhow::Error>),
}

impl From<anyhow::Error> for WebrtcError {
    fn from(err: anyhow::Error) -> Self {
        WebrtcError::Other(Box::new(err))
    }
}
