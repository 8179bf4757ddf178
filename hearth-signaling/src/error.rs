use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalingError {
    /// The channel is no longer usable. Fatal for the current room session:
    /// the owner must reconnect and rebuild role and registry from scratch.
    #[error("channel closed")]
    ChannelClosed,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("transport error: {0}")]
    Transport(#[from] Box<anyhow::Error>),
}

impl From<anyhow::Error> for SignalingError {
    fn from(err: anyhow::Error) -> Self {
        Self::Transport(Box::new(err))
    }
}
