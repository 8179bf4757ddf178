use crate::role::Role;
use hearth_signaling::SignalingError;
use hearth_webrtc::WebrtcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The signaling channel is gone. Fatal for the session: the owner must
    /// rejoin and rebuild role and registry from scratch.
    #[error("channel closed")]
    ChannelClosed,
    /// The requested operation belongs to the other half of the protocol.
    #[error("operation not valid for role {0:?}")]
    WrongRole(Role),
    /// A second `listen_to_broadcaster` without an intervening
    /// `stop_listening` is rejected.
    #[error("already listening to the broadcaster")]
    AlreadyListening,
    /// A second `start_broadcasting` without an intervening
    /// `stop_broadcasting` is rejected.
    #[error("broadcast already active")]
    AlreadyBroadcasting,
    #[error("duplicate connection for user {0}")]
    DuplicateConnection(String),
    /// The local capture device could not be acquired. No connection state
    /// was touched.
    #[error("media acquisition failed: {0}")]
    MediaAcquisitionFailed(String),
    /// Negotiation with one remote peer failed. Isolated: sibling
    /// connections are unaffected.
    #[error("negotiation with user {user_id} failed")]
    NegotiationFailed { user_id: String },
    #[error(transparent)]
    Signaling(SignalingError),
    #[error(transparent)]
    Webrtc(WebrtcError),
}

impl From<SignalingError> for SessionError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::ChannelClosed => SessionError::ChannelClosed,
            other => SessionError::Signaling(other),
        }
    }
}

impl From<WebrtcError> for SessionError {
    fn from(err: WebrtcError) -> Self {
        match err {
            WebrtcError::DuplicateConnection(user_id) => {
                SessionError::DuplicateConnection(user_id)
            }
            WebrtcError::MediaAcquisitionFailed(reason) => {
                SessionError::MediaAcquisitionFailed(reason)
            }
            other => SessionError::Webrtc(other),
        }
    }
}
