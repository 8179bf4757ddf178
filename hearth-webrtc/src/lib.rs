pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod registry;

pub use config::IceConfig;
pub use error::WebrtcError;
pub use media::{
    AudioSource, EncodedAudioFrame, RemoteAudioRenderer, SenderBinding, TrackFeed,
    attach_local_audio,
};
pub use peer::{NegotiationState, Peer, PeerConnectionState, PeerEvent};
pub use registry::PeerRegistry;
