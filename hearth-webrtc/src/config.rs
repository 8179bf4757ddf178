use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

/// Single public STUN server used for NAT traversal by default.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun2.1.google.com:19302";

pub const PEER_EVENTS_CAPACITY: usize = 64;
pub const FEED_CHANNEL_SIZE: usize = 64;

pub const AUDIO_TRACK_ID: &str = "audio";
pub const AUDIO_TRACK_STREAM_ID: &str = "broadcast";
pub const AUDIO_CHANNELS: u16 = 1;
pub const AUDIO_SAMPLE_RATE: u32 = 48_000;
pub const FRAME_DURATION_MS: u64 = 20;

/// ICE server configuration applied to every peer connection of a session.
#[derive(Debug, Clone)]
pub struct IceConfig {
    pub urls: Vec<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            urls: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

impl IceConfig {
    /// Config without any STUN servers; connections gather host candidates
    /// only. Useful for tests and single-network deployments.
    pub fn none() -> Self {
        Self { urls: Vec::new() }
    }
}

pub trait IntoRtc {
    fn into_rtc(self) -> RTCConfiguration;
}

impl IntoRtc for IceConfig {
    fn into_rtc(self) -> RTCConfiguration {
        let ice_servers = if self.urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.urls,
                ..Default::default()
            }]
        };

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}
