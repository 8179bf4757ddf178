use serde::{Deserialize, Serialize};

/// An opaque session description as produced by the RTC stack during
/// offer/answer negotiation. Mirrors the init dictionary the relay forwards
/// verbatim between peers.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SessionDescription {
    /// Either `"offer"` or `"answer"`.
    #[serde(rename = "type")]
    pub sdp_type: String,
    /// The raw SDP blob.
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate. Field names match the init dictionary the relay
/// forwards verbatim between peers.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment")]
    pub username_fragment: Option<String>,
}

/// Represents a signaling envelope exchanged with the room relay.
///
/// The relay fans envelopes out to all members of a room, so every client
/// may observe envelopes that are not addressed to it; `receiver_id` always
/// identifies the receiver-side participant of the logical link, regardless
/// of which direction the envelope travels.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind")]
pub enum SignalEnvelope {
    /// A session offer created by the broadcaster for one receiver.
    ///
    /// Sent after the receiver signalled readiness with
    /// [`SignalEnvelope::JoinChannelRequest`]. The receiver replies with a
    /// [`SignalEnvelope::Answer`] for the same logical link.
    #[serde(rename = "webRTC-offer", rename_all = "camelCase")]
    Offer {
        offer: SessionDescription,
        broadcaster_id: String,
        receiver_id: String,
    },
    /// A session answer created by a receiver in response to an offer.
    #[serde(rename = "webRTC-answer", rename_all = "camelCase")]
    Answer {
        answer: SessionDescription,
        broadcaster_id: String,
        receiver_id: String,
    },
    /// An ICE candidate trickled by either side during connection setup.
    ///
    /// Candidates may arrive before or after the corresponding answer; the
    /// consumer must tolerate either order.
    #[serde(rename = "webRTC-candidate", rename_all = "camelCase")]
    Candidate {
        candidate: IceCandidate,
        broadcaster_id: String,
        receiver_id: String,
    },
    /// Membership notification: a user joined the room.
    #[serde(rename = "user-joined", rename_all = "camelCase")]
    UserJoined { user_id: String },
    /// Membership notification: a user left the room.
    #[serde(rename = "user-left", rename_all = "camelCase")]
    UserLeft { user_id: String },
    /// A receiver asking the broadcaster to start offer generation for it.
    ///
    /// The broadcaster also sends this toward a freshly joined user as an
    /// invitation; only the envelope sent *by* the receiver triggers offer
    /// generation.
    #[serde(rename = "join-channel-request", rename_all = "camelCase")]
    JoinChannelRequest {
        broadcaster_id: String,
        receiver_id: String,
    },
    /// Sent by the broadcaster when a user left, or by a receiver that stops
    /// listening voluntarily.
    #[serde(rename = "leave-channel-request", rename_all = "camelCase")]
    LeaveChannelRequest {
        broadcaster_id: String,
        receiver_id: String,
    },
    /// Announcement that the broadcaster attached its outbound audio.
    /// Receivers configured to auto-listen react by requesting to join.
    #[serde(rename = "started-broadcast")]
    StartedBroadcast,
}

impl SignalEnvelope {
    /// Serializes a [`SignalEnvelope`] into a JSON string.
    pub fn serialize(envelope: &Self) -> serde_json::error::Result<String> {
        serde_json::to_string(envelope)
    }

    /// Deserializes a JSON string into a [`SignalEnvelope`].
    pub fn deserialize(envelope: &str) -> serde_json::error::Result<Self> {
        serde_json::from_str(envelope)
    }
}
