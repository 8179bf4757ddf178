pub mod envelope;

pub use envelope::{IceCandidate, SessionDescription, SignalEnvelope};
