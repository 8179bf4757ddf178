pub mod channel;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;

pub use channel::{ChannelEvent, RoomChannel};
pub use error::SignalingError;
