pub mod error;
pub mod role;
pub mod session;

pub use error::SessionError;
pub use role::{Role, RoomInfo};
pub use session::{ConnectionSnapshot, RoomSession, SessionEvent, SessionOptions};
