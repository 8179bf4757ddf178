/// Room metadata the session reads at join time. The room's lifecycle is
/// owned by the membership collaborator; the session only reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub room_id: String,
    /// Identity of the owning user, who is the room's sole broadcaster.
    pub broadcaster_id: String,
}

/// Which half of the protocol this participant runs.
///
/// Resolved exactly once at (re)join and fixed for the lifetime of the room
/// membership. A mid-session change of room ownership is not observed; the
/// stale role persists until the participant rejoins. This is a known
/// limitation, not an oversight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Pushes outbound audio to every other member. Exactly one per room.
    Broadcaster,
    /// Maintains a single connection toward the broadcaster.
    Receiver,
}

impl Role {
    pub fn resolve(room: &RoomInfo, local_user_id: &str) -> Self {
        if room.broadcaster_id == local_user_id {
            Role::Broadcaster
        } else {
            Role::Receiver
        }
    }

    pub fn is_broadcaster(self) -> bool {
        self == Role::Broadcaster
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn room() -> RoomInfo {
        RoomInfo {
            room_id: "room1".to_string(),
            broadcaster_id: "user1".to_string(),
        }
    }

    #[test]
    fn owner_is_broadcaster() {
        assert_eq!(Role::resolve(&room(), "user1"), Role::Broadcaster);
        assert!(Role::resolve(&room(), "user1").is_broadcaster());
    }

    #[test]
    fn everyone_else_is_receiver() {
        assert_eq!(Role::resolve(&room(), "user2"), Role::Receiver);
        assert!(!Role::resolve(&room(), "user2").is_broadcaster());
    }
}
