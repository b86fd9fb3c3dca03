//! WebSocket close codes and reasons shared by the relay and the client
//! supervisor.

pub const NORMAL: u16 = 1000;
pub const GOING_AWAY: u16 = 1001;
pub const POLICY: u16 = 1008;
pub const TRY_AGAIN_LATER: u16 = 1013;

pub const REASON_REPLACED: &str = "replaced by newer registration";
pub const REASON_HEARTBEAT_TIMEOUT: &str = "heartbeat timeout";
pub const REASON_ROOM_FULL: &str = "room capacity exceeded";
pub const REASON_LEFT: &str = "participant left";

/// Codes a client treats as an intentional close that must not trigger a
/// reconnect.
pub fn is_normal(code: u16) -> bool {
    matches!(code, NORMAL | GOING_AWAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn only_normal_and_going_away_are_intentional() {
        assert!(is_normal(NORMAL));
        assert!(is_normal(GOING_AWAY));
        assert!(!is_normal(POLICY));
        assert!(!is_normal(1006));
    }
}
